use anyhow::{anyhow, Result};

use crate::detect::backend::DetectorBackend;
use crate::detect::classes::{FORK, PERSON, SPOON};
use crate::detect::result::{BoundingBox, Detection};

/// Frames per phase of the default scripted scene.
const SCENE_PHASE_FRAMES: usize = 30;

/// Scripted backend for tests and demos. Ignores pixels and replays a fixed
/// sequence of detection lists, cycling forever.
pub struct StubBackend {
    script: Vec<Vec<Detection>>,
    cursor: usize,
    fail_every: Option<u64>,
    calls: u64,
}

impl StubBackend {
    /// Replay `script` one entry per frame. An empty script never detects anything.
    pub fn new(script: Vec<Vec<Detection>>) -> Self {
        Self {
            script,
            cursor: 0,
            fail_every: None,
            calls: 0,
        }
    }

    /// Always report the same detections.
    pub fn fixed(detections: Vec<Detection>) -> Self {
        Self::new(vec![detections])
    }

    /// Fail every `n`th call, to exercise detector-failure handling.
    pub fn failing_every(mut self, n: u64) -> Self {
        self.fail_every = (n > 0).then_some(n);
        self
    }

    /// A sink with a fork and a hand for a while, then fork and spoon alone.
    pub fn kitchen_scene() -> Self {
        let fork = Detection::new(FORK, 0.82, BoundingBox::new(300.0, 260.0, 60.0, 25.0));
        let spoon = Detection::new(SPOON, 0.77, BoundingBox::new(380.0, 280.0, 55.0, 20.0));
        let hand = Detection::new(PERSON, 0.91, BoundingBox::new(280.0, 120.0, 160.0, 200.0));

        let mut script = Vec::with_capacity(SCENE_PHASE_FRAMES * 2);
        script.extend(std::iter::repeat(vec![fork.clone(), hand]).take(SCENE_PHASE_FRAMES));
        script.extend(std::iter::repeat(vec![fork, spoon]).take(SCENE_PHASE_FRAMES));
        Self::new(script)
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::kitchen_scene()
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, _image: &[u8], _width: u32, _height: u32) -> Result<Vec<Detection>> {
        self.calls += 1;
        if let Some(n) = self.fail_every {
            if self.calls % n == 0 {
                return Err(anyhow!("stub detector failure on call {}", self.calls));
            }
        }
        if self.script.is_empty() {
            return Ok(Vec::new());
        }
        let detections = self.script[self.cursor].clone();
        self.cursor = (self.cursor + 1) % self.script.len();
        Ok(detections)
    }
}
