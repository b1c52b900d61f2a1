use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Round trips per second over a sliding time window.
#[derive(Debug)]
pub struct FpsMeter {
    window: Duration,
    stamps: VecDeque<Instant>,
}

impl FpsMeter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            stamps: VecDeque::new(),
        }
    }

    pub fn record(&mut self, at: Instant) {
        self.stamps.push_back(at);
        self.evict(at);
    }

    /// Rate at `now`. Zero until two samples fall inside the window.
    pub fn rate(&mut self, now: Instant) -> f64 {
        self.evict(now);
        if self.stamps.len() < 2 {
            return 0.0;
        }
        let (Some(first), Some(last)) = (self.stamps.front(), self.stamps.back()) else {
            return 0.0;
        };
        let span = last.saturating_duration_since(*first).as_secs_f64();
        if span <= 0.0 {
            return 0.0;
        }
        (self.stamps.len() - 1) as f64 / span
    }

    pub fn reset(&mut self) {
        self.stamps.clear();
    }

    fn evict(&mut self, now: Instant) {
        while let Some(front) = self.stamps.front() {
            if now.saturating_duration_since(*front) > self.window {
                self.stamps.pop_front();
            } else {
                break;
            }
        }
    }
}

impl Default for FpsMeter {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}
