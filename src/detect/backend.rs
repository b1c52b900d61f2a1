use anyhow::Result;

use crate::detect::result::Detection;

/// Detector backend trait.
///
/// The detection model is an external collaborator; this trait is the seam
/// the server calls it through. Each connection owns its own instance, so
/// implementations need `Send` but never `Sync`.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on one image.
    ///
    /// `image` is the frame's encoded bytes exactly as the capture side sent
    /// them. An `Err` is treated as a transient failure of this frame only.
    fn detect(&mut self, image: &[u8], width: u32, height: u32) -> Result<Vec<Detection>>;

    /// Optional warm-up hook, run once before the first frame.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

impl DetectorBackend for Box<dyn DetectorBackend> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn detect(&mut self, image: &[u8], width: u32, height: u32) -> Result<Vec<Detection>> {
        (**self).detect(image, width, height)
    }

    fn warm_up(&mut self) -> Result<()> {
        (**self).warm_up()
    }
}
