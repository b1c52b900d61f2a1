//! Frame capture.
//!
//! Sources produce encoded images; `spawn_capture` runs one on its own thread
//! and hands stamped `Frame`s to the sender through a bounded channel. When the
//! sender falls behind, new frames are dropped rather than queued, so the
//! lockstep loop always works on recent images.

mod directory;
mod synthetic;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::error::ResourceError;
use crate::frame::{now_ms, Frame};

pub use directory::{DirectoryConfig, DirectorySource};
pub use synthetic::{SyntheticConfig, SyntheticSource};

/// Consecutive read failures after which capture gives up.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 30;

const RETRY_PAUSE: Duration = Duration::from_millis(100);

/// One captured, already-encoded image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CapturedImage {
    pub width: u16,
    pub height: u16,
    pub bytes: Vec<u8>,
}

pub trait FrameSource: Send {
    /// Device name for logs and errors.
    fn describe(&self) -> String;

    /// Prepare the device. Failure here is a start-up error.
    fn open(&mut self) -> Result<(), ResourceError>;

    /// Block until the next image is available.
    fn next_image(&mut self) -> Result<CapturedImage>;
}

impl FrameSource for Box<dyn FrameSource> {
    fn describe(&self) -> String {
        (**self).describe()
    }

    fn open(&mut self) -> Result<(), ResourceError> {
        (**self).open()
    }

    fn next_image(&mut self) -> Result<CapturedImage> {
        (**self).next_image()
    }
}

/// Consumer end of a running capture thread.
pub struct CaptureHandle {
    rx: Receiver<Frame>,
    stop: Arc<AtomicBool>,
    captured: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
    join: Option<JoinHandle<()>>,
}

impl CaptureHandle {
    /// Next frame, or `Ok(None)` if none arrived within `timeout`.
    /// Errors once the capture thread has ended.
    pub fn next_frame(&self, timeout: Duration) -> Result<Option<Frame>> {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Ok(Some(frame)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(anyhow!("capture stopped")),
        }
    }

    pub fn captured(&self) -> u64 {
        self.captured.load(Ordering::Relaxed)
    }

    /// Frames discarded because the consumer was busy.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn stop(mut self) -> Result<()> {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join().map_err(|_| anyhow!("capture thread panicked"))?;
        }
        Ok(())
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

/// Open `source` and start producing frames on a background thread.
///
/// Frames are numbered from 1 and stamped with the wall clock at capture.
/// `capacity` is the handoff depth (at least 1).
pub fn spawn_capture<S>(mut source: S, capacity: usize) -> Result<CaptureHandle>
where
    S: FrameSource + 'static,
{
    source.open()?;
    log::info!("capture opened: {}", source.describe());

    let (tx, rx) = mpsc::sync_channel(capacity.max(1));
    let stop = Arc::new(AtomicBool::new(false));
    let captured = Arc::new(AtomicU64::new(0));
    let dropped = Arc::new(AtomicU64::new(0));

    let thread_stop = Arc::clone(&stop);
    let thread_captured = Arc::clone(&captured);
    let thread_dropped = Arc::clone(&dropped);
    let join = std::thread::Builder::new()
        .name("sinkwatch-capture".to_string())
        .spawn(move || {
            let mut seq: u32 = 0;
            let mut failures = 0u32;
            while !thread_stop.load(Ordering::SeqCst) {
                let image = match source.next_image() {
                    Ok(image) => {
                        failures = 0;
                        image
                    }
                    Err(err) => {
                        failures += 1;
                        log::warn!(
                            "capture read failed ({}/{}): {:#}",
                            failures,
                            MAX_CONSECUTIVE_FAILURES,
                            err
                        );
                        if failures >= MAX_CONSECUTIVE_FAILURES {
                            log::error!("giving up on {} after {} failed reads", source.describe(), failures);
                            break;
                        }
                        std::thread::sleep(RETRY_PAUSE);
                        continue;
                    }
                };

                seq = match seq.checked_add(1) {
                    Some(next) => next,
                    None => {
                        log::error!("frame sequence exhausted; stopping capture");
                        break;
                    }
                };
                thread_captured.fetch_add(1, Ordering::Relaxed);
                let frame = Frame::new(seq, now_ms(), image.width, image.height, image.bytes);
                match tx.try_send(frame) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        thread_dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(TrySendError::Disconnected(_)) => break,
                }
            }
            log::info!("capture thread exiting after {} frames", seq);
        })?;

    Ok(CaptureHandle {
        rx,
        stop,
        captured,
        dropped,
        join: Some(join),
    })
}
