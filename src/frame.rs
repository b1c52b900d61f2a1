//! Captured frame unit.
//!
//! A `Frame` is produced by the capture side and is immutable once built: the
//! sender borrows it, the server decodes its own copy. Image bytes are opaque to
//! this crate; the encoding (raw RGB, JPEG, ...) is agreed between the capture
//! source and the detector backend out of band.

use std::time::{SystemTime, UNIX_EPOCH};

/// Size of the fixed FRAME payload fields preceding the image bytes.
pub const FRAME_FIELDS_LEN: usize = 4 + 8 + 2 + 2;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    seq: u32,
    timestamp_ms: u64,
    width: u16,
    height: u16,
    image: Vec<u8>,
}

impl Frame {
    pub fn new(seq: u32, timestamp_ms: u64, width: u16, height: u16, image: Vec<u8>) -> Self {
        Self {
            seq,
            timestamp_ms,
            width,
            height,
            image,
        }
    }

    /// Sequence number; strictly increasing for frames sent on one connection.
    pub fn seq(&self) -> u32 {
        self.seq
    }

    /// Capture time in milliseconds since the Unix epoch.
    pub fn timestamp_ms(&self) -> u64 {
        self.timestamp_ms
    }

    pub fn width(&self) -> u16 {
        self.width
    }

    pub fn height(&self) -> u16 {
        self.height
    }

    pub fn image(&self) -> &[u8] {
        &self.image
    }

    pub fn into_image(self) -> Vec<u8> {
        self.image
    }

    /// Payload length this frame occupies on the wire.
    pub fn wire_len(&self) -> usize {
        FRAME_FIELDS_LEN + self.image.len()
    }
}

/// Wall-clock milliseconds since the Unix epoch (0 if the clock is before it).
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
