use std::time::Duration;

use crate::wire::ErrorCode;

/// Axis-aligned box in image pixel coordinates (top-left origin).
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, w: f32, h: f32) -> Self {
        Self { x, y, w, h }
    }

    /// Build from corner coordinates (x1, y1, x2, y2).
    pub fn from_corners(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self {
            x: x1.min(x2),
            y: y1.min(y2),
            w: (x2 - x1).abs(),
            h: (y2 - y1).abs(),
        }
    }

    pub fn right(&self) -> f32 {
        self.x + self.w
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.h
    }

    pub fn area(&self) -> f32 {
        self.w.max(0.0) * self.h.max(0.0)
    }

    /// Area of overlap with `other` (0 when disjoint).
    pub fn intersection(&self, other: &BoundingBox) -> f32 {
        let w = self.right().min(other.right()) - self.x.max(other.x);
        let h = self.bottom().min(other.bottom()) - self.y.max(other.y);
        if w <= 0.0 || h <= 0.0 {
            0.0
        } else {
            w * h
        }
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let inter = self.intersection(other);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }

    /// Shortest edge-to-edge distance; 0 when the boxes touch or overlap.
    pub fn gap(&self, other: &BoundingBox) -> f32 {
        let dx = (other.x - self.right()).max(self.x - other.right()).max(0.0);
        let dy = (other.y - self.bottom()).max(self.y - other.bottom()).max(0.0);
        (dx * dx + dy * dy).sqrt()
    }
}

/// One detected object instance.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub class_id: u16,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

impl Detection {
    pub fn new(class_id: u16, confidence: f32, bbox: BoundingBox) -> Self {
        Self {
            class_id,
            confidence,
            bbox,
        }
    }
}

/// Error flag carried by a result whose detector run failed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResultError {
    pub code: ErrorCode,
    pub message: String,
}

/// Detections for one frame, matched to it by `seq`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DetectionResult {
    /// Sequence number of the originating frame.
    pub seq: u32,
    /// Time spent producing this result. On the client this is the measured
    /// round trip; on the server it is the detector time.
    pub latency: Duration,
    pub detections: Vec<Detection>,
    /// Set when the detector failed; `detections` is then empty.
    pub error: Option<ResultError>,
}

impl DetectionResult {
    pub fn new(seq: u32, detections: Vec<Detection>) -> Self {
        Self {
            seq,
            latency: Duration::ZERO,
            detections,
            error: None,
        }
    }

    /// Empty, error-flagged result for `seq`.
    pub fn failed(seq: u32, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            seq,
            latency: Duration::ZERO,
            detections: Vec::new(),
            error: Some(ResultError {
                code,
                message: message.into(),
            }),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}
