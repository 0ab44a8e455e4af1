use crate::shared::frame::Frame;

/// A raw detector hit in frame pixel coordinates, before any filtering.
///
/// Corners may lie outside the frame; the detection stage clamps them.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Detection {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
    pub confidence: f64,
}

/// Domain interface for face detection.
///
/// Implementations may keep per-instance scratch state, hence `&mut self`;
/// each detection worker owns its own detector.
pub trait FaceDetector: Send {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, Box<dyn std::error::Error>>;
}
