use std::sync::Arc;

use crate::detection::domain::face_detector::{Detection, FaceDetector};
use crate::shared::face_box::{BoxRect, FaceBox};
use crate::shared::frame::Frame;

/// Acceptance rules for raw detections.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DetectionFilter {
    /// Minimum detector confidence, inclusive.
    pub confidence_threshold: f64,
    /// Minimum length of the longer box edge in pixels, inclusive.
    pub min_face_size: u32,
    /// Fraction of the box size added on every side of the crop region.
    pub crop_padding: f64,
}

impl DetectionFilter {
    /// Clamps `detection` to the frame and applies the thresholds.
    ///
    /// The size check runs on the clamped box; padding only widens the crop
    /// region and never influences acceptance.
    pub fn accept(&self, detection: &Detection, frame: &Arc<Frame>) -> Option<FaceBox> {
        if detection.confidence.is_nan() || detection.confidence < self.confidence_threshold {
            return None;
        }
        let rect = clamp_to_frame(detection, frame.width(), frame.height())?;
        if rect.longer_edge() < self.min_face_size {
            return None;
        }
        let crop_rect = rect.padded(self.crop_padding, frame.width(), frame.height());
        Some(FaceBox::new(
            rect,
            crop_rect,
            detection.confidence,
            Arc::clone(frame),
        ))
    }
}

/// Snaps a floating-point box outward to whole pixels inside the frame.
///
/// Returns `None` when nothing of the box remains inside the frame.
fn clamp_to_frame(d: &Detection, frame_w: u32, frame_h: u32) -> Option<BoxRect> {
    if !(d.x1.is_finite() && d.y1.is_finite() && d.x2.is_finite() && d.y2.is_finite()) {
        return None;
    }
    let x1 = d.x1.min(d.x2).floor().clamp(0.0, frame_w as f64) as u32;
    let y1 = d.y1.min(d.y2).floor().clamp(0.0, frame_h as f64) as u32;
    let x2 = d.x1.max(d.x2).ceil().clamp(0.0, frame_w as f64) as u32;
    let y2 = d.y1.max(d.y2).ceil().clamp(0.0, frame_h as f64) as u32;
    if x2 <= x1 || y2 <= y1 {
        return None;
    }
    Some(BoxRect {
        x: x1,
        y: y1,
        width: x2 - x1,
        height: y2 - y1,
    })
}

/// Runs a detector on one frame and yields the faces worth recognizing.
pub struct DetectionStage {
    detector: Box<dyn FaceDetector>,
    filter: DetectionFilter,
}

impl DetectionStage {
    pub fn new(detector: Box<dyn FaceDetector>, filter: DetectionFilter) -> Self {
        Self { detector, filter }
    }

    /// Detects faces in `frame`.
    ///
    /// The returned iterator is lazy and finite; each accepted box holds a
    /// reference to the frame. A detector error is returned as-is so the
    /// caller can drop the frame and keep going.
    pub fn detect(
        &mut self,
        frame: Arc<Frame>,
    ) -> Result<impl Iterator<Item = FaceBox>, Box<dyn std::error::Error>> {
        let detections = self.detector.detect(&frame)?;
        let filter = self.filter;
        Ok(detections
            .into_iter()
            .filter_map(move |d| filter.accept(&d, &frame)))
    }
}
