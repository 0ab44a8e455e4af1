use std::fmt;
use std::sync::Arc;

use crate::shared::frame::{FaceCrop, Frame};

/// Axis-aligned pixel rectangle inside a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BoxRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BoxRect {
    pub fn longer_edge(&self) -> u32 {
        self.width.max(self.height)
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Grows the rectangle by `padding` × its size on every side, clamped
    /// to the frame.
    pub fn padded(&self, padding: f64, frame_w: u32, frame_h: u32) -> BoxRect {
        let pad_x = (self.width as f64 * padding) as i64;
        let pad_y = (self.height as f64 * padding) as i64;
        let x1 = (self.x as i64 - pad_x).max(0);
        let y1 = (self.y as i64 - pad_y).max(0);
        let x2 = (self.x as i64 + self.width as i64 + pad_x).min(frame_w as i64);
        let y2 = (self.y as i64 + self.height as i64 + pad_y).min(frame_h as i64);
        BoxRect {
            x: x1 as u32,
            y: y1 as u32,
            width: (x2 - x1).max(0) as u32,
            height: (y2 - y1).max(0) as u32,
        }
    }
}

/// A detected face that passed the confidence and size filters.
///
/// Holds its source frame only until recognition completes; dropping the
/// last `FaceBox` of a frame releases the frame's pixels.
#[derive(Clone)]
pub struct FaceBox {
    pub rect: BoxRect,
    /// Region actually cut out for recognition (rect plus padding).
    pub crop_rect: BoxRect,
    pub confidence: f64,
    frame: Arc<Frame>,
}

impl FaceBox {
    pub fn new(rect: BoxRect, crop_rect: BoxRect, confidence: f64, frame: Arc<Frame>) -> Self {
        debug_assert!(rect.x + rect.width <= frame.width());
        debug_assert!(rect.y + rect.height <= frame.height());
        Self {
            rect,
            crop_rect,
            confidence,
            frame,
        }
    }

    pub fn frame_index(&self) -> usize {
        self.frame.index()
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    pub fn crop(&self) -> Option<FaceCrop> {
        let r = self.crop_rect;
        self.frame.crop(r.x, r.y, r.width, r.height)
    }
}

impl fmt::Debug for FaceBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaceBox")
            .field("rect", &self.rect)
            .field("crop_rect", &self.crop_rect)
            .field("confidence", &self.confidence)
            .field("frame_index", &self.frame.index())
            .finish()
    }
}
