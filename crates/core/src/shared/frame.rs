use std::time::Instant;

use ndarray::ArrayView3;

/// A single captured camera frame: contiguous RGB bytes in row-major order.
///
/// Frames move by value through the pipeline queues. Once detection has run,
/// the frame is wrapped in an `Arc` so every face box cut from it can reach
/// the pixels until recognition finishes.
#[derive(Clone, Debug)]
pub struct Frame {
    data: Vec<u8>,
    width: u32,
    height: u32,
    channels: u8,
    index: usize,
    captured_at: Instant,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, channels: u8, index: usize) -> Self {
        Self::captured(data, width, height, channels, index, Instant::now())
    }

    pub fn captured(
        data: Vec<u8>,
        width: u32,
        height: u32,
        channels: u8,
        index: usize,
        captured_at: Instant,
    ) -> Self {
        debug_assert_eq!(
            data.len(),
            (width as usize) * (height as usize) * (channels as usize),
            "data length must equal width * height * channels"
        );
        Self {
            data,
            width,
            height,
            channels,
            index,
            captured_at,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channels(&self) -> u8 {
        self.channels
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    pub fn as_ndarray(&self) -> ArrayView3<'_, u8> {
        ArrayView3::from_shape(self.shape(), &self.data)
            .expect("Frame data length must match dimensions")
    }

    /// Copies a rectangular region out of the frame.
    ///
    /// The rectangle is intersected with the frame bounds; `None` when the
    /// intersection is empty.
    pub fn crop(&self, x: u32, y: u32, width: u32, height: u32) -> Option<FaceCrop> {
        let x2 = x.saturating_add(width).min(self.width);
        let y2 = y.saturating_add(height).min(self.height);
        if x >= x2 || y >= y2 {
            return None;
        }
        let w = (x2 - x) as usize;
        let h = (y2 - y) as usize;
        let c = self.channels as usize;
        let stride = self.width as usize * c;

        let mut data = Vec::with_capacity(w * h * c);
        for row in y as usize..y2 as usize {
            let start = row * stride + x as usize * c;
            data.extend_from_slice(&self.data[start..start + w * c]);
        }
        Some(FaceCrop {
            data,
            width: w as u32,
            height: h as u32,
            channels: self.channels,
        })
    }

    fn shape(&self) -> (usize, usize, usize) {
        (
            self.height as usize,
            self.width as usize,
            self.channels as usize,
        )
    }
}

/// Pixels cut out of a [`Frame`], owned independently of it.
#[derive(Clone, Debug, PartialEq)]
pub struct FaceCrop {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub channels: u8,
}
