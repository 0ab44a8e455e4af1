use crate::shared::frame::Frame;

/// Geometry and nominal rate of an opened frame source.
#[derive(Clone, Debug, PartialEq)]
pub struct SourceInfo {
    pub width: u32,
    pub height: u32,
    /// Nominal frames per second; 0 when the source has no fixed rate.
    pub fps: f64,
    pub description: String,
}

/// Produces frames for the pipeline, typically from a camera.
///
/// Implementations own the device or file handles; the pipeline only sees
/// [`Frame`]s stamped with their capture instant and a sequence index.
pub trait FrameSource: Send {
    /// Opens the underlying device and reports its geometry.
    fn open(&mut self) -> Result<SourceInfo, Box<dyn std::error::Error>>;

    /// Returns an iterator over frames in capture order.
    ///
    /// A per-frame error does not end the stream; the iterator ends when
    /// the source is exhausted.
    fn frames(
        &mut self,
    ) -> Box<dyn Iterator<Item = Result<Frame, Box<dyn std::error::Error>>> + '_>;

    /// Releases any resources held by the source.
    fn close(&mut self);
}
