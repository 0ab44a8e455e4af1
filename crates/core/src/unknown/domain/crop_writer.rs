use std::path::Path;

use crate::shared::frame::FaceCrop;

/// Writes a face crop to an image file.
pub trait CropWriter: Send {
    fn write(&self, path: &Path, crop: &FaceCrop) -> Result<(), Box<dyn std::error::Error>>;
}
