use std::path::Path;

use image::codecs::jpeg::JpegEncoder;

use crate::shared::frame::FaceCrop;
use crate::unknown::domain::crop_writer::CropWriter;

pub const DEFAULT_JPEG_QUALITY: u8 = 90;

/// Encodes RGB face crops as JPEG files using the `image` crate.
pub struct JpegCropWriter {
    quality: u8,
}

impl JpegCropWriter {
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }
}

impl Default for JpegCropWriter {
    fn default() -> Self {
        Self::new(DEFAULT_JPEG_QUALITY)
    }
}

impl CropWriter for JpegCropWriter {
    fn write(&self, path: &Path, crop: &FaceCrop) -> Result<(), Box<dyn std::error::Error>> {
        if crop.channels != 3 {
            return Err(format!("Expected an RGB crop, got {} channels", crop.channels).into());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let img = image::RgbImage::from_raw(crop.width, crop.height, crop.data.clone())
            .ok_or("Crop data does not match its dimensions")?;

        let file = std::fs::File::create(path)?;
        let mut encoder = JpegEncoder::new_with_quality(std::io::BufWriter::new(file), self.quality);
        encoder.encode_image(&img)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_crop(width: u32, height: u32, rgb: [u8; 3]) -> FaceCrop {
        let mut data = Vec::with_capacity((width * height * 3) as usize);
        for _ in 0..(width * height) {
            data.extend_from_slice(&rgb);
        }
        FaceCrop {
            data,
            width,
            height,
            channels: 3,
        }
    }

    #[test]
    fn test_write_creates_decodable_jpeg() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("faces").join("crop.jpg");
        JpegCropWriter::default()
            .write(&path, &make_crop(64, 48, [200, 100, 50]))
            .unwrap();

        let img = image::open(&path).unwrap().to_rgb8();
        assert_eq!((img.width(), img.height()), (64, 48));
        let px = img.get_pixel(32, 24).0;
        // JPEG is lossy; a flat colour survives within a small tolerance.
        assert!((px[0] as i32 - 200).abs() < 8);
        assert!((px[1] as i32 - 100).abs() < 8);
        assert!((px[2] as i32 - 50).abs() < 8);
    }

    #[test]
    fn test_rejects_non_rgb_crop() {
        let dir = tempfile::tempdir().unwrap();
        let crop = FaceCrop {
            data: vec![0; 16],
            width: 4,
            height: 4,
            channels: 1,
        };
        assert!(JpegCropWriter::default()
            .write(&dir.path().join("x.jpg"), &crop)
            .is_err());
    }

    #[test]
    fn test_rejects_mismatched_data() {
        let dir = tempfile::tempdir().unwrap();
        let crop = FaceCrop {
            data: vec![0; 10],
            width: 4,
            height: 4,
            channels: 3,
        };
        assert!(JpegCropWriter::default()
            .write(&dir.path().join("x.jpg"), &crop)
            .is_err());
    }
}
