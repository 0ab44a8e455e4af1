/// ArcFace face embedder using ONNX Runtime.
///
/// Resizes each crop to 112×112, normalizes pixels to `[-1, 1]` and returns
/// the model's raw output vector. One session is shared by all recognition
/// workers behind a mutex.
use std::path::Path;
use std::sync::Mutex;

use crate::recognition::domain::face_embedder::FaceEmbedder;
use crate::shared::frame::FaceCrop;
use crate::shared::onnx_session;

const INPUT_SIZE: usize = 112;
const NORM_MEAN: f32 = 127.5;
const NORM_STD: f32 = 127.5;

pub struct OnnxArcFaceEmbedder {
    session: Mutex<ort::session::Session>,
}

impl OnnxArcFaceEmbedder {
    pub fn new(model_path: &Path, intra_threads: usize) -> Result<Self, Box<dyn std::error::Error>> {
        let session = onnx_session::build_session(model_path, intra_threads)?;
        Ok(Self {
            session: Mutex::new(session),
        })
    }
}

impl FaceEmbedder for OnnxArcFaceEmbedder {
    fn embed(&self, crop: &FaceCrop) -> Result<Vec<f32>, Box<dyn std::error::Error>> {
        let tensor = preprocess(crop)?;
        let input_value = ort::value::Tensor::from_array(tensor)?;
        let mut session = self
            .session
            .lock()
            .map_err(|e| format!("Lock poisoned: {e}"))?;
        let outputs = session.run(ort::inputs![input_value])?;
        let embedding = outputs[0].try_extract_array::<f32>()?;
        let values = embedding
            .as_slice()
            .ok_or("Cannot get embedding slice")?
            .to_vec();
        Ok(values)
    }
}

/// Resizes a crop to 112×112 (pixel-centre sampling) in NCHW layout.
fn preprocess(crop: &FaceCrop) -> Result<ndarray::Array4<f32>, Box<dyn std::error::Error>> {
    let src_w = crop.width as usize;
    let src_h = crop.height as usize;
    if crop.channels != 3 || src_w == 0 || src_h == 0 || crop.data.len() != src_w * src_h * 3 {
        return Err(format!(
            "Invalid face crop {}x{}x{} ({} bytes)",
            crop.width,
            crop.height,
            crop.channels,
            crop.data.len()
        )
        .into());
    }

    let mut tensor = ndarray::Array4::<f32>::zeros((1, 3, INPUT_SIZE, INPUT_SIZE));
    for y in 0..INPUT_SIZE {
        let src_y = (((y as f64 + 0.5) * src_h as f64 / INPUT_SIZE as f64) as usize).min(src_h - 1);
        for x in 0..INPUT_SIZE {
            let src_x =
                (((x as f64 + 0.5) * src_w as f64 / INPUT_SIZE as f64) as usize).min(src_w - 1);
            let offset = (src_y * src_w + src_x) * 3;
            for c in 0..3 {
                tensor[[0, c, y, x]] = (crop.data[offset + c] as f32 - NORM_MEAN) / NORM_STD;
            }
        }
    }
    Ok(tensor)
}
