/// YOLO face detector using ONNX Runtime via `ort`.
///
/// Letterboxes the frame to the model resolution, runs inference, maps the
/// boxes back to frame coordinates and applies greedy NMS. Final
/// confidence and size filtering belong to the detection stage.
use std::path::Path;

use crate::detection::domain::face_detector::{Detection, FaceDetector};
use crate::shared::frame::Frame;
use crate::shared::onnx_session;

/// Fallback input resolution when the model has dynamic dimensions.
const DEFAULT_INPUT_SIZE: u32 = 640;

/// Candidates below this score are discarded before NMS.
pub const DEFAULT_CANDIDATE_CONFIDENCE: f64 = 0.25;

const NMS_IOU_THRESH: f64 = 0.45;

/// YOLO letterbox fill value (114 gray).
const PAD_VALUE: f32 = 114.0 / 255.0;

pub struct OnnxYoloFaceDetector {
    session: ort::session::Session,
    candidate_confidence: f64,
    input_size: u32,
}

impl OnnxYoloFaceDetector {
    /// Loads a YOLO face model.
    ///
    /// The input resolution is read from the model's NCHW input shape,
    /// falling back to 640 when it is dynamic.
    pub fn new(
        model_path: &Path,
        candidate_confidence: f64,
        intra_threads: usize,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let session = onnx_session::build_session(model_path, intra_threads)?;
        let input_size = onnx_session::static_input_size(&session).unwrap_or(DEFAULT_INPUT_SIZE);
        Ok(Self {
            session,
            candidate_confidence,
            input_size,
        })
    }
}

impl FaceDetector for OnnxYoloFaceDetector {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, Box<dyn std::error::Error>> {
        if frame.channels() != 3 {
            return Err(format!("Expected an RGB frame, got {} channels", frame.channels()).into());
        }
        let (input_tensor, letterbox) = letterbox(frame, self.input_size);

        let input_value = ort::value::Tensor::from_array(input_tensor)?;
        let outputs = self.session.run(ort::inputs![input_value])?;
        if outputs.len() == 0 {
            return Err("YOLO model produced no outputs".into());
        }
        let tensor = outputs[0].try_extract_array::<f32>()?;
        let shape = tensor.shape().to_vec();
        if shape.len() != 3 {
            return Err(format!("Unexpected YOLO output shape: {shape:?}").into());
        }
        let data = tensor.as_slice().ok_or("Cannot get tensor slice")?;

        let mut candidates = parse_candidates(data, &shape, self.candidate_confidence, &letterbox);
        Ok(nms(&mut candidates, NMS_IOU_THRESH))
    }
}

/// Scale and offsets that map letterboxed coordinates back to the frame.
#[derive(Clone, Copy, Debug)]
struct Letterbox {
    scale: f64,
    pad_x: u32,
    pad_y: u32,
}

impl Letterbox {
    fn to_frame(&self, x: f64, y: f64) -> (f64, f64) {
        (
            (x - self.pad_x as f64) / self.scale,
            (y - self.pad_y as f64) / self.scale,
        )
    }
}

/// Letterbox-resizes a frame into a `target_size`² NCHW float tensor.
fn letterbox(frame: &Frame, target_size: u32) -> (ndarray::Array4<f32>, Letterbox) {
    let fw = frame.width() as f64;
    let fh = frame.height() as f64;
    let target = target_size as f64;

    let scale = (target / fw).min(target / fh);
    let new_w = ((fw * scale).round() as u32).min(target_size);
    let new_h = ((fh * scale).round() as u32).min(target_size);
    let pad_x = (target_size - new_w) / 2;
    let pad_y = (target_size - new_h) / 2;

    let size = target_size as usize;
    let mut tensor = ndarray::Array4::<f32>::from_elem((1, 3, size, size), PAD_VALUE);

    let src = frame.as_ndarray();
    let src_h = frame.height() as usize;
    let src_w = frame.width() as usize;

    // Nearest-neighbour resize into the padded region
    for y in 0..new_h as usize {
        let src_y = ((y as f64 / scale) as usize).min(src_h - 1);
        for x in 0..new_w as usize {
            let src_x = ((x as f64 / scale) as usize).min(src_w - 1);
            let ty = pad_y as usize + y;
            let tx = pad_x as usize + x;
            for c in 0..3 {
                tensor[[0, c, ty, tx]] = src[[src_y, src_x, c]] as f32 / 255.0;
            }
        }
    }

    (
        tensor,
        Letterbox {
            scale,
            pad_x,
            pad_y,
        },
    )
}

/// Decodes raw YOLO rows `[cx, cy, w, h, conf, ...]` into frame-space boxes.
///
/// Accepts both `[1, features, detections]` and `[1, detections, features]`
/// layouts; the smaller axis is taken to be the feature axis.
fn parse_candidates(
    data: &[f32],
    shape: &[usize],
    min_confidence: f64,
    letterbox: &Letterbox,
) -> Vec<Detection> {
    let transposed = shape[1] < shape[2];
    let (num_dets, num_feats) = if transposed {
        (shape[2], shape[1])
    } else {
        (shape[1], shape[2])
    };
    if num_feats < 5 {
        return Vec::new();
    }

    let feature = |det: usize, f: usize| -> f64 {
        let i = if transposed {
            f * num_dets + det
        } else {
            det * num_feats + f
        };
        data[i] as f64
    };

    let mut out = Vec::new();
    for i in 0..num_dets {
        let conf = feature(i, 4);
        if conf < min_confidence {
            continue;
        }
        let (cx, cy, w, h) = (feature(i, 0), feature(i, 1), feature(i, 2), feature(i, 3));
        let (x1, y1) = letterbox.to_frame(cx - w / 2.0, cy - h / 2.0);
        let (x2, y2) = letterbox.to_frame(cx + w / 2.0, cy + h / 2.0);
        out.push(Detection {
            x1,
            y1,
            x2,
            y2,
            confidence: conf,
        });
    }
    out
}

/// Greedy NMS: highest confidence first, suppressing overlapping boxes.
fn nms(dets: &mut [Detection], iou_thresh: f64) -> Vec<Detection> {
    dets.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<Detection> = Vec::new();
    for det in dets.iter() {
        if keep.iter().all(|k| iou(k, det) <= iou_thresh) {
            keep.push(*det);
        }
    }
    keep
}

fn iou(a: &Detection, b: &Detection) -> f64 {
    let x1 = a.x1.max(b.x1);
    let y1 = a.y1.max(b.y1);
    let x2 = a.x2.min(b.x2);
    let y2 = a.y2.min(b.y2);

    let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    if inter == 0.0 {
        return 0.0;
    }
    let area_a = (a.x2 - a.x1) * (a.y2 - a.y1);
    let area_b = (b.x2 - b.x1) * (b.y2 - b.y1);
    inter / (area_a + area_b - inter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn det(x1: f64, y1: f64, x2: f64, y2: f64, confidence: f64) -> Detection {
        Detection {
            x1,
            y1,
            x2,
            y2,
            confidence,
        }
    }

    #[test]
    fn test_letterbox_preserves_aspect_ratio() {
        // 200x100 → scale 3.2, image 640x320, 160px bands top and bottom
        let frame = Frame::new(vec![128u8; 200 * 100 * 3], 200, 100, 3, 0);
        let (tensor, lb) = letterbox(&frame, 640);

        assert_eq!(tensor.shape(), &[1, 3, 640, 640]);
        assert_relative_eq!(lb.scale, 3.2, epsilon = 1e-9);
        assert_eq!((lb.pad_x, lb.pad_y), (0, 160));
    }

    #[test]
    fn test_letterbox_fills_padding_and_normalizes() {
        let frame = Frame::new(vec![255u8; 100 * 50 * 3], 100, 50, 3, 0);
        let (tensor, lb) = letterbox(&frame, 640);

        let inside = tensor[[0, 0, lb.pad_y as usize + 1, 1]];
        assert_relative_eq!(inside, 1.0, epsilon = 1e-6);
        assert_relative_eq!(tensor[[0, 0, 0, 0]], PAD_VALUE, epsilon = 1e-6);
    }

    #[test]
    fn test_letterbox_maps_back_to_frame() {
        let lb = Letterbox {
            scale: 2.0,
            pad_x: 0,
            pad_y: 80,
        };
        let (x, y) = lb.to_frame(200.0, 280.0);
        assert_relative_eq!(x, 100.0);
        assert_relative_eq!(y, 100.0);
    }

    #[test]
    fn test_parse_candidates_both_layouts() {
        let lb = Letterbox {
            scale: 1.0,
            pad_x: 0,
            pad_y: 0,
        };
        // Two detections, five features each: one confident, one not
        let rows = [[50.0f32, 60.0, 20.0, 40.0, 0.9], [10.0, 10.0, 4.0, 4.0, 0.1]];
        let row_major: Vec<f32> = rows.iter().flatten().copied().collect();
        let col_major: Vec<f32> = (0..5).flat_map(|f| rows.iter().map(move |r| r[f])).collect();

        let a = parse_candidates(&row_major, &[1, 2, 5], 0.25, &lb);
        let b = parse_candidates(&col_major, &[1, 5, 2], 0.25, &lb);
        assert_eq!(a, b);
        assert_eq!(a.len(), 1);
        assert_eq!(a[0], det(40.0, 40.0, 60.0, 80.0, 0.8999999761581421));
    }

    #[test]
    fn test_nms_suppresses_overlapping() {
        let mut dets = vec![
            det(0.0, 0.0, 100.0, 100.0, 0.8),
            det(5.0, 5.0, 105.0, 105.0, 0.9),
        ];
        let kept = nms(&mut dets, 0.3);
        assert_eq!(kept.len(), 1);
        assert_relative_eq!(kept[0].confidence, 0.9);
    }

    #[test]
    fn test_nms_keeps_disjoint() {
        let mut dets = vec![
            det(0.0, 0.0, 50.0, 50.0, 0.9),
            det(200.0, 200.0, 250.0, 250.0, 0.8),
        ];
        assert_eq!(nms(&mut dets, 0.3).len(), 2);
    }

    #[test]
    fn test_nms_empty_input() {
        assert!(nms(&mut [], 0.3).is_empty());
    }

    #[test]
    fn test_iou_identical_and_disjoint() {
        let a = det(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = det(20.0, 20.0, 30.0, 30.0, 1.0);
        assert_relative_eq!(iou(&a, &a), 1.0);
        assert_eq!(iou(&a, &b), 0.0);
    }
}
