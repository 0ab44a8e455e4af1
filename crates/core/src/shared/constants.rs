pub const YOLO_MODEL_NAME: &str = "yolo11n-pose_widerface.onnx";
pub const YOLO_MODEL_URL: &str =
    "https://github.com/neutrinographics/faceguard/releases/download/v0.1.0/yolo11n-pose_widerface.onnx";

pub const EMBEDDING_MODEL_NAME: &str = "w600k_r50.onnx";
pub const EMBEDDING_MODEL_URL: &str =
    "https://github.com/neutrinographics/faceguard/releases/download/v0.1.0/w600k_r50.onnx";

/// Output length of the ArcFace w600k model.
pub const DEFAULT_EMBEDDING_DIMENSION: usize = 512;

/// Application directory name under the platform config/cache dirs.
pub const APP_DIR_NAME: &str = "FaceWatch";

pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "tiff", "tif", "webp"];

/// Subject key used for debounce and cool-down bookkeeping of unmatched faces.
pub const UNKNOWN_SUBJECT: &str = "UNKNOWN";
