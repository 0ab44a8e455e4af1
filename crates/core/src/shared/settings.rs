use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::control::domain::command::Command;
use crate::shared::constants::{APP_DIR_NAME, DEFAULT_EMBEDDING_DIMENSION};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(PathBuf),
    #[error("config file already exists: {0}")]
    AlreadyExists(PathBuf),
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write config {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{field} must be {expected}, got {value}")]
    OutOfRange {
        field: &'static str,
        expected: &'static str,
        value: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionSettings {
    pub confidence_threshold: f64,
    /// Minimum longer edge of a face box, in pixels.
    pub min_face_size: u32,
    /// Extra context cut around each face for recognition, as a fraction of
    /// the box size per side.
    pub crop_padding: f64,
    pub workers: usize,
    pub model_path: Option<PathBuf>,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.6,
            min_face_size: 100,
            crop_padding: 0.5,
            workers: default_workers(),
            model_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognitionSettings {
    pub similarity_threshold: f64,
    pub embedding_dimension: usize,
    /// Weight of the newest similarity in the rolling match confidence.
    pub confidence_ema_alpha: f64,
    pub workers: usize,
    pub model_path: Option<PathBuf>,
}

impl Default for RecognitionSettings {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.40,
            embedding_dimension: DEFAULT_EMBEDDING_DIMENSION,
            confidence_ema_alpha: 0.3,
            workers: default_workers(),
            model_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraSettings {
    pub device: String,
    /// libavdevice input format name; `None` lets ffmpeg detect the format.
    pub input_format: Option<String>,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            input_format: Some("video4linux2".to_string()),
            width: 640,
            height: 480,
            fps: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub frame_capacity: usize,
    pub face_capacity: usize,
    pub result_capacity: usize,
    pub command_capacity: usize,
    pub unknown_capacity: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            frame_capacity: 4,
            face_capacity: 32,
            result_capacity: 32,
            command_capacity: 8,
            unknown_capacity: 16,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub database_path: PathBuf,
    pub persist_interval_secs: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            database_path: data_dir().join("face_embeddings.json"),
            persist_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnknownFaceSettings {
    pub directory: PathBuf,
    pub cooldown_secs: u64,
    pub max_images: usize,
    /// Two unknown faces at or above this similarity are one encounter.
    pub same_face_threshold: f64,
}

impl Default for UnknownFaceSettings {
    fn default() -> Self {
        Self {
            directory: data_dir().join("unknown_faces"),
            cooldown_secs: 10,
            max_images: 10,
            same_face_threshold: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlSettings {
    pub vehicle_address: String,
    pub debounce_window_ms: u64,
    pub retry_delay_ms: u64,
    pub connect_timeout_ms: u64,
    pub known_command: Option<Command>,
    pub unknown_command: Option<Command>,
    pub identity_commands: HashMap<String, Command>,
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            vehicle_address: "192.168.4.1:8080".to_string(),
            debounce_window_ms: 1000,
            retry_delay_ms: 200,
            connect_timeout_ms: 500,
            known_command: Some(Command::Forward),
            unknown_command: Some(Command::Stop),
            identity_commands: HashMap::new(),
        }
    }
}

/// Complete runtime configuration, persisted as JSON.
///
/// Every section defaults independently, so a config file only needs the
/// fields it changes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub detection: DetectionSettings,
    pub recognition: RecognitionSettings,
    pub camera: CameraSettings,
    pub queues: QueueSettings,
    pub store: StoreSettings,
    pub unknown_faces: UnknownFaceSettings,
    pub control: ControlSettings,
}

impl Settings {
    /// Default config file location, e.g. `~/.config/FaceWatch/settings.json`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join(APP_DIR_NAME).join("settings.json"))
    }

    /// Loads settings from an explicitly chosen file; it must exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ConfigError::NotFound(path.to_path_buf()),
            _ => ConfigError::Read {
                path: path.to_path_buf(),
                source: e,
            },
        })?;
        serde_json::from_str(&json).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Loads settings from the implicit default location, where a missing
    /// file just means nothing was configured yet.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        match Self::load(path) {
            Err(ConfigError::NotFound(_)) => {
                log::debug!("No config at {}, using defaults", path.display());
                Ok(Self::default())
            }
            other => other,
        }
    }

    /// Writes the settings as pretty JSON, refusing to replace an existing
    /// file unless `overwrite` is set.
    pub fn save(&self, path: &Path, overwrite: bool) -> Result<(), ConfigError> {
        if !overwrite && path.exists() {
            return Err(ConfigError::AlreadyExists(path.to_path_buf()));
        }
        let write_err = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(write_err)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;
        fs::write(path, json).map_err(write_err)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_unit("detection.confidence_threshold", self.detection.confidence_threshold)?;
        check_unit("detection.crop_padding", self.detection.crop_padding)?;
        check_unit("recognition.similarity_threshold", self.recognition.similarity_threshold)?;
        check_unit("unknown_faces.same_face_threshold", self.unknown_faces.same_face_threshold)?;
        let alpha = self.recognition.confidence_ema_alpha;
        if !(alpha > 0.0 && alpha <= 1.0) {
            return Err(out_of_range("recognition.confidence_ema_alpha", "in (0.0, 1.0]", alpha));
        }
        check_positive("recognition.embedding_dimension", self.recognition.embedding_dimension)?;
        check_positive("detection.workers", self.detection.workers)?;
        check_positive("recognition.workers", self.recognition.workers)?;
        check_positive("queues.frame_capacity", self.queues.frame_capacity)?;
        check_positive("queues.face_capacity", self.queues.face_capacity)?;
        check_positive("queues.result_capacity", self.queues.result_capacity)?;
        check_positive("queues.command_capacity", self.queues.command_capacity)?;
        check_positive("queues.unknown_capacity", self.queues.unknown_capacity)?;
        check_positive("unknown_faces.max_images", self.unknown_faces.max_images)?;
        if self.camera.fps == 0 {
            return Err(out_of_range("camera.fps", "positive", 0));
        }
        Ok(())
    }

    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.control.debounce_window_ms)
    }

    pub fn unknown_cooldown(&self) -> Duration {
        Duration::from_secs(self.unknown_faces.cooldown_secs)
    }

    pub fn persist_interval(&self) -> Duration {
        Duration::from_secs(self.store.persist_interval_secs)
    }
}

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join(APP_DIR_NAME))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn default_workers() -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2);
    (cores / 2).max(1)
}

fn check_unit(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(out_of_range(field, "between 0.0 and 1.0", value))
    }
}

fn check_positive(field: &'static str, value: usize) -> Result<(), ConfigError> {
    if value > 0 {
        Ok(())
    } else {
        Err(out_of_range(field, "positive", value))
    }
}

fn out_of_range(field: &'static str, expected: &'static str, value: impl ToString) -> ConfigError {
    ConfigError::OutOfRange {
        field,
        expected,
        value: value.to_string(),
    }
}
