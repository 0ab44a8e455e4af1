use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::capture::domain::frame_source::{FrameSource, SourceInfo};
use crate::shared::constants::IMAGE_EXTENSIONS;
use crate::shared::frame::Frame;

/// Replays a directory of still images as a camera feed.
///
/// Files are visited in name order. An optional interval paces the replay
/// to a camera-like rate; without it frames are produced as fast as they
/// decode.
pub struct ImageDirectorySource {
    directory: PathBuf,
    interval: Option<Duration>,
    files: Vec<PathBuf>,
    next_index: usize,
}

impl ImageDirectorySource {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            interval: None,
            files: Vec::new(),
            next_index: 0,
        }
    }

    /// Paces playback to roughly `fps` frames per second.
    pub fn with_fps(mut self, fps: u32) -> Self {
        self.interval = (fps > 0).then(|| Duration::from_secs_f64(1.0 / fps as f64));
        self
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
}

/// Decodes one image file into an RGB frame.
pub fn load_frame(path: &Path, index: usize) -> Result<Frame, Box<dyn std::error::Error>> {
    let img = image::open(path)
        .map_err(|e| format!("{}: {e}", path.display()))?
        .to_rgb8();
    let (width, height) = img.dimensions();
    Ok(Frame::captured(
        img.into_raw(),
        width,
        height,
        3,
        index,
        Instant::now(),
    ))
}

impl FrameSource for ImageDirectorySource {
    fn open(&mut self) -> Result<SourceInfo, Box<dyn std::error::Error>> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(&self.directory)
            .map_err(|e| format!("{}: {e}", self.directory.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && is_image(p))
            .collect();
        files.sort();

        let first = files
            .first()
            .ok_or_else(|| format!("No images found in {}", self.directory.display()))?;
        let (width, height) = image::image_dimensions(first)?;

        let fps = self.interval.map_or(0.0, |i| 1.0 / i.as_secs_f64());
        log::info!(
            "Replaying {} images from {}",
            files.len(),
            self.directory.display()
        );
        self.files = files;
        self.next_index = 0;

        Ok(SourceInfo {
            width,
            height,
            fps,
            description: self.directory.display().to_string(),
        })
    }

    fn frames(
        &mut self,
    ) -> Box<dyn Iterator<Item = Result<Frame, Box<dyn std::error::Error>>> + '_> {
        if self.files.is_empty() {
            return Box::new(std::iter::once(Err(
                "ImageDirectorySource: not opened".into()
            )));
        }

        let interval = self.interval;
        let mut last_emit: Option<Instant> = None;
        let start = self.next_index;
        let next_index = &mut self.next_index;
        Box::new(self.files[start..].iter().map(move |path| {
            if let (Some(interval), Some(last)) = (interval, last_emit) {
                let elapsed = last.elapsed();
                if elapsed < interval {
                    std::thread::sleep(interval - elapsed);
                }
            }
            last_emit = Some(Instant::now());
            let index = *next_index;
            *next_index += 1;
            load_frame(path, index)
        }))
    }

    fn close(&mut self) {
        self.files.clear();
    }
}
