use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender, TrySendError};

use crate::shared::embedding::Embedding;
use crate::shared::frame::FaceCrop;
use crate::unknown::domain::crop_writer::CropWriter;
use crate::unknown::domain::encounter_gate::EncounterGate;

const FILE_PREFIX: &str = "unknown_";
const FILE_EXTENSION: &str = "jpg";

/// An unmatched face handed over by a recognition worker.
pub struct UnknownSighting {
    pub crop: FaceCrop,
    pub embedding: Option<Embedding>,
    pub seen_at: Instant,
    pub wall_time: DateTime<Utc>,
}

/// Persists crops of unknown faces into an append-only directory.
///
/// Each new encounter is written as `unknown_<timestamp>_<seq>.jpg`; the
/// directory is then trimmed to the newest `max_images` files.
pub struct UnknownFaceLogger {
    directory: PathBuf,
    writer: Box<dyn CropWriter>,
    gate: EncounterGate,
    max_images: usize,
    sequence: u64,
}

impl UnknownFaceLogger {
    pub fn new(
        directory: impl Into<PathBuf>,
        writer: Box<dyn CropWriter>,
        gate: EncounterGate,
        max_images: usize,
    ) -> Self {
        Self {
            directory: directory.into(),
            writer,
            gate,
            max_images: max_images.max(1),
            sequence: 0,
        }
    }

    /// Writes the sighting if it is a new encounter.
    ///
    /// Returns the written path, or `None` when the cool-down suppressed it.
    pub fn log(
        &mut self,
        sighting: &UnknownSighting,
    ) -> Result<Option<PathBuf>, Box<dyn std::error::Error>> {
        if !self.gate.admit(sighting.embedding.as_ref(), sighting.seen_at) {
            return Ok(None);
        }

        let path = self.directory.join(self.file_name(sighting.wall_time));
        self.sequence += 1;
        if let Err(e) = self.writer.write(&path, &sighting.crop) {
            // No crop on disk, so the cool-down must not start.
            self.gate.revoke_latest();
            return Err(e);
        }
        log::info!("Logged unknown face to {}", path.display());

        if let Err(e) = self.enforce_retention() {
            log::warn!("Failed to trim {}: {e}", self.directory.display());
        }
        Ok(Some(path))
    }

    fn file_name(&self, wall_time: DateTime<Utc>) -> String {
        format!(
            "{FILE_PREFIX}{}_{:06}.{FILE_EXTENSION}",
            wall_time.format("%Y%m%d_%H%M%S_%3f"),
            self.sequence
        )
    }

    /// Deletes the oldest crops beyond `max_images`.
    ///
    /// File names sort chronologically, so name order is age order.
    fn enforce_retention(&self) -> std::io::Result<()> {
        let mut logged = list_logged_crops(&self.directory)?;
        if logged.len() <= self.max_images {
            return Ok(());
        }
        logged.sort();
        let excess = logged.len() - self.max_images;
        for path in logged.into_iter().take(excess) {
            fs::remove_file(&path)?;
            log::debug!("Removed old unknown face {}", path.display());
        }
        Ok(())
    }
}

fn list_logged_crops(directory: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in fs::read_dir(directory)? {
        let path = entry?.path();
        let is_crop = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(FILE_PREFIX))
            && path.extension().and_then(|e| e.to_str()) == Some(FILE_EXTENSION);
        if is_crop {
            paths.push(path);
        }
    }
    Ok(paths)
}

/// Non-blocking handle recognition workers use to reach the logger thread.
#[derive(Clone)]
pub struct UnknownFaceSink {
    tx: Sender<UnknownSighting>,
    dropped: Arc<AtomicU64>,
}

impl UnknownFaceSink {
    /// Queues a sighting without waiting; a full queue drops it.
    pub fn submit(&self, sighting: UnknownSighting) {
        match self.tx.try_send(sighting) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Disconnected(_)) => {
                log::debug!("Unknown-face logger has stopped; sighting discarded");
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Starts the logger on its own thread.
///
/// The thread exits once every [`UnknownFaceSink`] clone is dropped and the
/// queue is drained, returning the number of crops written.
pub fn spawn_unknown_face_logger(
    mut logger: UnknownFaceLogger,
    capacity: usize,
) -> (UnknownFaceSink, JoinHandle<u64>) {
    let (tx, rx): (Sender<UnknownSighting>, Receiver<UnknownSighting>) =
        crossbeam_channel::bounded(capacity.max(1));
    let handle = std::thread::spawn(move || {
        let mut written = 0u64;
        for sighting in rx {
            match logger.log(&sighting) {
                Ok(Some(_)) => written += 1,
                Ok(None) => {}
                Err(e) => log::warn!("Failed to log unknown face: {e}"),
            }
        }
        written
    });
    let sink = UnknownFaceSink {
        tx,
        dropped: Arc::new(AtomicU64::new(0)),
    };
    (sink, handle)
}
