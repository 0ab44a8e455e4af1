use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::identity::domain::identity_record::{IdentityMetadata, IdentityRecord};
use crate::identity::domain::identity_repository::{IdentityRepository, MergeFn, StoreError};
use crate::shared::embedding::Embedding;

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);
const LOCK_RETRY: Duration = Duration::from_millis(20);
/// A lock older than this was left by a writer that died holding it.
const STALE_LOCK_AGE: Duration = Duration::from_secs(30);

/// On-disk shape of one identity: `name → { embeddings, added_at, ... }`.
#[derive(Serialize, Deserialize)]
struct StoredIdentity {
    embeddings: Vec<Embedding>,
    #[serde(flatten)]
    metadata: IdentityMetadata,
}

/// Identity database kept in a single JSON file.
///
/// Saves go to a sibling temp file that is renamed over the original, so a
/// crash mid-write leaves the previous database intact. Writers from
/// different processes serialize on a sibling `.json.lock` file.
pub struct JsonIdentityRepository {
    path: PathBuf,
    create_if_missing: bool,
    lock_timeout: Duration,
}

impl JsonIdentityRepository {
    /// Repository for an existing database; a missing file is an error.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            create_if_missing: false,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    /// Repository that treats a missing file as an empty database.
    pub fn open_or_create(path: impl Into<PathBuf>) -> Self {
        Self {
            create_if_missing: true,
            ..Self::open(path)
        }
    }

    /// How long a writer waits for another one to release the lock.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        self.path.with_extension("json.lock")
    }

    /// Stored records, or `None` when the file does not exist.
    fn read(&self) -> Result<Option<Vec<IdentityRecord>>, StoreError> {
        let json = match fs::read_to_string(&self.path) {
            Ok(json) => json,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StoreError::Read {
                    path: self.path.clone(),
                    source: e,
                })
            }
        };

        let stored: BTreeMap<String, StoredIdentity> =
            serde_json::from_str(&json).map_err(|e| StoreError::Corrupt {
                path: self.path.clone(),
                source: e,
            })?;

        Ok(Some(
            stored
                .into_iter()
                .map(|(name, s)| IdentityRecord::new(name, s.embeddings, s.metadata))
                .collect(),
        ))
    }

    fn lock(&self) -> Result<LockFile, StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| StoreError::Write {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
            }
        }
        LockFile::acquire(self.lock_path(), self.lock_timeout)
    }

    /// Replaces the file. Callers hold the lock.
    fn write(&self, records: &[IdentityRecord]) -> Result<(), StoreError> {
        let stored: BTreeMap<&str, StoredIdentity> = records
            .iter()
            .map(|r| {
                (
                    r.name.as_str(),
                    StoredIdentity {
                        embeddings: r.embeddings.to_vec(),
                        metadata: r.metadata.clone(),
                    },
                )
            })
            .collect();

        let write_err = |path: &Path, source| StoreError::Write {
            path: path.to_path_buf(),
            source,
        };
        let json = serde_json::to_vec_pretty(&stored)
            .map_err(|e| write_err(&self.path, io::Error::other(e)))?;

        let temp_path = self.path.with_extension("json.tmp");
        let mut file = fs::File::create(&temp_path).map_err(|e| write_err(&temp_path, e))?;
        file.write_all(&json)
            .and_then(|_| file.sync_all())
            .map_err(|e| write_err(&temp_path, e))?;
        drop(file);

        fs::rename(&temp_path, &self.path).map_err(|e| write_err(&self.path, e))?;
        log::debug!("Saved {} identities to {}", records.len(), self.path.display());
        Ok(())
    }
}

impl IdentityRepository for JsonIdentityRepository {
    fn load(&self) -> Result<Vec<IdentityRecord>, StoreError> {
        match self.read()? {
            Some(records) => Ok(records),
            None if self.create_if_missing => Ok(Vec::new()),
            None => Err(StoreError::NotFound(self.path.clone())),
        }
    }

    fn save(&self, records: &[IdentityRecord]) -> Result<(), StoreError> {
        let _lock = self.lock()?;
        self.write(records)
    }

    /// A missing file reads as empty here even for [`open`](Self::open):
    /// the caller supplies every record it wants kept.
    fn update(&self, merge: &mut MergeFn<'_>) -> Result<Vec<IdentityRecord>, StoreError> {
        let _lock = self.lock()?;
        let merged = merge(self.read()?.unwrap_or_default())?;
        self.write(&merged)?;
        Ok(merged)
    }
}

/// Exclusive lock held as a file created with `create_new`; removed on drop.
struct LockFile {
    path: PathBuf,
}

impl LockFile {
    fn acquire(path: PathBuf, timeout: Duration) -> Result<Self, StoreError> {
        let deadline = Instant::now() + timeout;
        loop {
            match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Ok(Self { path }),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if is_stale(&path) {
                        log::warn!("Removing stale lock {}", path.display());
                        if let Err(e) = fs::remove_file(&path) {
                            log::debug!("Stale lock already gone: {e}");
                        }
                        continue;
                    }
                    if Instant::now() >= deadline {
                        return Err(StoreError::Locked(path));
                    }
                    thread::sleep(LOCK_RETRY);
                }
                Err(e) => return Err(StoreError::Write { path, source: e }),
            }
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            log::warn!("Failed to release lock {}: {e}", self.path.display());
        }
    }
}

fn is_stale(path: &Path) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .map_or(false, |age| age > STALE_LOCK_AGE)
}
