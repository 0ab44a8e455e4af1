use std::path::PathBuf;

use thiserror::Error;

use crate::identity::domain::identity_record::IdentityRecord;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("identity database not found: {0}")]
    NotFound(PathBuf),
    #[error("failed to read identity database {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("identity database {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write identity database {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("embedding for '{name}' has dimension {actual}, expected {expected}")]
    DimensionMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },
    #[error("identity '{0}' has no reference embeddings")]
    Empty(String),
    #[error("identity name must not be empty")]
    InvalidName,
    #[error("identity database is locked by another writer: {0}")]
    Locked(PathBuf),
}

/// Callback that turns the stored records into the records to write back.
pub type MergeFn<'a> =
    dyn FnMut(Vec<IdentityRecord>) -> Result<Vec<IdentityRecord>, StoreError> + 'a;

/// Durable storage for identity records.
///
/// Implementations persist the whole set at once. Several processes may
/// share one repository, so writers that must not lose each other's changes
/// go through [`update`](Self::update).
pub trait IdentityRepository: Send + Sync {
    fn load(&self) -> Result<Vec<IdentityRecord>, StoreError>;

    fn save(&self, records: &[IdentityRecord]) -> Result<(), StoreError>;

    /// Reads the stored records, passes them to `merge`, and saves the
    /// result, returning what was written.
    ///
    /// Implementations shared between processes hold a lock across the
    /// whole read-merge-write.
    fn update(&self, merge: &mut MergeFn<'_>) -> Result<Vec<IdentityRecord>, StoreError> {
        let merged = merge(self.load()?)?;
        self.save(&merged)?;
        Ok(merged)
    }
}
