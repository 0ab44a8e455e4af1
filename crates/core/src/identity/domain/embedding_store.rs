use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};

use crate::identity::domain::identity_record::{IdentityMetadata, IdentityRecord};
use crate::identity::domain::identity_repository::{IdentityRepository, StoreError};
use crate::shared::embedding::Embedding;

/// Immutable view of every known identity, in registration order.
#[derive(Debug, Default)]
pub struct IdentitySnapshot {
    records: Vec<IdentityRecord>,
}

impl IdentitySnapshot {
    pub fn records(&self) -> &[IdentityRecord] {
        &self.records
    }

    pub fn get(&self, name: &str) -> Option<&IdentityRecord> {
        self.records.iter().find(|r| r.name == name)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Identity with the highest similarity to `query`.
    ///
    /// Records are scanned in registration order and a candidate only
    /// replaces the current best when strictly greater, so on an exact tie
    /// the first-registered identity wins.
    pub fn best_match(&self, query: &Embedding) -> Option<(&IdentityRecord, f64)> {
        let mut best: Option<(&IdentityRecord, f64)> = None;
        for record in &self.records {
            let Some(score) = record.similarity(query) else {
                continue;
            };
            if best.map_or(true, |(_, top)| score > top) {
                best = Some((record, score));
            }
        }
        best
    }
}

/// Thread-safe identity store with copy-on-write snapshots.
///
/// Readers take an `Arc` of the current snapshot and never wait on writers
/// beyond the pointer swap. Writers are serialized by a separate mutex,
/// build the next snapshot from the current one, and publish it atomically,
/// so no reader ever sees a half-written identity. Persistence serializes a
/// snapshot outside every lock.
pub struct EmbeddingStore {
    snapshot: RwLock<Arc<IdentitySnapshot>>,
    writer: Mutex<()>,
    repository: Box<dyn IdentityRepository>,
    dimension: usize,
    ema_alpha: f64,
    dirty: AtomicBool,
}

impl EmbeddingStore {
    /// Opens the store, loading every record from `repository`.
    ///
    /// Fails if the repository is unreadable or any stored embedding has the
    /// wrong dimension; the store is never silently reset.
    pub fn open(
        repository: Box<dyn IdentityRepository>,
        dimension: usize,
        ema_alpha: f64,
    ) -> Result<Self, StoreError> {
        let store = Self {
            snapshot: RwLock::new(Arc::new(IdentitySnapshot::default())),
            writer: Mutex::new(()),
            repository,
            dimension,
            ema_alpha,
            dirty: AtomicBool::new(false),
        };
        store.load()?;
        Ok(store)
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Current consistent snapshot of all identities.
    pub fn lookup_all(&self) -> Arc<IdentitySnapshot> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replaces the in-memory state with the repository's contents.
    pub fn load(&self) -> Result<(), StoreError> {
        let mut records = self.repository.load()?;
        self.validate(&records)?;
        records.sort_by(|a, b| a.order_key().cmp(&b.order_key()));

        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        self.publish(IdentitySnapshot { records });
        self.dirty.store(false, Ordering::Release);
        Ok(())
    }

    /// Adds a reference embedding for `name`.
    ///
    /// A new name creates its record with `metadata`; an existing name gains
    /// another reference embedding and keeps its original metadata.
    pub fn upsert(
        &self,
        name: &str,
        embedding: Embedding,
        metadata: IdentityMetadata,
    ) -> Result<(), StoreError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(StoreError::InvalidName);
        }
        self.check_dimension(name, &embedding)?;

        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let mut records = self.lookup_all().records.clone();
        match records.iter_mut().find(|r| r.name == name) {
            Some(existing) => {
                let mut refs = existing.embeddings.to_vec();
                refs.push(embedding);
                existing.embeddings = refs.into();
            }
            None => {
                let record = IdentityRecord::new(name, vec![embedding], metadata);
                let pos = records.partition_point(|r| r.order_key() <= record.order_key());
                records.insert(pos, record);
            }
        }
        self.publish(IdentitySnapshot { records });
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    /// Updates `last_seen` and rolling confidence after a successful match.
    ///
    /// Returns `false` when the identity no longer exists.
    pub fn record_match(&self, name: &str, similarity: f64, seen_at: DateTime<Utc>) -> bool {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.lookup_all();
        let Some(index) = current.records.iter().position(|r| r.name == name) else {
            return false;
        };
        let mut records = current.records.clone();
        records[index]
            .metadata
            .observe(similarity, seen_at, self.ema_alpha);
        self.publish(IdentitySnapshot { records });
        self.dirty.store(true, Ordering::Release);
        true
    }

    /// Writes the current snapshot to the repository, merged with whatever
    /// another process saved there since this store loaded.
    ///
    /// Identities and reference embeddings from either side are kept, and
    /// the ones found only on disk are picked up here as well.
    pub fn persist(&self) -> Result<(), StoreError> {
        self.dirty.store(false, Ordering::Release);
        let local = self.lookup_all();
        let written = self.repository.update(&mut |stored| {
            self.validate(&stored)?;
            Ok(merge_records(stored, local.records()))
        });
        let written = match written {
            Ok(written) => written,
            Err(e) => {
                self.dirty.store(true, Ordering::Release);
                return Err(e);
            }
        };

        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.lookup_all();
        let records = merge_records(written, current.records());
        if records.len() > current.len() {
            log::info!(
                "Picked up {} identities saved by another process",
                records.len() - current.len()
            );
        }
        if records != current.records {
            self.publish(IdentitySnapshot { records });
        }
        Ok(())
    }

    /// Persists only when something changed since the last save.
    pub fn persist_if_dirty(&self) -> Result<bool, StoreError> {
        if !self.dirty.load(Ordering::Acquire) {
            return Ok(false);
        }
        self.persist()?;
        Ok(true)
    }

    fn publish(&self, next: IdentitySnapshot) {
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(next);
    }

    fn validate(&self, records: &[IdentityRecord]) -> Result<(), StoreError> {
        for record in records {
            if record.embeddings.is_empty() {
                return Err(StoreError::Empty(record.name.clone()));
            }
            for embedding in record.embeddings.iter() {
                self.check_dimension(&record.name, embedding)?;
            }
        }
        Ok(())
    }

    fn check_dimension(&self, name: &str, embedding: &Embedding) -> Result<(), StoreError> {
        if embedding.dimension() != self.dimension {
            return Err(StoreError::DimensionMismatch {
                name: name.to_string(),
                expected: self.dimension,
                actual: embedding.dimension(),
            });
        }
        Ok(())
    }
}

/// Union of `stored` and `local` by name, in registration order.
fn merge_records(stored: Vec<IdentityRecord>, local: &[IdentityRecord]) -> Vec<IdentityRecord> {
    let mut merged = stored;
    for record in local {
        match merged.iter_mut().find(|r| r.name == record.name) {
            Some(existing) => *existing = merge_record(existing, record),
            None => merged.push(record.clone()),
        }
    }
    merged.sort_by(|a, b| a.order_key().cmp(&b.order_key()));
    merged
}

/// Stored references plus any local ones missing from them. Metadata comes
/// from the side with more matches, local on a tie.
fn merge_record(stored: &IdentityRecord, local: &IdentityRecord) -> IdentityRecord {
    let embeddings = if stored.embeddings == local.embeddings {
        Arc::clone(&local.embeddings)
    } else {
        let mut refs = stored.embeddings.to_vec();
        for embedding in local.embeddings.iter() {
            if !refs.contains(embedding) {
                refs.push(embedding.clone());
            }
        }
        refs.into()
    };

    let mut metadata = if stored.metadata.match_count > local.metadata.match_count {
        stored.metadata.clone()
    } else {
        local.metadata.clone()
    };
    metadata.added_at = stored.metadata.added_at.min(local.metadata.added_at);
    metadata.last_seen = stored.metadata.last_seen.max(local.metadata.last_seen);

    IdentityRecord {
        name: local.name.clone(),
        embeddings,
        metadata,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::TimeZone;
    use std::thread;

    /// In-memory repository that records saves.
    #[derive(Default)]
    struct MemoryRepository {
        initial: Vec<IdentityRecord>,
        saved: Arc<Mutex<Vec<Vec<IdentityRecord>>>>,
    }

    impl IdentityRepository for MemoryRepository {
        fn load(&self) -> Result<Vec<IdentityRecord>, StoreError> {
            Ok(self.initial.clone())
        }

        fn save(&self, records: &[IdentityRecord]) -> Result<(), StoreError> {
            self.saved.lock().unwrap().push(records.to_vec());
            Ok(())
        }
    }

    /// Repository whose contents several stores can share, like one file
    /// used by two processes.
    #[derive(Clone, Default)]
    struct SharedRepository(Arc<Mutex<Vec<IdentityRecord>>>);

    impl IdentityRepository for SharedRepository {
        fn load(&self) -> Result<Vec<IdentityRecord>, StoreError> {
            Ok(self.0.lock().unwrap().clone())
        }

        fn save(&self, records: &[IdentityRecord]) -> Result<(), StoreError> {
            *self.0.lock().unwrap() = records.to_vec();
            Ok(())
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    fn empty_store() -> EmbeddingStore {
        EmbeddingStore::open(Box::new(MemoryRepository::default()), 2, 0.3).unwrap()
    }

    #[test]
    fn test_upsert_creates_record() {
        let store = empty_store();
        store
            .upsert("alice", emb(&[1.0, 0.0]), IdentityMetadata::registered_at(at(0)))
            .unwrap();
        let snap = store.lookup_all();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap.get("alice").unwrap().embeddings.len(), 1);
    }

    #[test]
    fn test_upsert_existing_appends_reference_and_keeps_metadata() {
        let store = empty_store();
        store
            .upsert("alice", emb(&[1.0, 0.0]), IdentityMetadata::registered_at(at(0)))
            .unwrap();
        store
            .upsert("alice", emb(&[0.0, 1.0]), IdentityMetadata::registered_at(at(99)))
            .unwrap();
        let snap = store.lookup_all();
        let alice = snap.get("alice").unwrap();
        assert_eq!(alice.embeddings.len(), 2);
        assert_eq!(alice.metadata.added_at, at(0));
    }

    #[test]
    fn test_upsert_rejects_wrong_dimension() {
        let store = empty_store();
        let err = store
            .upsert("alice", emb(&[1.0, 0.0, 0.0]), IdentityMetadata::registered_at(at(0)))
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::DimensionMismatch {
                expected: 2,
                actual: 3,
                ..
            }
        ));
        assert!(store.lookup_all().is_empty());
    }

    #[test]
    fn test_upsert_rejects_blank_name() {
        let store = empty_store();
        let err = store
            .upsert("  ", emb(&[1.0, 0.0]), IdentityMetadata::registered_at(at(0)))
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidName));
    }

    #[test]
    fn test_open_rejects_stored_dimension_mismatch() {
        let repo = MemoryRepository {
            initial: vec![IdentityRecord::new(
                "bob",
                vec![emb(&[1.0, 0.0, 0.0])],
                IdentityMetadata::registered_at(at(0)),
            )],
            ..Default::default()
        };
        assert!(EmbeddingStore::open(Box::new(repo), 2, 0.3).is_err());
    }

    #[test]
    fn test_snapshot_is_unaffected_by_later_writes() {
        let store = empty_store();
        store
            .upsert("alice", emb(&[1.0, 0.0]), IdentityMetadata::registered_at(at(0)))
            .unwrap();
        let before = store.lookup_all();
        store.record_match("alice", 0.9, at(5));
        assert_eq!(before.get("alice").unwrap().metadata.match_count, 0);
        assert_eq!(store.lookup_all().get("alice").unwrap().metadata.match_count, 1);
    }

    #[test]
    fn test_records_sorted_by_registration_order() {
        let store = empty_store();
        store
            .upsert("carol", emb(&[1.0, 0.0]), IdentityMetadata::registered_at(at(20)))
            .unwrap();
        store
            .upsert("alice", emb(&[1.0, 0.0]), IdentityMetadata::registered_at(at(10)))
            .unwrap();
        store
            .upsert("bob", emb(&[1.0, 0.0]), IdentityMetadata::registered_at(at(10)))
            .unwrap();
        let names: Vec<_> = store
            .lookup_all()
            .records()
            .iter()
            .map(|r| r.name.clone())
            .collect();
        assert_eq!(names, vec!["alice", "bob", "carol"]);
    }

    #[test]
    fn test_best_match_tie_goes_to_first_registered() {
        let store = empty_store();
        store
            .upsert("later", emb(&[1.0, 0.0]), IdentityMetadata::registered_at(at(50)))
            .unwrap();
        store
            .upsert("earlier", emb(&[1.0, 0.0]), IdentityMetadata::registered_at(at(1)))
            .unwrap();
        let snap = store.lookup_all();
        let (record, score) = snap.best_match(&emb(&[2.0, 0.0])).unwrap();
        assert_eq!(record.name, "earlier");
        assert_relative_eq!(score, 1.0);
    }

    #[test]
    fn test_best_match_picks_highest_similarity() {
        let store = empty_store();
        store
            .upsert("x", emb(&[1.0, 0.0]), IdentityMetadata::registered_at(at(0)))
            .unwrap();
        store
            .upsert("y", emb(&[0.0, 1.0]), IdentityMetadata::registered_at(at(1)))
            .unwrap();
        let snap = store.lookup_all();
        let (record, _) = snap.best_match(&emb(&[0.2, 0.9])).unwrap();
        assert_eq!(record.name, "y");
    }

    #[test]
    fn test_best_match_on_empty_store_is_none() {
        assert!(empty_store().lookup_all().best_match(&emb(&[1.0, 0.0])).is_none());
    }

    #[test]
    fn test_record_match_unknown_name_returns_false() {
        assert!(!empty_store().record_match("ghost", 0.9, at(0)));
    }

    #[test]
    fn test_concurrent_matches_are_all_applied() {
        let store = Arc::new(empty_store());
        store
            .upsert("alice", emb(&[1.0, 0.0]), IdentityMetadata::registered_at(at(0)))
            .unwrap();

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for i in 0..50 {
                        store.record_match("alice", 0.9, at(t * 100 + i));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let snap = store.lookup_all();
        let meta = &snap.get("alice").unwrap().metadata;
        assert_eq!(meta.match_count, 400);
        assert_eq!(meta.last_seen, Some(at(749)));
        assert_relative_eq!(meta.confidence, 0.9, epsilon = 1e-9);
    }

    #[test]
    fn test_persist_if_dirty_saves_once() {
        let saved = Arc::new(Mutex::new(Vec::new()));
        let repo = MemoryRepository {
            initial: Vec::new(),
            saved: Arc::clone(&saved),
        };
        let store = EmbeddingStore::open(Box::new(repo), 2, 0.3).unwrap();
        assert!(!store.persist_if_dirty().unwrap());

        store
            .upsert("alice", emb(&[1.0, 0.0]), IdentityMetadata::registered_at(at(0)))
            .unwrap();
        assert!(store.persist_if_dirty().unwrap());
        assert!(!store.persist_if_dirty().unwrap());

        let saved = saved.lock().unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0][0].name, "alice");
    }

    #[test]
    fn test_persist_keeps_identities_saved_by_another_store() {
        let disk = SharedRepository::default();
        let first = EmbeddingStore::open(Box::new(disk.clone()), 2, 0.3).unwrap();
        let second = EmbeddingStore::open(Box::new(disk.clone()), 2, 0.3).unwrap();

        first
            .upsert("alice", emb(&[1.0, 0.0]), IdentityMetadata::registered_at(at(0)))
            .unwrap();
        first.persist().unwrap();
        second
            .upsert("bob", emb(&[0.0, 1.0]), IdentityMetadata::registered_at(at(5)))
            .unwrap();
        second.persist().unwrap();

        let names: Vec<_> = disk.load().unwrap().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["alice", "bob"]);
        assert!(second.lookup_all().get("alice").is_some());
    }

    #[test]
    fn test_merge_keeps_both_sides_references_and_busier_metadata() {
        let disk = SharedRepository::default();
        let seed = EmbeddingStore::open(Box::new(disk.clone()), 2, 0.3).unwrap();
        seed.upsert("alice", emb(&[1.0, 0.0]), IdentityMetadata::registered_at(at(0)))
            .unwrap();
        seed.persist().unwrap();

        let matcher = EmbeddingStore::open(Box::new(disk.clone()), 2, 0.3).unwrap();
        let enroller = EmbeddingStore::open(Box::new(disk.clone()), 2, 0.3).unwrap();
        enroller
            .upsert("alice", emb(&[0.6, 0.8]), IdentityMetadata::registered_at(at(9)))
            .unwrap();
        enroller.persist().unwrap();

        assert!(matcher.record_match("alice", 0.8, at(30)));
        assert!(matcher.persist_if_dirty().unwrap());

        let stored = disk.load().unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].embeddings.len(), 2);
        assert_eq!(stored[0].metadata.match_count, 1);
        assert_eq!(stored[0].metadata.last_seen, Some(at(30)));
        assert_eq!(stored[0].metadata.added_at, at(0));
        assert_eq!(matcher.lookup_all().get("alice").unwrap().embeddings.len(), 2);
    }

    #[test]
    fn test_persist_rejects_stored_records_of_wrong_dimension() {
        let disk = SharedRepository::default();
        let store = EmbeddingStore::open(Box::new(disk.clone()), 2, 0.3).unwrap();
        disk.save(&[IdentityRecord::new(
            "mallory",
            vec![emb(&[1.0, 0.0, 0.0])],
            IdentityMetadata::registered_at(at(0)),
        )])
        .unwrap();
        store
            .upsert("alice", emb(&[1.0, 0.0]), IdentityMetadata::registered_at(at(1)))
            .unwrap();

        assert!(matches!(
            store.persist(),
            Err(StoreError::DimensionMismatch { .. })
        ));
        assert!(store.persist_if_dirty().is_err());
        assert_eq!(disk.load().unwrap()[0].name, "mallory");
    }
}
