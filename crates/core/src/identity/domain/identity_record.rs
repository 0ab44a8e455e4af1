use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::shared::embedding::Embedding;

/// Bookkeeping attached to a registered person.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IdentityMetadata {
    pub added_at: DateTime<Utc>,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
    /// Exponential moving average of match similarity.
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub match_count: u64,
}

impl IdentityMetadata {
    pub fn registered_at(added_at: DateTime<Utc>) -> Self {
        Self {
            added_at,
            last_seen: None,
            confidence: 0.0,
            match_count: 0,
        }
    }

    /// Folds one successful match into the metadata.
    ///
    /// The first match sets the confidence outright; later matches blend it
    /// in with weight `alpha`. `last_seen` only moves forward, so results
    /// completing out of capture order never rewind it.
    pub fn observe(&mut self, similarity: f64, seen_at: DateTime<Utc>, alpha: f64) {
        self.confidence = if self.match_count == 0 {
            similarity
        } else {
            alpha * similarity + (1.0 - alpha) * self.confidence
        };
        self.match_count += 1;
        if self.last_seen.map_or(true, |prev| seen_at > prev) {
            self.last_seen = Some(seen_at);
        }
    }
}

/// A known person: name, reference embeddings, and metadata.
///
/// Reference embeddings are shared between store snapshots, so cloning a
/// record to update its metadata never copies the vectors.
#[derive(Clone, Debug, PartialEq)]
pub struct IdentityRecord {
    pub name: String,
    pub embeddings: Arc<[Embedding]>,
    pub metadata: IdentityMetadata,
}

impl IdentityRecord {
    pub fn new(name: impl Into<String>, embeddings: Vec<Embedding>, metadata: IdentityMetadata) -> Self {
        Self {
            name: name.into(),
            embeddings: embeddings.into(),
            metadata,
        }
    }

    /// Best similarity of `query` against any reference embedding.
    ///
    /// References whose dimension differs from the query are skipped.
    pub fn similarity(&self, query: &Embedding) -> Option<f64> {
        self.embeddings
            .iter()
            .filter_map(|reference| reference.similarity(query))
            .fold(None, |best, s| Some(best.map_or(s, |b: f64| b.max(s))))
    }

    /// Registration order key: earlier `added_at` first, then name.
    pub fn order_key(&self) -> (DateTime<Utc>, &str) {
        (self.metadata.added_at, self.name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_first_observation_sets_confidence() {
        let mut meta = IdentityMetadata::registered_at(at(0));
        meta.observe(0.8, at(5), 0.3);
        assert_relative_eq!(meta.confidence, 0.8);
        assert_eq!(meta.match_count, 1);
        assert_eq!(meta.last_seen, Some(at(5)));
    }

    #[test]
    fn test_later_observations_blend_with_ema() {
        let mut meta = IdentityMetadata::registered_at(at(0));
        meta.observe(0.8, at(1), 0.3);
        meta.observe(0.4, at(2), 0.3);
        // 0.3 * 0.4 + 0.7 * 0.8
        assert_relative_eq!(meta.confidence, 0.68, epsilon = 1e-12);
        assert_eq!(meta.match_count, 2);
    }

    #[test]
    fn test_last_seen_never_moves_backwards() {
        let mut meta = IdentityMetadata::registered_at(at(0));
        meta.observe(0.9, at(10), 0.3);
        meta.observe(0.9, at(7), 0.3);
        assert_eq!(meta.last_seen, Some(at(10)));
        assert_eq!(meta.match_count, 2);
    }

    #[test]
    fn test_record_similarity_takes_best_reference() {
        let record = IdentityRecord::new(
            "alice",
            vec![
                Embedding::new(vec![1.0, 0.0]),
                Embedding::new(vec![0.0, 1.0]),
            ],
            IdentityMetadata::registered_at(at(0)),
        );
        let query = Embedding::new(vec![0.1, 1.0]);
        let s = record.similarity(&query).unwrap();
        assert!(s > 0.99);
    }

    #[test]
    fn test_record_similarity_skips_mismatched_dimensions() {
        let record = IdentityRecord::new(
            "bob",
            vec![Embedding::new(vec![1.0, 0.0, 0.0])],
            IdentityMetadata::registered_at(at(0)),
        );
        assert_eq!(record.similarity(&Embedding::new(vec![1.0, 0.0])), None);
    }

    #[test]
    fn test_metadata_tolerates_missing_optional_fields() {
        let meta: IdentityMetadata =
            serde_json::from_str(r#"{"added_at": "2024-05-01T10:00:00Z"}"#).unwrap();
        assert_eq!(meta.last_seen, None);
        assert_eq!(meta.match_count, 0);
    }
}
