use std::time::{Duration, Instant};

use crate::shared::embedding::Embedding;

struct RecentEncounter {
    embedding: Option<Embedding>,
    logged_at: Instant,
}

/// Rate limiter deciding whether an unknown face is a new encounter.
///
/// A sighting is suppressed while an earlier logged sighting of the same
/// face is younger than the cool-down. "Same face" means embedding
/// similarity at or above `same_face_threshold`; sightings without an
/// embedding (the embedder failed) all share one slot.
pub struct EncounterGate {
    cooldown: Duration,
    same_face_threshold: f64,
    recent: Vec<RecentEncounter>,
}

impl EncounterGate {
    pub fn new(cooldown: Duration, same_face_threshold: f64) -> Self {
        Self {
            cooldown,
            same_face_threshold,
            recent: Vec::new(),
        }
    }

    /// Returns `true` and remembers the sighting if it should be logged.
    pub fn admit(&mut self, embedding: Option<&Embedding>, now: Instant) -> bool {
        let cooldown = self.cooldown;
        self.recent
            .retain(|e| now.saturating_duration_since(e.logged_at) < cooldown);

        let already_logged = self.recent.iter().any(|e| match (&e.embedding, embedding) {
            (Some(prev), Some(current)) => prev
                .similarity(current)
                .is_some_and(|s| s >= self.same_face_threshold),
            (None, None) => true,
            _ => false,
        });
        if already_logged {
            return false;
        }

        self.recent.push(RecentEncounter {
            embedding: embedding.cloned(),
            logged_at: now,
        });
        true
    }

    /// Forgets the most recent admission so the face counts as new again.
    pub fn revoke_latest(&mut self) {
        self.recent.pop();
    }

    pub fn tracked(&self) -> usize {
        self.recent.len()
    }
}
