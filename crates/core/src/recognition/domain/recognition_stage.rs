use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;

use crate::identity::domain::embedding_store::EmbeddingStore;
use crate::recognition::domain::face_embedder::FaceEmbedder;
use crate::recognition::domain::match_result::{MatchResult, Subject};
use crate::shared::embedding::Embedding;
use crate::shared::face_box::FaceBox;
use crate::shared::frame::FaceCrop;
use crate::unknown::domain::unknown_face_logger::{UnknownFaceSink, UnknownSighting};

/// Classifies detected faces against the embedding store.
///
/// Cheap to clone: every recognition worker holds its own clone sharing the
/// embedder, the store and the failure counter.
#[derive(Clone)]
pub struct RecognitionStage {
    embedder: Arc<dyn FaceEmbedder>,
    store: Arc<EmbeddingStore>,
    similarity_threshold: f64,
    unknown_sink: Option<UnknownFaceSink>,
    embed_failures: Arc<AtomicU64>,
}

impl RecognitionStage {
    pub fn new(
        embedder: Arc<dyn FaceEmbedder>,
        store: Arc<EmbeddingStore>,
        similarity_threshold: f64,
    ) -> Self {
        Self {
            embedder,
            store,
            similarity_threshold,
            unknown_sink: None,
            embed_failures: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Routes unknown faces to the unknown-face logger.
    pub fn with_unknown_sink(mut self, sink: UnknownFaceSink) -> Self {
        self.unknown_sink = Some(sink);
        self
    }

    /// Faces whose embedding could not be computed so far.
    pub fn embed_failures(&self) -> u64 {
        self.embed_failures.load(Ordering::Relaxed)
    }

    /// Recognizes one face.
    ///
    /// Never fails: an embedding error classifies the face as unknown with
    /// similarity 0.0. A match updates the identity's `last_seen` and
    /// rolling confidence; an unknown face is handed to the logger without
    /// waiting.
    pub fn recognize(&self, face: FaceBox) -> MatchResult {
        let crop = face.crop();
        let embedding = match crop.as_ref() {
            Some(crop) => self.embed(crop),
            None => Err("Face box has an empty crop".into()),
        };

        let embedding = match embedding {
            Ok(embedding) => Some(embedding),
            Err(e) => {
                self.embed_failures.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "Embedding failed for face in frame {}: {e}",
                    face.frame_index()
                );
                None
            }
        };

        let snapshot = self.store.lookup_all();
        let best = embedding
            .as_ref()
            .and_then(|e| snapshot.best_match(e))
            .map(|(record, score)| (record.name.clone(), score));
        let completed_at = Instant::now();

        match best {
            Some((name, similarity)) if similarity >= self.similarity_threshold => {
                if !self.store.record_match(&name, similarity, Utc::now()) {
                    log::debug!("Identity '{name}' was removed before its match was recorded");
                }
                MatchResult {
                    subject: Subject::Known(name),
                    similarity,
                    face,
                    completed_at,
                }
            }
            best => {
                if let (Some(sink), Some(crop)) = (&self.unknown_sink, crop) {
                    sink.submit(UnknownSighting {
                        crop,
                        embedding,
                        seen_at: completed_at,
                        wall_time: Utc::now(),
                    });
                }
                MatchResult {
                    subject: Subject::Unknown,
                    similarity: best.map_or(0.0, |(_, s)| s),
                    face,
                    completed_at,
                }
            }
        }
    }

    /// Embeds a crop and checks it against the store's dimension.
    pub fn embed(&self, crop: &FaceCrop) -> Result<Embedding, Box<dyn std::error::Error>> {
        let raw = self.embedder.embed(crop)?;
        if raw.len() != self.store.dimension() {
            return Err(format!(
                "embedder returned {} values, store expects {}",
                raw.len(),
                self.store.dimension()
            )
            .into());
        }
        Ok(Embedding::normalized(raw))
    }
}
