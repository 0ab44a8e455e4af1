use crate::shared::frame::FaceCrop;

/// Domain interface for face embedding models.
///
/// Implementations must be `Sync`: one embedder is shared by every
/// recognition worker.
pub trait FaceEmbedder: Send + Sync {
    /// Computes the raw (not necessarily normalized) embedding of a crop.
    fn embed(&self, crop: &FaceCrop) -> Result<Vec<f32>, Box<dyn std::error::Error>>;
}
