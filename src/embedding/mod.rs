//! Embedding interfaces
//!
//! Embedding computation is delegated to an external provider; the core
//! only defines the seam (`Embedder`), validates dimensions on write, and
//! ranks by cosine similarity. A deterministic feature-hashing embedder is
//! included so vector paths are exercisable without a network provider.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::error::{CortexError, Result};

/// Trait for embedding providers
///
/// Implementations wrap whatever external service the deployment uses;
/// the store only requires a fixed output dimension.
pub trait Embedder: Send + Sync {
    /// Generate an embedding for a single text
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Generate embeddings for multiple texts
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }

    /// Fixed output dimension
    fn dimensions(&self) -> usize;

    /// Provider/model name
    fn model_name(&self) -> &str;
}

/// Deterministic feature-hashing embedder
///
/// Tokenizes on non-alphanumeric boundaries, hashes each token into a
/// fixed-size bucket vector, and L2-normalizes. Not semantically strong,
/// but stable across runs and dependency-free, which is what tests and
/// offline deployments need.
pub struct HashingEmbedder {
    dimensions: usize,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }
}

impl Embedder for HashingEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if self.dimensions == 0 {
            return Err(CortexError::Embedding(
                "Embedding dimension must be non-zero".to_string(),
            ));
        }

        let mut vector = vec![0.0f32; self.dimensions];

        for token in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let mut hasher = DefaultHasher::new();
            token.hash(&mut hasher);
            let hash = hasher.finish();
            let bucket = (hash % self.dimensions as u64) as usize;
            // Sign bit from a higher hash bit keeps buckets from only accumulating
            let sign = if hash & (1 << 63) == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }

        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut vector {
                *x /= norm;
            }
        }

        Ok(vector)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        "hashing"
    }
}

/// Cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}

/// Validate that a supplied embedding matches the configured dimension
pub fn check_dimensions(embedding: &[f32], expected: usize) -> Result<()> {
    if embedding.len() != expected {
        return Err(CortexError::InvalidInput(format!(
            "Embedding dimension mismatch: expected {}, got {}",
            expected,
            embedding.len()
        )));
    }
    Ok(())
}

/// Serialize an embedding as a little-endian f32 BLOB
pub(crate) fn to_blob(embedding: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(embedding.len() * 4);
    for value in embedding {
        blob.extend_from_slice(&value.to_le_bytes());
    }
    blob
}

/// Deserialize an embedding BLOB written by [`to_blob`]
pub(crate) fn from_blob(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 0.001);

        let c = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &c).abs() < 0.001);

        let d = vec![-1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &d) + 1.0).abs() < 0.001);
    }

    #[test]
    fn test_hashing_embedder_deterministic() {
        let embedder = HashingEmbedder::new(128);
        let a = embedder.embed("user prefers dark mode").unwrap();
        let b = embedder.embed("user prefers dark mode").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 128);

        let c = embedder.embed("completely different text about deploys").unwrap();
        assert!(cosine_similarity(&a, &c) < cosine_similarity(&a, &b));
    }

    #[test]
    fn test_blob_roundtrip() {
        let original = vec![0.25f32, -1.5, 3.75, 0.0];
        let blob = to_blob(&original);
        assert_eq!(blob.len(), 16);
        assert_eq!(from_blob(&blob), original);
    }

    #[test]
    fn test_check_dimensions() {
        assert!(check_dimensions(&[0.0; 384], 384).is_ok());
        assert!(check_dimensions(&[0.0; 100], 384).is_err());
    }
}
