//! Embedder seam
//!
//! The embedding model runtime lives outside the engine; everything in
//! here talks to it through the `Embedder` trait. `HashingEmbedder` is
//! the deterministic feature-hashing fallback used by tests and offline
//! setups: tokens hash into buckets, the result is unit-normalized, and
//! identical text always produces identical vectors.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::{EngramError, Result};
use crate::math::normalize;

/// Produces unit-normalized embeddings of a fixed dimension
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a text. `is_query` lets asymmetric models distinguish query
    /// encoding from document encoding.
    async fn embed(&self, text: &str, is_query: bool) -> Result<Vec<f32>>;

    /// Fixed output dimension
    fn dimension(&self) -> usize;
}

/// Deterministic feature-hashing embedder. No model weights: each token
/// (and token bigram) hashes to a bucket with a signed contribution.
/// Useful relatedness for overlapping vocabulary, nothing more.
pub struct HashingEmbedder {
    dim: usize,
}

impl HashingEmbedder {
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a zero dimension.
    pub fn new(dim: usize) -> Result<Self> {
        if dim == 0 {
            return Err(EngramError::invalid("embedder dimension must be positive"));
        }
        Ok(Self { dim })
    }

    fn bucket(&self, feature: &str) -> (usize, f32) {
        let digest = Sha256::digest(feature.as_bytes());
        let index = u64::from_le_bytes(digest[0..8].try_into().expect("8 bytes")) as usize % self.dim;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        (index, sign)
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed(&self, text: &str, _is_query: bool) -> Result<Vec<f32>> {
        let mut values = vec![0.0f32; self.dim];
        let tokens: Vec<String> = text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric() && c != '_')
            .filter(|t| !t.is_empty())
            .map(String::from)
            .collect();

        for token in &tokens {
            let (index, sign) = self.bucket(token);
            values[index] += sign;
        }
        for pair in tokens.windows(2) {
            let (index, sign) = self.bucket(&format!("{} {}", pair[0], pair[1]));
            values[index] += sign * 0.5;
        }

        normalize(&mut values);
        Ok(values)
    }

    fn dimension(&self) -> usize {
        self.dim
    }
}
