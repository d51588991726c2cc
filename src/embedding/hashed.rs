//! Deterministic local embedder.
//!
//! Maps text to a normalized bag-of-tokens vector by hashing each token into
//! a fixed number of buckets (FNV-1a). Texts that share vocabulary land in
//! shared buckets and score a positive cosine similarity. No network, no
//! model download, stable across runs and platforms — which is exactly what
//! offline mode and the test suite need. Not a semantic model; the `openai`
//! provider is the production choice.

use super::Embedder;
use crate::error::Result;
use async_trait::async_trait;

/// Hashing-based local embedder.
pub struct HashEmbedder {
    dimensions: usize,
}

impl HashEmbedder {
    /// Create a hash embedder with the given number of buckets.
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(8),
        }
    }

    fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];

        for token in tokenize(text) {
            let bucket = (fnv1a(token.as_bytes()) as usize) % self.dimensions;
            vector[bucket] += 1.0;
        }

        // L2-normalize so dot product equals cosine similarity.
        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut vector {
                *x /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_sync(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_sync(t)).collect())
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// Lowercased alphanumeric tokens.
fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
}

/// FNV-1a 64-bit. Implemented inline so bucket assignment never changes
/// under us across Rust releases (std hashers make no such promise).
fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::cosine_similarity;

    #[tokio::test]
    async fn test_deterministic() {
        let embedder = HashEmbedder::new(256);
        let a = embedder.embed("refund policy details").await.unwrap();
        let b = embedder.embed("refund policy details").await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_shared_vocabulary_scores_positive() {
        let embedder = HashEmbedder::new(256);
        let query = embedder.embed("refund policy").await.unwrap();
        let matching = embedder
            .embed("Our refund policy allows returns within 30 days.")
            .await
            .unwrap();
        let unrelated = embedder
            .embed("zebra xylophone quartz")
            .await
            .unwrap();

        let hit = cosine_similarity(&query, &matching);
        let miss = cosine_similarity(&query, &unrelated);
        assert!(hit > 0.0);
        assert!(hit > miss);
    }

    #[tokio::test]
    async fn test_vectors_are_normalized() {
        let embedder = HashEmbedder::new(64);
        let v = embedder.embed("some words here").await.unwrap();
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_batch_preserves_order() {
        let embedder = HashEmbedder::new(64);
        let texts = vec!["one".to_string(), "two".to_string(), "three".to_string()];
        let batch = embedder.embed_batch(&texts).await.unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0], embedder.embed("one").await.unwrap());
        assert_eq!(batch[2], embedder.embed("three").await.unwrap());
    }
}
