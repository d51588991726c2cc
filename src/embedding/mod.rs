//! Embedding generation for semantic search and retrieval.

mod hashed;
mod openai;

pub use hashed::HashEmbedder;
pub use openai::OpenAIEmbedder;

use crate::config::EmbeddingSettings;
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Trait for embedding generation.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Generate an embedding for a single text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Generate embeddings for multiple texts, one vector per input,
    /// order-preserving.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Get the embedding dimensions.
    fn dimensions(&self) -> usize;
}

/// Create an embedder based on the configured provider.
///
/// `openai` calls the hosted embedding API; `hash` is a deterministic local
/// bag-of-tokens embedder that needs no network and no key.
pub fn create_embedder(settings: &EmbeddingSettings) -> Arc<dyn Embedder> {
    match settings.provider.as_str() {
        "hash" => Arc::new(HashEmbedder::new(settings.dimensions as usize)),
        _ => Arc::new(OpenAIEmbedder::from_settings(settings)),
    }
}
