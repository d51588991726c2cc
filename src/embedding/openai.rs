//! OpenAI embeddings implementation.
//!
//! Batches chunk texts per provider call and retries transient failures
//! (rate limits, timeouts) with exponential backoff. Retry exhaustion is an
//! error: a document must never end up with some chunks embedded and others
//! silently missing.

use super::Embedder;
use crate::config::EmbeddingSettings;
use crate::error::{KildeError, Result};
use async_openai::config::OpenAIConfig;
use async_openai::types::{CreateEmbeddingRequestArgs, EmbeddingInput};
use async_openai::Client;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// OpenAI-based embedder.
pub struct OpenAIEmbedder {
    client: Client<OpenAIConfig>,
    model: String,
    dimensions: usize,
    batch_size: usize,
    max_retries: u32,
    backoff: Duration,
}

impl OpenAIEmbedder {
    /// Create a new OpenAI embedder with default settings.
    pub fn new() -> Self {
        Self::from_settings(&EmbeddingSettings::default())
    }

    /// Create a new OpenAI embedder from configuration.
    pub fn from_settings(settings: &EmbeddingSettings) -> Self {
        // The HTTP timeout is the only place a request may block for long;
        // an elapsed timeout is treated as transient and retried.
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client: Client::with_config(OpenAIConfig::default()).with_http_client(http_client),
            model: settings.model.clone(),
            dimensions: settings.dimensions as usize,
            batch_size: settings.batch_size.max(1),
            max_retries: settings.max_retries,
            backoff: Duration::from_millis(settings.backoff_ms),
        }
    }

    /// One provider call for a single batch, no retry logic.
    async fn embed_call(&self, batch: &[String]) -> Result<Vec<Vec<f32>>> {
        let request = CreateEmbeddingRequestArgs::default()
            .model(&self.model)
            .input(EmbeddingInput::StringArray(batch.to_vec()))
            .dimensions(self.dimensions as u32)
            .build()
            .map_err(|e| KildeError::Embedding(format!("Failed to build request: {}", e)))?;

        let response = self
            .client
            .embeddings()
            .create(request)
            .await
            .map_err(|e| KildeError::OpenAI(format!("Embedding API error: {}", e)))?;

        // Sort by index to ensure correct order
        let mut embeddings: Vec<_> = response.data.into_iter().collect();
        embeddings.sort_by_key(|e| e.index);

        if embeddings.len() != batch.len() {
            return Err(KildeError::Embedding(format!(
                "Provider returned {} embeddings for {} inputs",
                embeddings.len(),
                batch.len()
            )));
        }

        Ok(embeddings.into_iter().map(|e| e.embedding).collect())
    }

    /// Call the provider with exponential backoff on transient failures.
    async fn embed_with_retry(&self, batch: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut attempt = 0u32;
        loop {
            match self.embed_call(batch).await {
                Ok(vectors) => return Ok(vectors),
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    let delay = self.backoff * 2u32.saturating_pow(attempt);
                    warn!(
                        "Transient embedding failure (attempt {}/{}), retrying in {:?}: {}",
                        attempt + 1,
                        self.max_retries,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for OpenAIEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Embedder for OpenAIEmbedder {
    #[instrument(skip(self, text))]
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let embeddings = self.embed_batch(&[text.to_string()]).await?;
        embeddings
            .into_iter()
            .next()
            .ok_or_else(|| KildeError::Embedding("Empty embedding response".to_string()))
    }

    #[instrument(skip(self, texts), fields(count = texts.len()))]
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        debug!("Generating embeddings for {} texts", texts.len());

        let mut all_embeddings = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let vectors = self.embed_with_retry(batch).await?;
            all_embeddings.extend(vectors);
        }

        debug!("Generated {} embeddings", all_embeddings.len());
        Ok(all_embeddings)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedder_creation() {
        let embedder = OpenAIEmbedder::new();
        assert_eq!(embedder.dimensions(), 1536);

        let mut settings = EmbeddingSettings::default();
        settings.model = "text-embedding-3-large".to_string();
        settings.dimensions = 3072;
        let embedder = OpenAIEmbedder::from_settings(&settings);
        assert_eq!(embedder.dimensions(), 3072);
    }

    #[test]
    fn test_transient_classification() {
        assert!(KildeError::OpenAI("429 rate limit exceeded".to_string()).is_transient());
        assert!(KildeError::OpenAI("request timeout".to_string()).is_transient());
        assert!(!KildeError::OpenAI("invalid api key".to_string()).is_transient());
        assert!(!KildeError::Validation("bad input".to_string()).is_transient());
    }
}
