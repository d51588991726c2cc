//! Error types for Kilde.

use thiserror::Error;

/// Library-level error type for Kilde operations.
#[derive(Error, Debug)]
pub enum KildeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Source normalization failed: {0}")]
    Source(String),

    #[error("Chunking failed: {0}")]
    Chunking(String),

    #[error("Embedding generation failed: {0}")]
    Embedding(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Ingestion failed: {0}")]
    Ingestion(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("OpenAI API error: {0}")]
    OpenAI(String),
}

impl KildeError {
    /// Whether the error is worth retrying (rate limits, timeouts, transient
    /// network failures). Used by the embedding service and the ingestion
    /// coordinator to decide between backoff and permanent failure.
    pub fn is_transient(&self) -> bool {
        match self {
            KildeError::Http(e) => e.is_timeout() || e.is_connect(),
            KildeError::OpenAI(msg) => {
                let msg = msg.to_lowercase();
                msg.contains("rate limit")
                    || msg.contains("429")
                    || msg.contains("timeout")
                    || msg.contains("server_error")
                    || msg.contains("503")
            }
            _ => false,
        }
    }
}

/// Result type alias for Kilde operations.
pub type Result<T> = std::result::Result<T, KildeError>;
