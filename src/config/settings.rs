//! Configuration settings for Kilde.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct Settings {
    pub general: GeneralSettings,
    pub store: StoreSettings,
    pub embedding: EmbeddingSettings,
    pub chunking: ChunkingSettings,
    pub retrieval: RetrievalSettings,
    pub ingestion: IngestionSettings,
    pub server: ServerSettings,
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralSettings {
    /// Directory for storing application data.
    pub data_dir: String,
    /// Tenant the CLI operates as. Server requests carry their own scope.
    pub tenant_id: String,
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            data_dir: "~/.kilde".to_string(),
            tenant_id: "local".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// Store provider (sqlite).
    pub provider: String,
    /// Path to SQLite database.
    pub sqlite_path: String,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            provider: "sqlite".to_string(),
            sqlite_path: "~/.kilde/knowledge.db".to_string(),
        }
    }
}

/// Embedding generation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingSettings {
    /// Embedding provider (openai, hash).
    pub provider: String,
    /// Embedding model to use (openai provider).
    pub model: String,
    /// Embedding dimensions.
    pub dimensions: u32,
    /// Maximum chunks per provider call.
    pub batch_size: usize,
    /// Retry attempts for transient provider failures.
    pub max_retries: u32,
    /// Base backoff delay between retries, doubled per attempt.
    pub backoff_ms: u64,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "text-embedding-3-small".to_string(),
            dimensions: 1536,
            batch_size: 100,
            max_retries: 3,
            backoff_ms: 500,
            request_timeout_secs: 60,
        }
    }
}

/// Text chunking settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingSettings {
    /// Maximum chunk size in characters.
    pub max_chunk_size: usize,
    /// Overlap between consecutive chunks in characters. Must be smaller
    /// than `max_chunk_size`.
    pub overlap: usize,
}

impl Default for ChunkingSettings {
    fn default() -> Self {
        Self {
            max_chunk_size: 1200,
            overlap: 150,
        }
    }
}

/// Retrieval and context assembly settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalSettings {
    /// Default number of candidate chunks to retrieve.
    pub top_k: usize,
    /// Default token budget for assembled context.
    pub token_budget: usize,
    /// Minimum similarity for a chunk to be considered at all.
    pub min_similarity: f32,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            top_k: 5,
            token_budget: 4000,
            min_similarity: 0.0,
        }
    }
}

/// Background ingestion settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestionSettings {
    /// Number of background ingestion workers.
    pub workers: usize,
    /// Maximum attempts per job before it is surfaced as a permanent failure.
    pub max_attempts: u32,
    /// How often an idle worker polls for pending jobs, in milliseconds.
    pub poll_interval_ms: u64,
}

impl Default for IngestionSettings {
    fn default() -> Self {
        Self {
            workers: 2,
            max_attempts: 3,
            poll_interval_ms: 500,
        }
    }
}

/// HTTP API server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7171,
        }
    }
}

impl Settings {
    /// Load settings from the default configuration file.
    pub fn load() -> crate::error::Result<Self> {
        Self::load_from(None)
    }

    /// Load settings from a specific path, or default location if None.
    pub fn load_from(path: Option<&PathBuf>) -> crate::error::Result<Self> {
        let config_path = match path {
            Some(p) => p.clone(),
            None => Self::default_config_path(),
        };

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let settings: Settings = toml::from_str(&content)?;
            settings.validate()?;
            Ok(settings)
        } else {
            Ok(Settings::default())
        }
    }

    /// Save settings to the default configuration file.
    pub fn save(&self) -> crate::error::Result<()> {
        self.save_to(&Self::default_config_path())
    }

    /// Save settings to a specific path.
    pub fn save_to(&self, path: &PathBuf) -> crate::error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::KildeError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject configurations that would violate pipeline invariants.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.chunking.max_chunk_size == 0 {
            return Err(crate::error::KildeError::Config(
                "chunking.max_chunk_size must be positive".to_string(),
            ));
        }
        if self.chunking.overlap >= self.chunking.max_chunk_size {
            return Err(crate::error::KildeError::Config(format!(
                "chunking.overlap ({}) must be smaller than max_chunk_size ({})",
                self.chunking.overlap, self.chunking.max_chunk_size
            )));
        }
        if self.embedding.batch_size == 0 {
            return Err(crate::error::KildeError::Config(
                "embedding.batch_size must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Get the default configuration file path.
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("kilde")
            .join("config.toml")
    }

    /// Expand shell variables in paths (e.g., ~).
    pub fn expand_path(path: &str) -> PathBuf {
        PathBuf::from(shellexpand::tilde(path).to_string())
    }

    /// Get the expanded data directory path.
    pub fn data_dir(&self) -> PathBuf {
        Self::expand_path(&self.general.data_dir)
    }

    /// Get the expanded SQLite database path.
    pub fn sqlite_path(&self) -> PathBuf {
        Self::expand_path(&self.store.sqlite_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.general.tenant_id, "local");
        assert_eq!(settings.embedding.dimensions, 1536);
    }

    #[test]
    fn test_overlap_must_be_smaller_than_chunk_size() {
        let mut settings = Settings::default();
        settings.chunking.max_chunk_size = 100;
        settings.chunking.overlap = 100;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_roundtrip_toml() {
        let settings = Settings::default();
        let text = toml::to_string_pretty(&settings).unwrap();
        let parsed: Settings = toml::from_str(&text).unwrap();
        assert_eq!(parsed.server.port, settings.server.port);
        assert_eq!(parsed.chunking.max_chunk_size, settings.chunking.max_chunk_size);
    }
}
