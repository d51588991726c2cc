//! Configuration management for Kilde.

mod settings;

pub use settings::{
    ChunkingSettings, EmbeddingSettings, GeneralSettings, IngestionSettings, RetrievalSettings,
    ServerSettings, Settings, StoreSettings,
};
