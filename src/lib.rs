//! Kilde - Knowledge Retrieval & Prompt Enrichment
//!
//! A local-first engine that turns uploaded material (files, URLs, free text)
//! into a searchable vector index, and at query time assembles a
//! token-budgeted, source-attributed context block that enriches an external
//! agent's prompt.
//!
//! The name "Kilde" comes from the Norwegian/Scandinavian word for "source."
//!
//! # Overview
//!
//! Kilde allows you to:
//! - Build tenant-scoped knowledge bases out of files, URLs, and pasted text
//! - Ingest documents through a tracked chunk → embed → index pipeline
//! - Search chunks by semantic similarity with metadata filters
//! - Enrich an agent prompt with attributed context under a token budget
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - `config` - Configuration management
//! - `source` - Document source abstraction (file, URL, raw text)
//! - `chunking` - Deterministic overlapping text chunking
//! - `embedding` - Embedding generation
//! - `store` - SQLite-backed entities, vector index, and similarity search
//! - `ingest` - Background ingestion jobs and worker pool
//! - `retrieval` - Context assembly under a token budget
//! - `gateway` - The enrich-prompt entry point consumed by agent runtimes
//! - `usage` - Usage tracking and relevance feedback
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use kilde::config::Settings;
//! use kilde::embedding::create_embedder;
//! use kilde::gateway::{EnrichmentGateway, EnrichmentRequest};
//! use kilde::retrieval::ContextAssembler;
//! use kilde::store::SqliteStore;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let settings = Settings::load()?;
//!     let store = Arc::new(SqliteStore::new(&settings.sqlite_path())?);
//!     let embedder = create_embedder(&settings.embedding);
//!     let assembler = ContextAssembler::new(store, embedder);
//!     let gateway = EnrichmentGateway::new(assembler);
//!
//!     let response = gateway
//!         .enrich(&EnrichmentRequest {
//!             query: "refund policy".into(),
//!             original_prompt: "Answer the customer.".into(),
//!             tenant_id: "local".into(),
//!             agent_id: None,
//!             max_tokens: 4000,
//!             top_k: 5,
//!         })
//!         .await?;
//!     println!("{}", response.enriched_prompt);
//!
//!     Ok(())
//! }
//! ```

pub mod chunking;
pub mod cli;
pub mod config;
pub mod embedding;
pub mod error;
pub mod gateway;
pub mod ingest;
pub mod retrieval;
pub mod source;
pub mod store;
pub mod usage;

pub use error::{KildeError, Result};
