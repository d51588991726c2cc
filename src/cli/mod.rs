//! CLI module for Kilde.

pub mod commands;
mod output;

pub use output::Output;

use clap::{Parser, Subcommand};

/// Kilde - Knowledge Retrieval and Prompt Enrichment
///
/// Ingest documents into searchable knowledge bases and enrich agent prompts
/// with relevant, attributable context. The name "Kilde" comes from the
/// Norwegian/Scandinavian word for "source."
#[derive(Parser, Debug)]
#[command(name = "kilde")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize Kilde and create the default configuration
    Init,

    /// Create a knowledge base or collection
    Create {
        #[command(subcommand)]
        target: CreateTarget,
    },

    /// Ingest a file, URL, or text into a collection
    Ingest {
        /// Collection id to ingest into
        collection: String,

        /// File path, http(s) URL, or raw text
        input: String,

        /// Document name (defaults to the input itself)
        #[arg(short, long)]
        name: Option<String>,

        /// Block until the ingestion job reaches a terminal state
        #[arg(short, long)]
        wait: bool,
    },

    /// List recent ingestion jobs
    Jobs {
        /// Maximum number of jobs to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Request cancellation of a pending or running job
    Cancel {
        /// Job id to cancel
        job_id: String,
    },

    /// Search the configured tenant's knowledge for relevant chunks
    Search {
        /// Search query
        query: String,

        /// Maximum number of results
        #[arg(short, long, default_value = "5")]
        limit: usize,

        /// Minimum similarity score (0.0-1.0)
        #[arg(short, long, default_value = "0.0")]
        min_score: f32,
    },

    /// Enrich a prompt with retrieved context and print the result
    Enrich {
        /// What to search for
        query: String,

        /// The prompt to enrich
        prompt: String,

        /// Token budget for injected context
        #[arg(long)]
        max_tokens: Option<usize>,

        /// Candidate chunks to retrieve
        #[arg(long)]
        top_k: Option<usize>,
    },

    /// List knowledge bases, collections, and documents
    List,

    /// Start the HTTP API server with background ingestion workers
    Serve {
        /// Host to bind to (defaults to configuration)
        #[arg(long)]
        host: Option<String>,

        /// Port to bind to (defaults to configuration)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum CreateTarget {
    /// Create a knowledge base for the configured tenant
    KnowledgeBase {
        /// Knowledge base name
        name: String,

        /// Optional description
        #[arg(short, long)]
        description: Option<String>,
    },

    /// Create a collection inside a knowledge base
    Collection {
        /// Owning knowledge base id
        knowledge_base: String,

        /// Collection name
        name: String,

        /// Optional description
        #[arg(short, long)]
        description: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show configuration file path
    Path,
}
