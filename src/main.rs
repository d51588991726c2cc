//! Kilde CLI entry point.

use anyhow::Result;
use clap::Parser;
use kilde::cli::{commands, Cli, Commands};
use kilde::config::Settings;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| format!("kilde={}", log_level)),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    // Load configuration
    let settings = match &cli.config {
        Some(path) => Settings::load_from(Some(&std::path::PathBuf::from(path)))?,
        None => Settings::load()?,
    };

    // Ensure the data directory exists
    std::fs::create_dir_all(settings.data_dir())?;

    // Execute command
    match &cli.command {
        Commands::Init => {
            commands::run_init(&settings)?;
        }

        Commands::Create { target } => {
            commands::run_create(target, settings)?;
        }

        Commands::Ingest {
            collection,
            input,
            name,
            wait,
        } => {
            commands::run_ingest(collection, input, name.clone(), *wait, settings).await?;
        }

        Commands::Jobs { limit } => {
            commands::run_jobs(*limit, settings)?;
        }

        Commands::Cancel { job_id } => {
            commands::run_cancel(job_id, settings)?;
        }

        Commands::Search {
            query,
            limit,
            min_score,
        } => {
            commands::run_search(query, *limit, *min_score, settings).await?;
        }

        Commands::Enrich {
            query,
            prompt,
            max_tokens,
            top_k,
        } => {
            commands::run_enrich(query, prompt, *max_tokens, *top_k, settings).await?;
        }

        Commands::List => {
            commands::run_list(settings)?;
        }

        Commands::Serve { host, port } => {
            commands::run_serve(host.clone(), *port, settings).await?;
        }

        Commands::Config { action } => {
            commands::run_config(action, settings)?;
        }
    }

    Ok(())
}
