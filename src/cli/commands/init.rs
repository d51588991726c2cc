//! Init command - first-run setup.

use crate::cli::Output;
use crate::config::Settings;
use console::style;

/// Run the init command for first-time setup.
pub fn run_init(settings: &Settings) -> anyhow::Result<()> {
    Output::header("Kilde Setup");
    println!();

    // Data directory and database location
    let data_dir = settings.data_dir();
    if !data_dir.exists() {
        std::fs::create_dir_all(&data_dir)?;
        Output::success(&format!("Created data directory: {}", data_dir.display()));
    } else {
        Output::info(&format!("Data directory exists: {}", data_dir.display()));
    }

    // API key check only matters for the hosted embedding provider
    if settings.embedding.provider == "openai" && std::env::var("OPENAI_API_KEY").is_err() {
        Output::warning("OPENAI_API_KEY environment variable is not set.");
        println!();
        println!("  The openai embedding provider requires an API key.");
        println!(
            "  Set it in your shell configuration: {}",
            style("export OPENAI_API_KEY='sk-...'").green()
        );
        println!(
            "  Or switch to the offline provider: {}",
            style("embedding.provider = \"hash\"").green()
        );
        println!();
    }

    // Config file
    let config_path = Settings::default_config_path();
    if config_path.exists() {
        Output::info(&format!("Config file exists: {}", config_path.display()));
    } else {
        settings.save_to(&config_path)?;
        Output::success(&format!("Created config file: {}", config_path.display()));
    }

    println!();
    println!("{}", style("Setup Complete!").bold().green());
    println!();
    println!("Next steps:");
    println!(
        "  {} Create a knowledge base",
        style("kilde create knowledge-base \"Support\"").cyan()
    );
    println!(
        "  {} Add a collection",
        style("kilde create collection <kb-id> \"faq\"").cyan()
    );
    println!(
        "  {} Ingest your first document",
        style("kilde ingest <collection-id> ./faq.md --wait").cyan()
    );
    println!(
        "  {} Try an enrichment",
        style("kilde enrich \"refund policy\" \"Reply to this customer\"").cyan()
    );

    Ok(())
}
