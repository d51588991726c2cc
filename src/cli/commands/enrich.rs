//! Enrich command - run one prompt enrichment from the terminal.

use super::open_store;
use crate::cli::Output;
use crate::config::Settings;
use crate::embedding::create_embedder;
use crate::gateway::{EnrichmentGateway, EnrichmentRequest};
use crate::retrieval::ContextAssembler;
use crate::usage::UsageTracker;
use anyhow::Result;

/// Run the enrich command.
pub async fn run_enrich(
    query: &str,
    prompt: &str,
    max_tokens: Option<usize>,
    top_k: Option<usize>,
    settings: Settings,
) -> Result<()> {
    let store = open_store(&settings)?;
    let embedder = create_embedder(&settings.embedding);

    let assembler =
        ContextAssembler::with_settings(store.clone(), embedder, &settings.retrieval);
    let (usage, usage_task) = UsageTracker::spawn(store.clone());
    let gateway = EnrichmentGateway::new(assembler).with_usage(usage);

    let response = gateway
        .enrich(&EnrichmentRequest {
            query: query.to_string(),
            original_prompt: prompt.to_string(),
            tenant_id: settings.general.tenant_id.clone(),
            agent_id: None,
            max_tokens: max_tokens.unwrap_or(settings.retrieval.token_budget),
            top_k: top_k.unwrap_or(settings.retrieval.top_k),
        })
        .await?;

    // Let the usage queue flush before the process exits.
    drop(gateway);
    usage_task.await?;

    Output::header("Enriched Prompt");
    println!();
    println!("{}", response.enriched_prompt);
    println!();

    if response.used_sources.is_empty() {
        Output::info("No context was injected.");
    } else {
        Output::header(&format!("Sources ({})", response.used_sources.len()));
        for source in &response.used_sources {
            Output::list_item(&format!(
                "{} [{}] (score: {:.2})",
                source.document_name, source.collection_name, source.similarity
            ));
        }
    }
    Output::kv(
        "Retrieved",
        &response.metadata.chunks_retrieved.to_string(),
    );
    Output::kv("Used", &response.metadata.chunks_used.to_string());

    Ok(())
}
