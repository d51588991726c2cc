//! Search command implementation.

use super::open_store;
use crate::cli::Output;
use crate::config::Settings;
use crate::embedding::create_embedder;
use anyhow::Result;

/// Run the search command.
pub async fn run_search(
    query: &str,
    limit: usize,
    min_score: f32,
    settings: Settings,
) -> Result<()> {
    let store = open_store(&settings)?;
    let embedder = create_embedder(&settings.embedding);

    let collections = store.collections_for_tenant(&settings.general.tenant_id)?;
    if collections.is_empty() {
        Output::info("No collections yet. Use 'kilde create' and 'kilde ingest' to add content.");
        return Ok(());
    }
    let scope: Vec<String> = collections.iter().map(|c| c.id.clone()).collect();

    let query_vector = embedder.embed(query).await?;
    let hits = store.search(&query_vector, limit, &scope, &[])?;
    let hits: Vec<_> = hits
        .into_iter()
        .filter(|h| h.similarity >= min_score)
        .collect();

    if hits.is_empty() {
        Output::info("No matching chunks found.");
        return Ok(());
    }

    Output::header(&format!("Results for \"{}\"", query));
    for hit in &hits {
        Output::search_result(
            &hit.document_name,
            &hit.collection_name,
            hit.similarity,
            &hit.content,
        );
    }

    Ok(())
}
