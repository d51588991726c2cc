//! Ingest command - add a document and run its ingestion job.

use super::open_store;
use crate::cli::Output;
use crate::config::Settings;
use crate::embedding::create_embedder;
use crate::ingest::IngestionCoordinator;
use crate::source::detect_source;
use crate::store::JobState;
use anyhow::Result;

/// Run the ingest command.
pub async fn run_ingest(
    collection: &str,
    input: &str,
    name: Option<String>,
    wait: bool,
    settings: Settings,
) -> Result<()> {
    let store = open_store(&settings)?;
    let embedder = create_embedder(&settings.embedding);

    let source = detect_source(input);
    let kind = source.kind();
    let document_name = name.unwrap_or_else(|| match kind {
        crate::source::SourceKind::Text => "pasted text".to_string(),
        _ => input.to_string(),
    });

    let document = store.create_document(collection, &document_name, kind, &source.origin())?;
    Output::info(&format!(
        "Created document '{}' ({} source)",
        document.name, kind
    ));
    Output::kv("Id", &document.id);

    let coordinator =
        IngestionCoordinator::from_settings(&settings, store.clone(), embedder)?;
    let job = coordinator.enqueue(&document.id)?;
    Output::info(&format!("Enqueued ingestion job {}", job.id));

    if !wait {
        Output::info("Job is queued; check progress with 'kilde jobs'.");
        return Ok(());
    }

    // Drive the queue in-process until this document's job is terminal.
    loop {
        let outcome = coordinator.run_next().await?;
        let current = coordinator
            .store()
            .get_job(&job.id)?
            .ok_or_else(|| anyhow::anyhow!("Job disappeared: {}", job.id))?;
        if current.state.is_terminal() {
            match current.state {
                JobState::Completed => {
                    let chunks = outcome
                        .filter(|o| o.job_id == job.id)
                        .map(|o| o.chunks_written)
                        .unwrap_or_default();
                    Output::success(&format!("Ingestion complete ({} chunks)", chunks));
                }
                _ => {
                    Output::error(&format!(
                        "Ingestion failed: {}",
                        current.error.unwrap_or_else(|| "unknown error".to_string())
                    ));
                }
            }
            break;
        }
        if outcome.is_none() {
            tokio::time::sleep(std::time::Duration::from_millis(
                settings.ingestion.poll_interval_ms,
            ))
            .await;
        }
    }

    Ok(())
}
