//! Jobs and cancel commands - ingestion queue visibility.

use super::open_store;
use crate::cli::Output;
use crate::config::Settings;
use anyhow::Result;

/// Run the jobs command.
pub fn run_jobs(limit: usize, settings: Settings) -> Result<()> {
    let store = open_store(&settings)?;
    let jobs = store.list_jobs(limit)?;

    if jobs.is_empty() {
        Output::info("No ingestion jobs yet. Use 'kilde ingest <collection> <input>' to add content.");
        return Ok(());
    }

    Output::header(&format!("Ingestion Jobs ({})", jobs.len()));
    println!();
    for job in &jobs {
        let mut line = format!(
            "{} document={} state={} attempts={}/{}",
            job.id, job.document_id, job.state, job.attempts, job.max_attempts
        );
        if job.cancel_requested && !job.state.is_terminal() {
            line.push_str(" (cancel requested)");
        }
        Output::list_item(&line);
        if let Some(error) = &job.error {
            Output::kv("error", error);
        }
    }

    Ok(())
}

/// Run the cancel command.
pub fn run_cancel(job_id: &str, settings: Settings) -> Result<()> {
    let store = open_store(&settings)?;
    if store.request_cancel(job_id)? {
        Output::success(&format!("Cancellation requested for job {}", job_id));
        Output::info("The job will stop at its next pipeline checkpoint.");
    } else {
        Output::warning(&format!(
            "Job {} is not cancellable (unknown id or already finished)",
            job_id
        ));
    }
    Ok(())
}
