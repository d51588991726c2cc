//! Background ingestion pipeline.
//!
//! The coordinator drives persisted jobs through the fixed stage order:
//! normalize, chunk, embed, store. Job state lives in the database, so the
//! pipeline survives process restarts and any number of workers can share
//! one queue. Failures either re-enter the queue (attempts remaining) or
//! land as permanent, with the document's previous status restored so a
//! ready chunk set is never lost to a failed re-ingestion.

use crate::chunking::TextChunker;
use crate::config::Settings;
use crate::embedding::Embedder;
use crate::error::{KildeError, Result};
use crate::source::DocumentSource;
use crate::store::{JobRecord, JobState, NewChunk, SqliteStore};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// What happened to one claimed job.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub job_id: String,
    pub document_id: String,
    pub chunks_written: usize,
    pub state: JobState,
}

/// Drives ingestion jobs from the persisted queue through the pipeline.
pub struct IngestionCoordinator {
    store: Arc<SqliteStore>,
    embedder: Arc<dyn Embedder>,
    chunker: TextChunker,
    max_attempts: u32,
}

impl IngestionCoordinator {
    pub fn new(
        store: Arc<SqliteStore>,
        embedder: Arc<dyn Embedder>,
        chunker: TextChunker,
        max_attempts: u32,
    ) -> Self {
        Self {
            store,
            embedder,
            chunker,
            max_attempts,
        }
    }

    pub fn from_settings(
        settings: &Settings,
        store: Arc<SqliteStore>,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Self> {
        let chunker = TextChunker::from_settings(&settings.chunking)?;
        Ok(Self::new(
            store,
            embedder,
            chunker,
            settings.ingestion.max_attempts,
        ))
    }

    /// Enqueue an ingestion job for a document. Rejected while the document
    /// already has a pending or processing job.
    pub fn enqueue(&self, document_id: &str) -> Result<JobRecord> {
        self.store.enqueue_job(document_id, self.max_attempts)
    }

    pub fn store(&self) -> &Arc<SqliteStore> {
        &self.store
    }

    /// Claim and process at most one pending job. Returns None when the
    /// queue is empty.
    #[instrument(skip(self))]
    pub async fn run_next(&self) -> Result<Option<JobOutcome>> {
        let job = match self.store.claim_next_job()? {
            Some(job) => job,
            None => return Ok(None),
        };

        info!(
            "Processing job {} for document {} (attempt {}/{})",
            job.id, job.document_id, job.attempts, job.max_attempts
        );

        match self.process(&job).await {
            Ok(chunks_written) => {
                self.store.complete_job(&job.id)?;
                info!(
                    "Job {} completed, {} chunks written",
                    job.id, chunks_written
                );
                Ok(Some(JobOutcome {
                    job_id: job.id,
                    document_id: job.document_id,
                    chunks_written,
                    state: JobState::Completed,
                }))
            }
            Err(KildeError::Ingestion(msg)) if msg == CANCELLED => {
                let failed = self.store.fail_job(&job.id, CANCELLED, false)?;
                info!("Job {} cancelled", job.id);
                Ok(Some(JobOutcome {
                    job_id: failed.id,
                    document_id: failed.document_id,
                    chunks_written: 0,
                    state: failed.state,
                }))
            }
            Err(e) => {
                let retry = job.attempts < job.max_attempts;
                let failed = self.store.fail_job(&job.id, &e.to_string(), retry)?;
                if retry {
                    warn!(
                        "Job {} failed (attempt {}/{}), will retry: {}",
                        job.id, job.attempts, job.max_attempts, e
                    );
                } else {
                    warn!("Job {} failed permanently: {}", job.id, e);
                }
                Ok(Some(JobOutcome {
                    job_id: failed.id,
                    document_id: failed.document_id,
                    chunks_written: 0,
                    state: failed.state,
                }))
            }
        }
    }

    /// Run the full pipeline for one claimed job.
    async fn process(&self, job: &JobRecord) -> Result<usize> {
        let document = self
            .store
            .get_document(&job.document_id)?
            .ok_or_else(|| KildeError::NotFound(format!("Document not found: {}", job.document_id)))?;

        let source = DocumentSource::from_parts(document.source_kind, &document.origin);
        let normalized = source.normalize().await?;
        self.check_cancel(&job.id)?;

        let pieces = self.chunker.chunk(&normalized.text);
        debug!(
            "Document {} normalized to {} chars, {} chunks",
            document.id,
            normalized.text.chars().count(),
            pieces.len()
        );

        // A valid document with no extractable text becomes ready with zero
        // chunks, not a failure.
        if pieces.is_empty() {
            return self
                .store
                .replace_chunks(&document.id, &[], &normalized.checksum);
        }
        self.check_cancel(&job.id)?;

        let vectors = self.embedder.embed_batch(&pieces).await?;
        if vectors.len() != pieces.len() {
            return Err(KildeError::Embedding(format!(
                "Embedder returned {} vectors for {} chunks",
                vectors.len(),
                pieces.len()
            )));
        }
        self.check_cancel(&job.id)?;

        let metadata = json!({
            "source_kind": normalized.source_kind.as_str(),
            "origin": normalized.origin,
            "document_name": document.name,
        });
        let chunks: Vec<NewChunk> = pieces
            .into_iter()
            .zip(vectors)
            .enumerate()
            .map(|(ordinal, (content, embedding))| NewChunk {
                ordinal: ordinal as i64,
                content,
                embedding: Some(embedding),
                metadata: metadata.clone(),
            })
            .collect();

        self.store
            .replace_chunks(&document.id, &chunks, &normalized.checksum)
    }

    fn check_cancel(&self, job_id: &str) -> Result<()> {
        if self.store.cancel_requested(job_id)? {
            return Err(KildeError::Ingestion(CANCELLED.to_string()));
        }
        Ok(())
    }

    /// Poll loop for one worker: drain the queue, then sleep until the next
    /// poll or shutdown.
    pub async fn run_worker(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
        poll_interval: Duration,
    ) {
        loop {
            match self.run_next().await {
                Ok(Some(_)) => continue, // drain while work is available
                Ok(None) => {}
                Err(e) => warn!("Worker error: {}", e),
            }

            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                changed = shutdown.changed() => {
                    // A dropped sender counts as shutdown.
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("Worker shutting down");
                        return;
                    }
                }
            }
        }
    }
}

const CANCELLED: &str = "cancelled by request";

/// A set of background ingestion workers sharing one coordinator.
pub struct WorkerPool {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `workers` polling tasks.
    pub fn spawn(
        coordinator: Arc<IngestionCoordinator>,
        workers: usize,
        poll_interval: Duration,
    ) -> Self {
        let (tx, rx) = watch::channel(false);
        let handles = (0..workers.max(1))
            .map(|i| {
                let coordinator = Arc::clone(&coordinator);
                let rx = rx.clone();
                tokio::spawn(async move {
                    debug!("Ingestion worker {} started", i);
                    coordinator.run_worker(rx, poll_interval).await;
                })
            })
            .collect();
        info!("Spawned {} ingestion workers", workers.max(1));
        Self {
            shutdown: tx,
            handles,
        }
    }

    /// Signal shutdown and wait for all workers to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedder;
    use crate::store::DocumentStatus;
    use crate::source::SourceKind;

    fn coordinator(max_attempts: u32) -> IngestionCoordinator {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new(64));
        let chunker = TextChunker::new(200, 20).unwrap();
        IngestionCoordinator::new(store, embedder, chunker, max_attempts)
    }

    fn seed_document(coordinator: &IngestionCoordinator, body: &str) -> (String, String) {
        let store = coordinator.store();
        let kb = store.create_knowledge_base("tenant-a", "KB", None).unwrap();
        let collection = store.create_collection(&kb.id, "docs", None).unwrap();
        let doc = store
            .create_document(&collection.id, "Doc", SourceKind::Text, body)
            .unwrap();
        (doc.id, collection.id)
    }

    #[tokio::test]
    async fn test_full_pipeline_produces_searchable_chunks() {
        let coordinator = coordinator(3);
        let body = "Our refund policy allows returns within 30 days. \
                    Contact support with your order number to start a return. \
                    Shipping fees are not refundable."
            .repeat(3);
        let (doc_id, collection_id) = seed_document(&coordinator, &body);

        coordinator.enqueue(&doc_id).unwrap();
        let outcome = coordinator.run_next().await.unwrap().unwrap();
        assert_eq!(outcome.state, JobState::Completed);
        assert!(outcome.chunks_written > 1);

        let store = coordinator.store();
        let doc = store.get_document(&doc_id).unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Ready);
        assert!(doc.checksum.is_some());

        let query = coordinator.embedder.embed("refund policy").await.unwrap();
        let hits = store.search(&query, 3, &[collection_id], &[]).unwrap();
        assert!(!hits.is_empty());
        assert!(hits[0].content.contains("refund"));
    }

    #[tokio::test]
    async fn test_reingestion_replaces_not_duplicates() {
        let coordinator = coordinator(3);
        let (doc_id, _) = seed_document(&coordinator, "stable content for reingestion");

        coordinator.enqueue(&doc_id).unwrap();
        coordinator.run_next().await.unwrap().unwrap();
        let first = coordinator.store().document_chunks(&doc_id).unwrap();

        coordinator.enqueue(&doc_id).unwrap();
        coordinator.run_next().await.unwrap().unwrap();
        let second = coordinator.store().document_chunks(&doc_id).unwrap();

        assert_eq!(first.len(), second.len());
        let versions = coordinator.store().document_versions(&doc_id).unwrap();
        assert_eq!(versions.len(), 2);
        // Identical content, identical checksum.
        assert_eq!(versions[0].checksum, versions[1].checksum);
    }

    #[tokio::test]
    async fn test_empty_document_becomes_ready_with_zero_chunks() {
        let coordinator = coordinator(3);
        let (doc_id, _) = seed_document(&coordinator, "   \n\n   ");

        coordinator.enqueue(&doc_id).unwrap();
        let outcome = coordinator.run_next().await.unwrap().unwrap();
        assert_eq!(outcome.state, JobState::Completed);
        assert_eq!(outcome.chunks_written, 0);

        let doc = coordinator.store().get_document(&doc_id).unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Ready);
        assert!(coordinator.store().document_chunks(&doc_id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failure_retries_until_exhausted() {
        let coordinator = coordinator(2);
        let store = coordinator.store();
        let kb = store.create_knowledge_base("tenant-a", "KB", None).unwrap();
        let collection = store.create_collection(&kb.id, "docs", None).unwrap();
        // A file source pointing nowhere fails at the normalize stage.
        let doc = store
            .create_document(
                &collection.id,
                "Missing",
                SourceKind::File,
                "/no/such/file.txt",
            )
            .unwrap();

        coordinator.enqueue(&doc.id).unwrap();

        let first = coordinator.run_next().await.unwrap().unwrap();
        assert_eq!(first.state, JobState::Pending); // re-entered the queue

        let second = coordinator.run_next().await.unwrap().unwrap();
        assert_eq!(second.state, JobState::Failed); // attempts exhausted

        let doc = store.get_document(&doc.id).unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Failed);
        assert!(doc.error.is_some());

        // A terminal job frees the document for another try.
        assert!(coordinator.enqueue(&doc.id).is_ok());
    }

    #[tokio::test]
    async fn test_cancelled_job_lands_failed() {
        let coordinator = coordinator(3);
        let (doc_id, _) = seed_document(&coordinator, "content to cancel");

        let job = coordinator.enqueue(&doc_id).unwrap();
        coordinator.store().request_cancel(&job.id).unwrap();

        let outcome = coordinator.run_next().await.unwrap().unwrap();
        assert_eq!(outcome.state, JobState::Failed);
        assert_eq!(outcome.chunks_written, 0);

        let stored = coordinator.store().get_job(&job.id).unwrap().unwrap();
        assert!(stored.error.unwrap().contains("cancelled"));
        // No chunks were written for the cancelled run.
        assert!(coordinator.store().document_chunks(&doc_id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_enqueue_rejected() {
        let coordinator = coordinator(3);
        let (doc_id, _) = seed_document(&coordinator, "some content");

        coordinator.enqueue(&doc_id).unwrap();
        assert!(matches!(
            coordinator.enqueue(&doc_id),
            Err(KildeError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_queue_returns_none() {
        let coordinator = coordinator(3);
        assert!(coordinator.run_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_worker_pool_processes_and_shuts_down() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new(64));
        let chunker = TextChunker::new(200, 20).unwrap();
        let coordinator = Arc::new(IngestionCoordinator::new(
            Arc::clone(&store),
            embedder,
            chunker,
            3,
        ));

        let kb = store.create_knowledge_base("tenant-a", "KB", None).unwrap();
        let collection = store.create_collection(&kb.id, "docs", None).unwrap();
        let doc = store
            .create_document(&collection.id, "Doc", SourceKind::Text, "pooled content")
            .unwrap();
        coordinator.enqueue(&doc.id).unwrap();

        let pool = WorkerPool::spawn(Arc::clone(&coordinator), 2, Duration::from_millis(10));
        // Give the workers a moment to drain the queue.
        for _ in 0..50 {
            let current = store.get_document(&doc.id).unwrap().unwrap();
            if current.status == DocumentStatus::Ready {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        pool.shutdown().await;

        let doc = store.get_document(&doc.id).unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Ready);
    }
}
