//! Asynchronous usage accounting.
//!
//! Enrichment must never wait on bookkeeping, so usage events travel over an
//! unbounded channel to a single background task that applies the counter
//! upserts. Delivery is at-least-once within the process; an event for a
//! chunk that has since been replaced is logged and dropped, never fatal.

use crate::error::KildeError;
use crate::store::SqliteStore;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// One "this chunk was used in an enrichment" fact.
#[derive(Debug, Clone)]
pub struct UsageEvent {
    pub chunk_id: String,
    pub tenant_id: String,
    pub agent_id: Option<String>,
}

/// Cheap cloneable sender side of the usage pipeline.
#[derive(Debug, Clone)]
pub struct UsageHandle {
    tx: mpsc::UnboundedSender<UsageEvent>,
}

impl UsageHandle {
    /// A bare handle plus its receiver, for wiring a custom consumer.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<UsageEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Record an event. Never blocks; a closed tracker drops the event with
    /// a warning.
    pub fn record(&self, event: UsageEvent) {
        if self.tx.send(event).is_err() {
            warn!("Usage tracker is gone; dropping usage event");
        }
    }
}

/// Background task that drains usage events into the store.
pub struct UsageTracker;

impl UsageTracker {
    /// Spawn the drain task. Dropping every handle ends the task cleanly;
    /// the join handle is returned so a server shutdown can wait for the
    /// queue to flush.
    pub fn spawn(store: Arc<SqliteStore>) -> (UsageHandle, JoinHandle<()>) {
        let (handle, mut rx) = UsageHandle::channel();
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match store.track_usage(
                    &event.chunk_id,
                    &event.tenant_id,
                    event.agent_id.as_deref(),
                ) {
                    Ok(()) => {}
                    Err(KildeError::NotFound(_)) => {
                        // The chunk was replaced between retrieval and now.
                        debug!("Usage event for superseded chunk {}", event.chunk_id);
                    }
                    Err(e) => warn!("Failed to record usage: {}", e),
                }
            }
            debug!("Usage tracker drained and stopped");
        });
        (handle, task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SourceKind;
    use crate::store::NewChunk;
    use serde_json::json;

    fn seeded_chunk(store: &SqliteStore) -> String {
        let kb = store.create_knowledge_base("tenant-a", "KB", None).unwrap();
        let collection = store.create_collection(&kb.id, "c", None).unwrap();
        let doc = store
            .create_document(&collection.id, "Doc", SourceKind::Text, "body")
            .unwrap();
        store
            .replace_chunks(
                &doc.id,
                &[NewChunk {
                    ordinal: 0,
                    content: "content".to_string(),
                    embedding: Some(vec![1.0]),
                    metadata: json!({}),
                }],
                "cs",
            )
            .unwrap();
        store.document_chunks(&doc.id).unwrap()[0].id.clone()
    }

    #[tokio::test]
    async fn test_events_accumulate_counts() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let chunk_id = seeded_chunk(&store);

        let (handle, task) = UsageTracker::spawn(Arc::clone(&store));
        for _ in 0..4 {
            handle.record(UsageEvent {
                chunk_id: chunk_id.clone(),
                tenant_id: "tenant-a".to_string(),
                agent_id: Some("agent-1".to_string()),
            });
        }
        drop(handle);
        task.await.unwrap();

        let stat = store
            .usage_for(&chunk_id, "tenant-a", Some("agent-1"))
            .unwrap()
            .unwrap();
        assert_eq!(stat.usage_count, 4);
    }

    #[tokio::test]
    async fn test_unknown_chunk_event_is_tolerated() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let chunk_id = seeded_chunk(&store);

        let (handle, task) = UsageTracker::spawn(Arc::clone(&store));
        handle.record(UsageEvent {
            chunk_id: "superseded-chunk".to_string(),
            tenant_id: "tenant-a".to_string(),
            agent_id: None,
        });
        handle.record(UsageEvent {
            chunk_id: chunk_id.clone(),
            tenant_id: "tenant-a".to_string(),
            agent_id: None,
        });
        drop(handle);
        task.await.unwrap();

        // The bad event did not take the tracker down.
        let stat = store.usage_for(&chunk_id, "tenant-a", None).unwrap().unwrap();
        assert_eq!(stat.usage_count, 1);
    }
}
