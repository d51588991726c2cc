//! Prompt enrichment gateway.
//!
//! The single entry point agents call before talking to their model: take a
//! query and an original prompt, assemble budgeted context, and weave it in
//! front of the untouched prompt. Enrichment is strictly best-effort — if
//! retrieval fails for any reason the agent gets its original prompt back
//! unchanged rather than an error, because a missing context block is
//! recoverable and a failed agent request is not.

use crate::error::{KildeError, Result};
use crate::retrieval::{ContextAssembler, UsedSource};
use crate::usage::{UsageEvent, UsageHandle};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

/// Sentence that introduces retrieved context ahead of the original prompt.
const CONTEXT_FRAMING: &str =
    "The following background information may be relevant to the request:";

/// One enrichment request from an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentRequest {
    /// What to search for.
    pub query: String,
    /// The prompt to enrich; returned verbatim as the suffix.
    pub original_prompt: String,
    /// Scope owner; only this tenant's collections are searched.
    pub tenant_id: String,
    /// Optional calling-agent identity for usage accounting.
    pub agent_id: Option<String>,
    /// Token budget for the injected context.
    pub max_tokens: usize,
    /// Candidate chunks to retrieve before packing.
    pub top_k: usize,
}

/// Counters describing what retrieval saw and used.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnrichmentMetadata {
    pub knowledge_bases_found: usize,
    pub collections_found: usize,
    pub chunks_retrieved: usize,
    pub chunks_used: usize,
}

/// The enriched prompt plus full attribution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentResponse {
    pub enriched_prompt: String,
    pub used_sources: Vec<UsedSource>,
    pub metadata: EnrichmentMetadata,
}

/// Assembles context and enriches prompts, recording chunk usage as it goes.
pub struct EnrichmentGateway {
    assembler: ContextAssembler,
    usage: Option<UsageHandle>,
}

impl EnrichmentGateway {
    pub fn new(assembler: ContextAssembler) -> Self {
        Self {
            assembler,
            usage: None,
        }
    }

    /// Attach a usage tracker; every chunk included in an enrichment gets a
    /// fire-and-forget usage event.
    pub fn with_usage(mut self, usage: UsageHandle) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Enrich a prompt with retrieved context.
    ///
    /// Invalid input is the caller's error and is returned as such. Anything
    /// that goes wrong after validation fails open: the response carries the
    /// original prompt untouched with zero sources.
    #[instrument(skip(self, request), fields(tenant = %request.tenant_id))]
    pub async fn enrich(&self, request: &EnrichmentRequest) -> Result<EnrichmentResponse> {
        validate(request)?;

        let context = match self
            .assembler
            .assemble(
                &request.query,
                &request.tenant_id,
                request.max_tokens,
                request.top_k,
            )
            .await
        {
            Ok(context) => context,
            Err(e) => {
                warn!("Context assembly failed, returning prompt unenriched: {}", e);
                return Ok(EnrichmentResponse {
                    enriched_prompt: request.original_prompt.clone(),
                    used_sources: Vec::new(),
                    metadata: EnrichmentMetadata::default(),
                });
            }
        };

        let metadata = EnrichmentMetadata {
            knowledge_bases_found: context.knowledge_bases_found,
            collections_found: context.collections_found,
            chunks_retrieved: context.chunks_retrieved,
            chunks_used: context.used.len(),
        };

        // Nothing qualified: the prompt passes through byte-identical.
        if context.used.is_empty() {
            debug!("No context qualified; prompt unchanged");
            return Ok(EnrichmentResponse {
                enriched_prompt: request.original_prompt.clone(),
                used_sources: Vec::new(),
                metadata,
            });
        }

        if let Some(usage) = &self.usage {
            for source in &context.used {
                usage.record(UsageEvent {
                    chunk_id: source.chunk_id.clone(),
                    tenant_id: request.tenant_id.clone(),
                    agent_id: request.agent_id.clone(),
                });
            }
        }

        let enriched_prompt = format!(
            "{}\n\n{}\n\n{}",
            CONTEXT_FRAMING, context.text, request.original_prompt
        );

        Ok(EnrichmentResponse {
            enriched_prompt,
            used_sources: context.used,
            metadata,
        })
    }
}

fn validate(request: &EnrichmentRequest) -> Result<()> {
    if request.tenant_id.trim().is_empty() {
        return Err(KildeError::Validation("tenant_id must not be empty".into()));
    }
    if request.query.trim().is_empty() {
        return Err(KildeError::Validation("query must not be empty".into()));
    }
    if request.max_tokens == 0 {
        return Err(KildeError::Validation("max_tokens must be positive".into()));
    }
    if request.top_k == 0 {
        return Err(KildeError::Validation("top_k must be positive".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{Embedder, HashEmbedder};
    use crate::source::SourceKind;
    use crate::store::{NewChunk, SqliteStore};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Arc;

    fn request(query: &str, prompt: &str) -> EnrichmentRequest {
        EnrichmentRequest {
            query: query.to_string(),
            original_prompt: prompt.to_string(),
            tenant_id: "tenant-a".to_string(),
            agent_id: Some("agent-1".to_string()),
            max_tokens: 1000,
            top_k: 5,
        }
    }

    async fn seeded_gateway() -> (EnrichmentGateway, Arc<SqliteStore>) {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new(128));

        let kb = store.create_knowledge_base("tenant-a", "Support", None).unwrap();
        let collection = store.create_collection(&kb.id, "faq", None).unwrap();
        let doc = store
            .create_document(&collection.id, "Refund FAQ", SourceKind::Text, "body")
            .unwrap();
        let content = "Our refund policy allows returns within 30 days.";
        let vector = embedder.embed(content).await.unwrap();
        store
            .replace_chunks(
                &doc.id,
                &[NewChunk {
                    ordinal: 0,
                    content: content.to_string(),
                    embedding: Some(vector),
                    metadata: json!({}),
                }],
                "cs",
            )
            .unwrap();

        let assembler = ContextAssembler::new(Arc::clone(&store), embedder);
        (EnrichmentGateway::new(assembler), store)
    }

    /// An embedder that always fails, to exercise the fail-open path.
    struct BrokenEmbedder;

    #[async_trait]
    impl Embedder for BrokenEmbedder {
        async fn embed(&self, _text: &str) -> crate::error::Result<Vec<f32>> {
            Err(KildeError::Embedding("provider unreachable".to_string()))
        }

        async fn embed_batch(&self, _texts: &[String]) -> crate::error::Result<Vec<Vec<f32>>> {
            Err(KildeError::Embedding("provider unreachable".to_string()))
        }

        fn dimensions(&self) -> usize {
            8
        }
    }

    #[tokio::test]
    async fn test_original_prompt_is_verbatim_suffix() {
        let (gateway, _) = seeded_gateway().await;
        let prompt = "Draft a reply to this customer about their refund.";
        let response = gateway.enrich(&request("refund policy", prompt)).await.unwrap();

        assert!(response.enriched_prompt.ends_with(prompt));
        assert!(response.enriched_prompt.starts_with(CONTEXT_FRAMING));
        assert!(response.enriched_prompt.contains("30 days"));
        assert_eq!(response.metadata.chunks_used, response.used_sources.len());
        assert_eq!(response.used_sources[0].document_name, "Refund FAQ");
    }

    #[tokio::test]
    async fn test_empty_scope_passes_prompt_through_unchanged() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new(64));
        let gateway = EnrichmentGateway::new(ContextAssembler::new(store, embedder));

        let prompt = "Answer the question.";
        let response = gateway.enrich(&request("anything", prompt)).await.unwrap();
        assert_eq!(response.enriched_prompt, prompt);
        assert!(response.used_sources.is_empty());
        assert_eq!(response.metadata.knowledge_bases_found, 0);
    }

    #[tokio::test]
    async fn test_assembly_failure_fails_open() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        store.create_knowledge_base("tenant-a", "KB", None).unwrap();
        let kb = store.list_knowledge_bases("tenant-a").unwrap();
        store.create_collection(&kb[0].id, "c", None).unwrap();

        let gateway = EnrichmentGateway::new(ContextAssembler::new(
            Arc::clone(&store),
            Arc::new(BrokenEmbedder),
        ));

        let prompt = "The prompt that must survive.";
        let response = gateway.enrich(&request("query", prompt)).await.unwrap();
        assert_eq!(response.enriched_prompt, prompt);
        assert!(response.used_sources.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_input_is_an_error_not_fail_open() {
        let (gateway, _) = seeded_gateway().await;

        let mut bad = request("", "prompt");
        assert!(gateway.enrich(&bad).await.is_err());

        bad = request("query", "prompt");
        bad.tenant_id = "  ".to_string();
        assert!(gateway.enrich(&bad).await.is_err());

        bad = request("query", "prompt");
        bad.max_tokens = 0;
        assert!(gateway.enrich(&bad).await.is_err());

        bad = request("query", "prompt");
        bad.top_k = 0;
        assert!(gateway.enrich(&bad).await.is_err());
    }

    #[tokio::test]
    async fn test_usage_recorded_for_included_chunks() {
        let (gateway, store) = seeded_gateway().await;
        let (handle, mut rx) = UsageHandle::channel();
        let gateway = gateway.with_usage(handle);

        let response = gateway
            .enrich(&request("refund policy", "prompt"))
            .await
            .unwrap();
        assert_eq!(response.used_sources.len(), 1);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.chunk_id, response.used_sources[0].chunk_id);
        assert_eq!(event.tenant_id, "tenant-a");
        assert_eq!(event.agent_id.as_deref(), Some("agent-1"));
        let _ = store;
    }
}
