//! Token-budgeted context assembly.
//!
//! Takes a natural-language query plus a tenant, resolves the tenant's
//! collection scope, runs similarity search, and greedily packs the ranked
//! chunks into a budgeted context block. A chunk that would push the total
//! over budget is excluded whole; chunks are never truncated, because a
//! half-sentence of support material is worse than none.

use super::estimate_tokens;
use crate::config::RetrievalSettings;
use crate::embedding::Embedder;
use crate::error::Result;
use crate::store::{SearchHit, SqliteStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, instrument};

const PREVIEW_CHARS: usize = 160;

/// Attribution for one chunk that made it into the assembled context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsedSource {
    pub chunk_id: String,
    pub document_id: String,
    pub document_name: String,
    pub collection_id: String,
    pub collection_name: String,
    pub similarity: f32,
    pub content_preview: String,
}

/// The result of context assembly for one query.
#[derive(Debug, Clone, Default)]
pub struct AssembledContext {
    /// The packed context block, empty when nothing qualified.
    pub text: String,
    /// Chunks included, in pack order.
    pub used: Vec<UsedSource>,
    pub knowledge_bases_found: usize,
    pub collections_found: usize,
    /// Candidates returned by search before budget packing.
    pub chunks_retrieved: usize,
}

/// Assembles budgeted, attributable context for queries.
pub struct ContextAssembler {
    store: Arc<SqliteStore>,
    embedder: Arc<dyn Embedder>,
    min_similarity: f32,
}

impl ContextAssembler {
    pub fn new(store: Arc<SqliteStore>, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            store,
            embedder,
            min_similarity: 0.0,
        }
    }

    pub fn with_settings(
        store: Arc<SqliteStore>,
        embedder: Arc<dyn Embedder>,
        settings: &RetrievalSettings,
    ) -> Self {
        Self {
            store,
            embedder,
            min_similarity: settings.min_similarity,
        }
    }

    /// Assemble a context block for `query` within `tenant_id`'s scope.
    ///
    /// The returned text never exceeds `token_budget` estimated tokens. A
    /// tenant with no knowledge bases, or a query matching nothing, yields
    /// an empty context rather than an error.
    #[instrument(skip(self, query))]
    pub async fn assemble(
        &self,
        query: &str,
        tenant_id: &str,
        token_budget: usize,
        top_k: usize,
    ) -> Result<AssembledContext> {
        let knowledge_bases = self.store.list_knowledge_bases(tenant_id)?;
        let collections = self.store.collections_for_tenant(tenant_id)?;
        let scope: Vec<String> = collections.iter().map(|c| c.id.clone()).collect();

        if scope.is_empty() {
            debug!("Tenant {} has no searchable collections", tenant_id);
            return Ok(AssembledContext {
                knowledge_bases_found: knowledge_bases.len(),
                ..Default::default()
            });
        }

        let query_vector = self.embedder.embed(query).await?;
        let hits = self.store.search(&query_vector, top_k, &scope, &[])?;
        let chunks_retrieved = hits.len();
        debug!("Retrieved {} candidate chunks", chunks_retrieved);

        let mut text = String::new();
        let mut used = Vec::new();
        let mut spent = 0usize;

        for hit in hits {
            if hit.similarity < self.min_similarity {
                continue;
            }

            let block = render_block(&hit);
            let separator = if text.is_empty() { 0 } else { SEPARATOR_TOKENS };
            let cost = estimate_tokens(&block) + separator;
            if spent + cost > token_budget {
                // Over budget: skip the whole chunk, keep trying smaller ones.
                continue;
            }

            if !text.is_empty() {
                text.push_str("\n\n");
            }
            text.push_str(&block);
            spent += cost;
            used.push(UsedSource {
                content_preview: preview(&hit.content),
                chunk_id: hit.chunk_id,
                document_id: hit.document_id,
                document_name: hit.document_name,
                collection_id: hit.collection_id,
                collection_name: hit.collection_name,
                similarity: hit.similarity,
            });
        }

        debug!(
            "Assembled context: {} chunks, ~{} tokens of {} budget",
            used.len(),
            spent,
            token_budget
        );

        Ok(AssembledContext {
            text,
            used,
            knowledge_bases_found: knowledge_bases.len(),
            collections_found: collections.len(),
            chunks_retrieved,
        })
    }
}

const SEPARATOR_TOKENS: usize = 1;

/// One context block: attribution header plus chunk content.
fn render_block(hit: &SearchHit) -> String {
    format!(
        "[{} / {}]\n{}",
        hit.document_name, hit.collection_name, hit.content
    )
}

fn preview(content: &str) -> String {
    if content.chars().count() <= PREVIEW_CHARS {
        content.to_string()
    } else {
        let cut: String = content.chars().take(PREVIEW_CHARS).collect();
        format!("{}…", cut.trim_end())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedder;
    use crate::source::SourceKind;
    use crate::store::NewChunk;
    use serde_json::json;

    async fn seeded() -> (ContextAssembler, Arc<SqliteStore>) {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new(128));

        let kb = store.create_knowledge_base("tenant-a", "Support", None).unwrap();
        let collection = store.create_collection(&kb.id, "faq", None).unwrap();
        let doc = store
            .create_document(&collection.id, "Refund FAQ", SourceKind::Text, "body")
            .unwrap();

        let contents = [
            "Our refund policy allows returns within 30 days of purchase.",
            "Refund requests are processed in five business days.",
            "The office cafeteria serves lunch from noon until two.",
        ];
        let vectors = embedder
            .embed_batch(&contents.iter().map(|s| s.to_string()).collect::<Vec<_>>())
            .await
            .unwrap();
        let chunks: Vec<NewChunk> = contents
            .iter()
            .zip(vectors)
            .enumerate()
            .map(|(i, (content, embedding))| NewChunk {
                ordinal: i as i64,
                content: content.to_string(),
                embedding: Some(embedding),
                metadata: json!({}),
            })
            .collect();
        store.replace_chunks(&doc.id, &chunks, "cs").unwrap();

        (ContextAssembler::new(Arc::clone(&store), embedder), store)
    }

    #[tokio::test]
    async fn test_assembled_context_stays_within_budget() {
        let (assembler, _) = seeded().await;
        let budget = 30;
        let context = assembler
            .assemble("refund policy", "tenant-a", budget, 10)
            .await
            .unwrap();

        assert!(!context.used.is_empty());
        assert!(estimate_tokens(&context.text) <= budget);
        assert!(context.chunks_retrieved >= context.used.len());
    }

    #[tokio::test]
    async fn test_over_budget_chunk_excluded_whole_never_truncated() {
        let (assembler, _) = seeded().await;
        // Budget fits roughly one block; the runner-up must be dropped, not cut.
        let context = assembler
            .assemble("refund policy", "tenant-a", 25, 10)
            .await
            .unwrap();

        assert_eq!(context.used.len(), 1);
        // The included block carries its full content.
        assert!(context.text.contains("30 days of purchase."));
    }

    #[tokio::test]
    async fn test_unknown_tenant_gets_empty_context() {
        let (assembler, _) = seeded().await;
        let context = assembler
            .assemble("refund policy", "tenant-nobody", 1000, 10)
            .await
            .unwrap();

        assert!(context.text.is_empty());
        assert!(context.used.is_empty());
        assert_eq!(context.knowledge_bases_found, 0);
        assert_eq!(context.collections_found, 0);
    }

    #[tokio::test]
    async fn test_attribution_names_document_and_collection() {
        let (assembler, _) = seeded().await;
        let context = assembler
            .assemble("refund policy", "tenant-a", 1000, 10)
            .await
            .unwrap();

        let top = &context.used[0];
        assert_eq!(top.document_name, "Refund FAQ");
        assert_eq!(top.collection_name, "faq");
        assert!(!top.content_preview.is_empty());
        assert!(context.text.contains("[Refund FAQ / faq]"));
    }

    #[tokio::test]
    async fn test_top_k_caps_candidates() {
        let (assembler, _) = seeded().await;
        let context = assembler
            .assemble("refund policy", "tenant-a", 10_000, 1)
            .await
            .unwrap();
        assert_eq!(context.chunks_retrieved, 1);
        assert_eq!(context.used.len(), 1);
    }

    #[test]
    fn test_preview_truncates_long_content() {
        let long = "x".repeat(500);
        let p = preview(&long);
        assert!(p.chars().count() <= PREVIEW_CHARS + 1);
        assert!(p.ends_with('…'));

        let short = "short enough";
        assert_eq!(preview(short), short);
    }
}
