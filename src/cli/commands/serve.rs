//! HTTP API server for agent integration.
//!
//! Exposes prompt enrichment and feedback endpoints plus knowledge
//! management, backed by the shared store, the enrichment gateway, and a
//! pool of background ingestion workers.

use crate::cli::Output;
use crate::config::Settings;
use crate::embedding::create_embedder;
use crate::error::KildeError;
use crate::gateway::{EnrichmentGateway, EnrichmentRequest, EnrichmentResponse};
use crate::ingest::{IngestionCoordinator, WorkerPool};
use crate::retrieval::ContextAssembler;
use crate::source::SourceKind;
use crate::store::SqliteStore;
use crate::usage::UsageTracker;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};

/// Shared application state.
struct AppState {
    store: Arc<SqliteStore>,
    gateway: EnrichmentGateway,
    coordinator: Arc<IngestionCoordinator>,
    settings: Settings,
}

/// Run the HTTP API server.
pub async fn run_serve(
    host: Option<String>,
    port: Option<u16>,
    settings: Settings,
) -> anyhow::Result<()> {
    let store = Arc::new(SqliteStore::new(&settings.sqlite_path())?);
    let embedder = create_embedder(&settings.embedding);

    let coordinator = Arc::new(IngestionCoordinator::from_settings(
        &settings,
        store.clone(),
        embedder.clone(),
    )?);
    let pool = WorkerPool::spawn(
        coordinator.clone(),
        settings.ingestion.workers,
        Duration::from_millis(settings.ingestion.poll_interval_ms),
    );

    let (usage, usage_task) = UsageTracker::spawn(store.clone());
    let assembler = ContextAssembler::with_settings(store.clone(), embedder, &settings.retrieval);
    let gateway = EnrichmentGateway::new(assembler).with_usage(usage);

    let state = Arc::new(AppState {
        store,
        gateway,
        coordinator,
        settings: settings.clone(),
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(health))
        .route("/enrich-prompt", post(enrich_prompt))
        .route("/submit-feedback", post(submit_feedback))
        .route("/knowledge-bases", get(list_knowledge_bases).post(create_knowledge_base))
        .route("/collections", post(create_collection))
        .route("/documents", post(create_document))
        .route("/documents/{document_id}", get(get_document))
        .route("/jobs/{job_id}/cancel", post(cancel_job))
        .layer(cors)
        .with_state(state);

    let addr = format!(
        "{}:{}",
        host.unwrap_or(settings.server.host),
        port.unwrap_or(settings.server.port)
    );
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    Output::header("Kilde API Server");
    println!();
    Output::success(&format!("Listening on http://{}", addr));
    println!();
    println!("Endpoints:");
    Output::kv("Health", "GET  /health");
    Output::kv("Enrich Prompt", "POST /enrich-prompt");
    Output::kv("Submit Feedback", "POST /submit-feedback");
    Output::kv("Knowledge Bases", "GET|POST /knowledge-bases");
    Output::kv("Collections", "POST /collections");
    Output::kv("Documents", "POST /documents, GET /documents/:id");
    Output::kv("Cancel Job", "POST /jobs/:id/cancel");
    println!();
    Output::info("Press Ctrl+C to stop the server.");

    axum::serve(listener, app).await?;

    pool.shutdown().await;
    usage_task.await?;

    Ok(())
}

// === Request/Response Types ===

#[derive(Deserialize)]
struct EnrichPromptRequest {
    query: String,
    /// Tenant whose knowledge may be searched.
    client_scope_id: String,
    #[serde(default)]
    agent_id: Option<String>,
    original_prompt: String,
    #[serde(default)]
    max_tokens: Option<usize>,
    #[serde(default)]
    top_k: Option<usize>,
}

#[derive(Deserialize)]
struct SubmitFeedbackRequest {
    message_id: String,
    chunk_id: String,
    relevance_score: i64,
    #[serde(default)]
    feedback_text: Option<String>,
}

#[derive(Serialize)]
struct SubmitFeedbackResponse {
    success: bool,
    message: String,
}

#[derive(Deserialize)]
struct CreateKnowledgeBaseRequest {
    tenant_id: String,
    name: String,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Deserialize)]
struct TenantQuery {
    tenant_id: String,
}

#[derive(Deserialize)]
struct CreateCollectionRequest {
    knowledge_base_id: String,
    name: String,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Deserialize)]
struct CreateDocumentRequest {
    collection_id: String,
    #[serde(default)]
    name: Option<String>,
    /// file, url, or text
    source_kind: String,
    /// Path, URL, or the raw text body.
    origin: String,
}

#[derive(Serialize)]
struct CreateDocumentResponse {
    document_id: String,
    job_id: String,
    status: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_status(e: &KildeError) -> StatusCode {
    match e {
        KildeError::Validation(_) => StatusCode::BAD_REQUEST,
        KildeError::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(e: KildeError) -> axum::response::Response {
    (
        error_status(&e),
        Json(ErrorResponse {
            error: e.to_string(),
        }),
    )
        .into_response()
}

// === Handlers ===

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn enrich_prompt(
    State(state): State<Arc<AppState>>,
    Json(req): Json<EnrichPromptRequest>,
) -> impl IntoResponse {
    let request = EnrichmentRequest {
        query: req.query,
        original_prompt: req.original_prompt,
        tenant_id: req.client_scope_id,
        agent_id: req.agent_id,
        max_tokens: req.max_tokens.unwrap_or(state.settings.retrieval.token_budget),
        top_k: req.top_k.unwrap_or(state.settings.retrieval.top_k),
    };

    match state.gateway.enrich(&request).await {
        Ok(response) => Json::<EnrichmentResponse>(response).into_response(),
        Err(e) => error_response(e),
    }
}

async fn submit_feedback(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SubmitFeedbackRequest>,
) -> impl IntoResponse {
    match state.store.insert_feedback(
        &req.message_id,
        &req.chunk_id,
        req.relevance_score,
        req.feedback_text.as_deref(),
    ) {
        Ok(record) => Json(SubmitFeedbackResponse {
            success: true,
            message: format!("Feedback {} recorded", record.id),
        })
        .into_response(),
        Err(e) => error_response(e),
    }
}

async fn create_knowledge_base(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateKnowledgeBaseRequest>,
) -> impl IntoResponse {
    match state
        .store
        .create_knowledge_base(&req.tenant_id, &req.name, req.description.as_deref())
    {
        Ok(kb) => (StatusCode::CREATED, Json(kb)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn list_knowledge_bases(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TenantQuery>,
) -> impl IntoResponse {
    match state.store.list_knowledge_bases(&query.tenant_id) {
        Ok(knowledge_bases) => Json(knowledge_bases).into_response(),
        Err(e) => error_response(e),
    }
}

async fn create_collection(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateCollectionRequest>,
) -> impl IntoResponse {
    match state
        .store
        .create_collection(&req.knowledge_base_id, &req.name, req.description.as_deref())
    {
        Ok(collection) => (StatusCode::CREATED, Json(collection)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn create_document(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateDocumentRequest>,
) -> impl IntoResponse {
    let kind: SourceKind = match req.source_kind.parse() {
        Ok(kind) => kind,
        Err(e) => return error_response(KildeError::Validation(e)),
    };
    let name = req.name.unwrap_or_else(|| match kind {
        SourceKind::Text => "pasted text".to_string(),
        _ => req.origin.clone(),
    });

    let document = match state
        .store
        .create_document(&req.collection_id, &name, kind, &req.origin)
    {
        Ok(document) => document,
        Err(e) => return error_response(e),
    };

    match state.coordinator.enqueue(&document.id) {
        Ok(job) => (
            StatusCode::ACCEPTED,
            Json(CreateDocumentResponse {
                document_id: document.id,
                job_id: job.id,
                status: document.status.to_string(),
            }),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_document(
    State(state): State<Arc<AppState>>,
    Path(document_id): Path<String>,
) -> impl IntoResponse {
    match state.store.get_document(&document_id) {
        Ok(Some(document)) => Json(document).into_response(),
        Ok(None) => error_response(KildeError::NotFound(format!(
            "Document not found: {}",
            document_id
        ))),
        Err(e) => error_response(e),
    }
}

async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> impl IntoResponse {
    match state.store.request_cancel(&job_id) {
        Ok(true) => Json(serde_json::json!({ "success": true })).into_response(),
        Ok(false) => error_response(KildeError::Validation(format!(
            "Job {} is not cancellable",
            job_id
        ))),
        Err(e) => error_response(e),
    }
}
