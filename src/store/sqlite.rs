//! SQLite-backed knowledge store.
//!
//! Uses SQLite with cosine similarity computed in Rust for simplicity.
//! For production use cases with large corpora, consider the sqlite-vec
//! extension or a dedicated vector database.
//!
//! Two invariants live in the schema rather than in process memory, so they
//! hold across any number of worker processes:
//! - at most one active (non-terminal) ingestion job per document, enforced
//!   by a partial unique index;
//! - chunk replacement is a single transaction, so readers observe either
//!   the fully-old or fully-new chunk set, never a mix.

use super::filter::{compile, ChunkFilter};
use super::{
    cosine_similarity, ChunkRecord, Collection, DocumentRecord, DocumentStatus, DocumentVersion,
    FeedbackRecord, JobRecord, JobState, KnowledgeBase, NewChunk, SearchHit, UsageStat,
};
use crate::error::{KildeError, Result};
use crate::source::SourceKind;
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info, instrument};
use uuid::Uuid;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS knowledge_bases (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    name TEXT NOT NULL,
    description TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_kb_tenant ON knowledge_bases(tenant_id);

CREATE TABLE IF NOT EXISTS collections (
    id TEXT PRIMARY KEY,
    knowledge_base_id TEXT NOT NULL REFERENCES knowledge_bases(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    description TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_collections_kb ON collections(knowledge_base_id);

CREATE TABLE IF NOT EXISTS documents (
    id TEXT PRIMARY KEY,
    collection_id TEXT NOT NULL REFERENCES collections(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    source_kind TEXT NOT NULL CHECK (source_kind IN ('file', 'url', 'text')),
    origin TEXT NOT NULL,
    checksum TEXT,
    status TEXT NOT NULL DEFAULT 'pending'
        CHECK (status IN ('pending', 'processing', 'ready', 'failed')),
    error TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_documents_collection ON documents(collection_id);

CREATE TABLE IF NOT EXISTS document_versions (
    id TEXT PRIMARY KEY,
    document_id TEXT NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
    version INTEGER NOT NULL,
    checksum TEXT NOT NULL,
    chunk_count INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE (document_id, version)
);

CREATE TABLE IF NOT EXISTS document_chunks (
    id TEXT PRIMARY KEY,
    document_id TEXT NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
    ordinal INTEGER NOT NULL,
    content TEXT NOT NULL,
    embedding BLOB,
    metadata_json TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    UNIQUE (document_id, ordinal)
);
CREATE INDEX IF NOT EXISTS idx_chunks_document ON document_chunks(document_id);

CREATE TABLE IF NOT EXISTS processing_jobs (
    id TEXT PRIMARY KEY,
    document_id TEXT NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
    state TEXT NOT NULL DEFAULT 'pending'
        CHECK (state IN ('pending', 'processing', 'completed', 'failed')),
    attempts INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL DEFAULT 3,
    prior_status TEXT,
    error TEXT,
    cancel_requested INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    started_at TEXT,
    finished_at TEXT
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_active
    ON processing_jobs(document_id) WHERE state IN ('pending', 'processing');

CREATE TABLE IF NOT EXISTS usage_stats (
    chunk_id TEXT NOT NULL,
    tenant_id TEXT NOT NULL,
    agent_id TEXT NOT NULL DEFAULT '',
    usage_count INTEGER NOT NULL DEFAULT 0,
    first_used_at TEXT NOT NULL,
    last_used_at TEXT NOT NULL,
    PRIMARY KEY (chunk_id, tenant_id, agent_id)
);

CREATE TABLE IF NOT EXISTS feedback (
    id TEXT PRIMARY KEY,
    message_id TEXT NOT NULL,
    chunk_id TEXT NOT NULL,
    relevance_score INTEGER NOT NULL CHECK (relevance_score BETWEEN 1 AND 5),
    comment TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_feedback_chunk ON feedback(chunk_id);
"#;

/// SQLite-backed knowledge store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Create or open a store at the given path.
    #[instrument(skip_all)]
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA)?;

        info!("Initialized knowledge store at {:?}", path);

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory store (useful for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| KildeError::Store(format!("Failed to acquire lock: {}", e)))
    }

    /// Serialize embedding to bytes.
    fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
        embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
    }

    /// Deserialize embedding from bytes.
    fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
        bytes
            .chunks_exact(4)
            .map(|chunk| {
                let arr: [u8; 4] = chunk.try_into().unwrap_or_default();
                f32::from_le_bytes(arr)
            })
            .collect()
    }

    // === Knowledge bases ===

    pub fn create_knowledge_base(
        &self,
        tenant_id: &str,
        name: &str,
        description: Option<&str>,
    ) -> Result<KnowledgeBase> {
        if tenant_id.trim().is_empty() {
            return Err(KildeError::Validation("tenant_id must not be empty".into()));
        }
        let conn = self.lock()?;
        let id = Uuid::new_v4().to_string();
        let now = now_str();
        conn.execute(
            "INSERT INTO knowledge_bases (id, tenant_id, name, description, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![id, tenant_id, name, description, now],
        )?;
        debug!("Created knowledge base {} for tenant {}", id, tenant_id);
        Ok(KnowledgeBase {
            id,
            tenant_id: tenant_id.to_string(),
            name: name.to_string(),
            description: description.map(String::from),
            created_at: parse_ts(&now),
            updated_at: parse_ts(&now),
        })
    }

    pub fn get_knowledge_base(&self, id: &str) -> Result<Option<KnowledgeBase>> {
        let conn = self.lock()?;
        let kb = conn
            .query_row(
                "SELECT id, tenant_id, name, description, created_at, updated_at
                 FROM knowledge_bases WHERE id = ?1",
                params![id],
                kb_from_row,
            )
            .optional()?;
        Ok(kb)
    }

    pub fn list_knowledge_bases(&self, tenant_id: &str) -> Result<Vec<KnowledgeBase>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, tenant_id, name, description, created_at, updated_at
             FROM knowledge_bases WHERE tenant_id = ?1 ORDER BY created_at, id",
        )?;
        let rows = stmt.query_map(params![tenant_id], kb_from_row)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Delete a knowledge base; collections, documents, and chunks cascade.
    pub fn delete_knowledge_base(&self, id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let deleted = conn.execute("DELETE FROM knowledge_bases WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    // === Collections ===

    pub fn create_collection(
        &self,
        knowledge_base_id: &str,
        name: &str,
        description: Option<&str>,
    ) -> Result<Collection> {
        let conn = self.lock()?;
        let exists: bool = conn
            .query_row(
                "SELECT 1 FROM knowledge_bases WHERE id = ?1",
                params![knowledge_base_id],
                |_| Ok(true),
            )
            .optional()?
            .unwrap_or(false);
        if !exists {
            return Err(KildeError::NotFound(format!(
                "Knowledge base not found: {}",
                knowledge_base_id
            )));
        }

        let id = Uuid::new_v4().to_string();
        let now = now_str();
        conn.execute(
            "INSERT INTO collections (id, knowledge_base_id, name, description, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, knowledge_base_id, name, description, now],
        )?;
        Ok(Collection {
            id,
            knowledge_base_id: knowledge_base_id.to_string(),
            name: name.to_string(),
            description: description.map(String::from),
            created_at: parse_ts(&now),
        })
    }

    pub fn list_collections(&self, knowledge_base_id: &str) -> Result<Vec<Collection>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, knowledge_base_id, name, description, created_at
             FROM collections WHERE knowledge_base_id = ?1 ORDER BY created_at, id",
        )?;
        let rows = stmt.query_map(params![knowledge_base_id], collection_from_row)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// All collections a tenant may search — the scope resolution used by
    /// retrieval. This is the authorization boundary.
    pub fn collections_for_tenant(&self, tenant_id: &str) -> Result<Vec<Collection>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT c.id, c.knowledge_base_id, c.name, c.description, c.created_at
             FROM collections c
             JOIN knowledge_bases kb ON kb.id = c.knowledge_base_id
             WHERE kb.tenant_id = ?1
             ORDER BY c.created_at, c.id",
        )?;
        let rows = stmt.query_map(params![tenant_id], collection_from_row)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    // === Documents ===

    pub fn create_document(
        &self,
        collection_id: &str,
        name: &str,
        source_kind: SourceKind,
        origin: &str,
    ) -> Result<DocumentRecord> {
        let conn = self.lock()?;
        let exists: bool = conn
            .query_row(
                "SELECT 1 FROM collections WHERE id = ?1",
                params![collection_id],
                |_| Ok(true),
            )
            .optional()?
            .unwrap_or(false);
        if !exists {
            return Err(KildeError::NotFound(format!(
                "Collection not found: {}",
                collection_id
            )));
        }

        let id = Uuid::new_v4().to_string();
        let now = now_str();
        conn.execute(
            "INSERT INTO documents (id, collection_id, name, source_kind, origin, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![id, collection_id, name, source_kind.as_str(), origin, now],
        )?;
        debug!("Created document {} in collection {}", id, collection_id);
        Ok(DocumentRecord {
            id,
            collection_id: collection_id.to_string(),
            name: name.to_string(),
            source_kind,
            origin: origin.to_string(),
            checksum: None,
            status: DocumentStatus::Pending,
            error: None,
            created_at: parse_ts(&now),
            updated_at: parse_ts(&now),
        })
    }

    pub fn get_document(&self, id: &str) -> Result<Option<DocumentRecord>> {
        let conn = self.lock()?;
        let doc = conn
            .query_row(
                "SELECT id, collection_id, name, source_kind, origin, checksum, status, error,
                        created_at, updated_at
                 FROM documents WHERE id = ?1",
                params![id],
                document_from_row,
            )
            .optional()?;
        Ok(doc)
    }

    pub fn list_documents(&self, collection_id: &str) -> Result<Vec<DocumentRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, collection_id, name, source_kind, origin, checksum, status, error,
                    created_at, updated_at
             FROM documents WHERE collection_id = ?1 ORDER BY created_at, id",
        )?;
        let rows = stmt.query_map(params![collection_id], document_from_row)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn delete_document(&self, id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let deleted = conn.execute("DELETE FROM documents WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    pub fn document_versions(&self, document_id: &str) -> Result<Vec<DocumentVersion>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, document_id, version, checksum, chunk_count, created_at
             FROM document_versions WHERE document_id = ?1 ORDER BY version",
        )?;
        let rows = stmt.query_map(params![document_id], |row| {
            Ok(DocumentVersion {
                id: row.get(0)?,
                document_id: row.get(1)?,
                version: row.get(2)?,
                checksum: row.get(3)?,
                chunk_count: row.get(4)?,
                created_at: parse_ts(&row.get::<_, String>(5)?),
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    // === Chunks ===

    /// Replace a document's chunk set atomically and snapshot a new version.
    ///
    /// The swap happens inside one transaction so a concurrent reader sees
    /// either the complete old set or the complete new set. On commit the
    /// document is `ready` with the new checksum; an empty chunk slice is
    /// valid and leaves a ready document with zero chunks.
    #[instrument(skip(self, chunks), fields(count = chunks.len()))]
    pub fn replace_chunks(
        &self,
        document_id: &str,
        chunks: &[NewChunk],
        checksum: &str,
    ) -> Result<usize> {
        let conn = self.lock()?;
        let tx = conn.unchecked_transaction()?;
        let now = now_str();

        let next_version: i64 = tx.query_row(
            "SELECT COALESCE(MAX(version), 0) + 1 FROM document_versions WHERE document_id = ?1",
            params![document_id],
            |row| row.get(0),
        )?;

        tx.execute(
            "DELETE FROM document_chunks WHERE document_id = ?1",
            params![document_id],
        )?;

        for chunk in chunks {
            let embedding_bytes = chunk.embedding.as_ref().map(|e| Self::embedding_to_bytes(e));
            tx.execute(
                "INSERT INTO document_chunks
                 (id, document_id, ordinal, content, embedding, metadata_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    Uuid::new_v4().to_string(),
                    document_id,
                    chunk.ordinal,
                    chunk.content,
                    embedding_bytes,
                    chunk.metadata.to_string(),
                    now,
                ],
            )?;
        }

        tx.execute(
            "INSERT INTO document_versions (id, document_id, version, checksum, chunk_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                Uuid::new_v4().to_string(),
                document_id,
                next_version,
                checksum,
                chunks.len() as i64,
                now,
            ],
        )?;

        let updated = tx.execute(
            "UPDATE documents SET status = 'ready', checksum = ?1, error = NULL, updated_at = ?2
             WHERE id = ?3",
            params![checksum, now, document_id],
        )?;
        if updated == 0 {
            return Err(KildeError::NotFound(format!(
                "Document not found: {}",
                document_id
            )));
        }

        tx.commit()?;
        info!(
            "Replaced chunks for document {} (version {}, {} chunks)",
            document_id,
            next_version,
            chunks.len()
        );
        Ok(chunks.len())
    }

    pub fn document_chunks(&self, document_id: &str) -> Result<Vec<ChunkRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, document_id, ordinal, content, embedding, metadata_json, created_at
             FROM document_chunks WHERE document_id = ?1 ORDER BY ordinal",
        )?;
        let rows = stmt.query_map(params![document_id], |row| {
            let embedding_bytes: Option<Vec<u8>> = row.get(4)?;
            let metadata_str: String = row.get(5)?;
            Ok(ChunkRecord {
                id: row.get(0)?,
                document_id: row.get(1)?,
                ordinal: row.get(2)?,
                content: row.get(3)?,
                embedding: embedding_bytes.map(|b| Self::bytes_to_embedding(&b)),
                metadata: serde_json::from_str(&metadata_str)
                    .unwrap_or(serde_json::Value::Object(Default::default())),
                created_at: parse_ts(&row.get::<_, String>(6)?),
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn chunk_exists(&self, chunk_id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let exists: Option<bool> = conn
            .query_row(
                "SELECT 1 FROM document_chunks WHERE id = ?1",
                params![chunk_id],
                |_| Ok(true),
            )
            .optional()?;
        Ok(exists.unwrap_or(false))
    }

    // === Similarity search ===

    /// Nearest-neighbor search over embedded chunks.
    ///
    /// `scope` is the list of collection ids the caller may search; it is
    /// applied inside the SQL query, never as a post-filter, and an empty
    /// scope returns no results. Ranking is similarity descending; ties break
    /// by most recent usage, then ordinal, then chunk id, so identical inputs
    /// against unchanged data always return the same order.
    #[instrument(skip(self, query_vector, scope, filters), fields(scope_len = scope.len()))]
    pub fn search(
        &self,
        query_vector: &[f32],
        top_k: usize,
        scope: &[String],
        filters: &[ChunkFilter],
    ) -> Result<Vec<SearchHit>> {
        if scope.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }

        let clause = compile(scope, filters)?;
        let sql = format!(
            "SELECT c.id, c.document_id, d.name, d.collection_id, col.name,
                    c.ordinal, c.content, c.embedding,
                    (SELECT MAX(u.last_used_at) FROM usage_stats u WHERE u.chunk_id = c.id)
             FROM document_chunks c
             JOIN documents d ON d.id = c.document_id
             JOIN collections col ON col.id = d.collection_id
             WHERE {}",
            clause.sql
        );

        struct Candidate {
            hit: SearchHit,
            last_used_at: Option<String>,
        }

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(clause.params.iter()), |row| {
            let embedding_bytes: Vec<u8> = row.get(7)?;
            let embedding = Self::bytes_to_embedding(&embedding_bytes);
            Ok(Candidate {
                hit: SearchHit {
                    chunk_id: row.get(0)?,
                    document_id: row.get(1)?,
                    document_name: row.get(2)?,
                    collection_id: row.get(3)?,
                    collection_name: row.get(4)?,
                    ordinal: row.get(5)?,
                    content: row.get(6)?,
                    similarity: cosine_similarity(query_vector, &embedding),
                },
                last_used_at: row.get(8)?,
            })
        })?;

        let mut candidates: Vec<Candidate> = rows.filter_map(|r| r.ok()).collect();

        candidates.sort_by(|a, b| {
            b.hit
                .similarity
                .partial_cmp(&a.hit.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.last_used_at.cmp(&a.last_used_at))
                .then(a.hit.ordinal.cmp(&b.hit.ordinal))
                .then(a.hit.chunk_id.cmp(&b.hit.chunk_id))
        });
        candidates.truncate(top_k);

        debug!("Search returned {} candidates", candidates.len());
        Ok(candidates.into_iter().map(|c| c.hit).collect())
    }

    // === Processing jobs ===

    /// Create a pending ingestion job for a document.
    ///
    /// The partial unique index on active jobs rejects a second concurrent
    /// enqueue for the same document.
    pub fn enqueue_job(&self, document_id: &str, max_attempts: u32) -> Result<JobRecord> {
        let conn = self.lock()?;
        let exists: bool = conn
            .query_row(
                "SELECT 1 FROM documents WHERE id = ?1",
                params![document_id],
                |_| Ok(true),
            )
            .optional()?
            .unwrap_or(false);
        if !exists {
            return Err(KildeError::NotFound(format!(
                "Document not found: {}",
                document_id
            )));
        }

        let id = Uuid::new_v4().to_string();
        let now = now_str();
        let result = conn.execute(
            "INSERT INTO processing_jobs (id, document_id, max_attempts, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![id, document_id, max_attempts as i64, now],
        );

        match result {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                return Err(KildeError::Validation(format!(
                    "Document {} already has an active ingestion job",
                    document_id
                )));
            }
            Err(e) => return Err(e.into()),
        }

        debug!("Enqueued job {} for document {}", id, document_id);
        Ok(JobRecord {
            id,
            document_id: document_id.to_string(),
            state: JobState::Pending,
            attempts: 0,
            max_attempts: max_attempts as i64,
            error: None,
            cancel_requested: false,
            created_at: parse_ts(&now),
            started_at: None,
            finished_at: None,
        })
    }

    /// Claim the oldest pending job: pending → processing.
    ///
    /// The transition is a conditional write (`state = 'pending'` in the
    /// predicate), so two workers racing for the same row cannot both win.
    /// Records the document's prior status once, for restore on failure.
    pub fn claim_next_job(&self) -> Result<Option<JobRecord>> {
        let conn = self.lock()?;
        let candidate: Option<(String, String)> = conn
            .query_row(
                "SELECT id, document_id FROM processing_jobs
                 WHERE state = 'pending' ORDER BY created_at, id LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let (job_id, document_id) = match candidate {
            Some(c) => c,
            None => return Ok(None),
        };

        let now = now_str();
        let prior: String = conn.query_row(
            "SELECT status FROM documents WHERE id = ?1",
            params![document_id],
            |row| row.get(0),
        )?;

        let claimed = conn.execute(
            "UPDATE processing_jobs
             SET state = 'processing', started_at = ?1, attempts = attempts + 1,
                 prior_status = COALESCE(prior_status, ?2)
             WHERE id = ?3 AND state = 'pending'",
            params![now, prior, job_id],
        )?;
        if claimed == 0 {
            // Another worker won the race.
            return Ok(None);
        }

        conn.execute(
            "UPDATE documents SET status = 'processing', updated_at = ?1 WHERE id = ?2",
            params![now, document_id],
        )?;

        let job = conn.query_row(
            "SELECT id, document_id, state, attempts, max_attempts, error, cancel_requested,
                    created_at, started_at, finished_at
             FROM processing_jobs WHERE id = ?1",
            params![job_id],
            job_from_row,
        )?;
        debug!("Claimed job {} (attempt {})", job.id, job.attempts);
        Ok(Some(job))
    }

    pub fn get_job(&self, id: &str) -> Result<Option<JobRecord>> {
        let conn = self.lock()?;
        let job = conn
            .query_row(
                "SELECT id, document_id, state, attempts, max_attempts, error, cancel_requested,
                        created_at, started_at, finished_at
                 FROM processing_jobs WHERE id = ?1",
                params![id],
                job_from_row,
            )
            .optional()?;
        Ok(job)
    }

    pub fn list_jobs(&self, limit: usize) -> Result<Vec<JobRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, document_id, state, attempts, max_attempts, error, cancel_requested,
                    created_at, started_at, finished_at
             FROM processing_jobs ORDER BY created_at DESC, id LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], job_from_row)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    /// Mark a non-terminal job for cancellation. The worker checks the flag
    /// between pipeline stages.
    pub fn request_cancel(&self, job_id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE processing_jobs SET cancel_requested = 1
             WHERE id = ?1 AND state IN ('pending', 'processing')",
            params![job_id],
        )?;
        Ok(updated > 0)
    }

    pub fn cancel_requested(&self, job_id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let flagged: Option<bool> = conn
            .query_row(
                "SELECT cancel_requested FROM processing_jobs WHERE id = ?1",
                params![job_id],
                |row| row.get::<_, i64>(0).map(|v| v != 0),
            )
            .optional()?;
        flagged.ok_or_else(|| KildeError::NotFound(format!("Job not found: {}", job_id)))
    }

    /// Finish a job successfully. The document was already flipped to
    /// `ready` by `replace_chunks` in the same pipeline.
    pub fn complete_job(&self, job_id: &str) -> Result<()> {
        let conn = self.lock()?;
        let now = now_str();
        let updated = conn.execute(
            "UPDATE processing_jobs SET state = 'completed', finished_at = ?1
             WHERE id = ?2 AND state = 'processing'",
            params![now, job_id],
        )?;
        if updated == 0 {
            return Err(KildeError::Ingestion(format!(
                "Job {} is not in a completable state",
                job_id
            )));
        }
        Ok(())
    }

    /// Record a job failure.
    ///
    /// With `retry` the job re-enters `pending` (the active-job index keeps
    /// holding since the row never leaves a non-terminal state); otherwise it
    /// lands in `failed`. Either way the document's status reverts to its
    /// pre-claim value with the error attached, so a previously-ready chunk
    /// set stays authoritative.
    pub fn fail_job(&self, job_id: &str, error: &str, retry: bool) -> Result<JobRecord> {
        let conn = self.lock()?;
        let now = now_str();

        let (document_id, prior_status): (String, Option<String>) = conn.query_row(
            "SELECT document_id, prior_status FROM processing_jobs WHERE id = ?1",
            params![job_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        if retry {
            conn.execute(
                "UPDATE processing_jobs SET state = 'pending', error = ?1
                 WHERE id = ?2 AND state = 'processing'",
                params![error, job_id],
            )?;
        } else {
            conn.execute(
                "UPDATE processing_jobs SET state = 'failed', error = ?1, finished_at = ?2
                 WHERE id = ?3",
                params![error, now, job_id],
            )?;
        }

        // 'processing' was never a resting state; fall back to pending.
        let restored = match prior_status.as_deref() {
            Some("ready") => "ready",
            Some("failed") if !retry => "failed",
            _ if retry => "pending",
            _ => "failed",
        };
        conn.execute(
            "UPDATE documents SET status = ?1, error = ?2, updated_at = ?3 WHERE id = ?4",
            params![restored, error, now, document_id],
        )?;

        let job = conn.query_row(
            "SELECT id, document_id, state, attempts, max_attempts, error, cancel_requested,
                    created_at, started_at, finished_at
             FROM processing_jobs WHERE id = ?1",
            params![job_id],
            job_from_row,
        )?;
        Ok(job)
    }

    // === Usage tracking ===

    /// Record one use of a chunk in an enrichment.
    ///
    /// A single atomic upsert: insert with count 1, or increment and bump
    /// `last_used_at`. Safe under concurrent callers for the same key.
    /// Fails loud when the chunk id does not exist.
    pub fn track_usage(
        &self,
        chunk_id: &str,
        tenant_id: &str,
        agent_id: Option<&str>,
    ) -> Result<()> {
        let conn = self.lock()?;
        let exists: bool = conn
            .query_row(
                "SELECT 1 FROM document_chunks WHERE id = ?1",
                params![chunk_id],
                |_| Ok(true),
            )
            .optional()?
            .unwrap_or(false);
        if !exists {
            return Err(KildeError::NotFound(format!(
                "Chunk not found: {}",
                chunk_id
            )));
        }

        // SQLite treats NULLs as distinct in primary keys; "no agent" is the
        // empty string so the upsert key stays total.
        let agent_key = agent_id.unwrap_or("");
        let now = now_str();
        conn.execute(
            "INSERT INTO usage_stats (chunk_id, tenant_id, agent_id, usage_count, first_used_at, last_used_at)
             VALUES (?1, ?2, ?3, 1, ?4, ?4)
             ON CONFLICT(chunk_id, tenant_id, agent_id)
             DO UPDATE SET usage_count = usage_count + 1, last_used_at = excluded.last_used_at",
            params![chunk_id, tenant_id, agent_key, now],
        )?;
        Ok(())
    }

    pub fn usage_for(
        &self,
        chunk_id: &str,
        tenant_id: &str,
        agent_id: Option<&str>,
    ) -> Result<Option<UsageStat>> {
        let conn = self.lock()?;
        let agent_key = agent_id.unwrap_or("");
        let stat = conn
            .query_row(
                "SELECT chunk_id, tenant_id, agent_id, usage_count, first_used_at, last_used_at
                 FROM usage_stats WHERE chunk_id = ?1 AND tenant_id = ?2 AND agent_id = ?3",
                params![chunk_id, tenant_id, agent_key],
                |row| {
                    let agent: String = row.get(2)?;
                    Ok(UsageStat {
                        chunk_id: row.get(0)?,
                        tenant_id: row.get(1)?,
                        agent_id: (!agent.is_empty()).then_some(agent),
                        usage_count: row.get(3)?,
                        first_used_at: parse_ts(&row.get::<_, String>(4)?),
                        last_used_at: parse_ts(&row.get::<_, String>(5)?),
                    })
                },
            )
            .optional()?;
        Ok(stat)
    }

    // === Feedback ===

    /// Append an immutable feedback record. Feedback references chunks
    /// weakly: it stays valid (and retrievable) even after the chunk has
    /// been superseded by a re-ingestion.
    pub fn insert_feedback(
        &self,
        message_id: &str,
        chunk_id: &str,
        relevance_score: i64,
        comment: Option<&str>,
    ) -> Result<FeedbackRecord> {
        if !(1..=5).contains(&relevance_score) {
            return Err(KildeError::Validation(format!(
                "relevance_score must be between 1 and 5, got {}",
                relevance_score
            )));
        }

        let conn = self.lock()?;
        let id = Uuid::new_v4().to_string();
        let now = now_str();
        conn.execute(
            "INSERT INTO feedback (id, message_id, chunk_id, relevance_score, comment, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![id, message_id, chunk_id, relevance_score, comment, now],
        )?;
        Ok(FeedbackRecord {
            id,
            message_id: message_id.to_string(),
            chunk_id: chunk_id.to_string(),
            relevance_score,
            comment: comment.map(String::from),
            created_at: parse_ts(&now),
        })
    }

    pub fn feedback_for_chunk(&self, chunk_id: &str) -> Result<Vec<FeedbackRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, message_id, chunk_id, relevance_score, comment, created_at
             FROM feedback WHERE chunk_id = ?1 ORDER BY created_at, id",
        )?;
        let rows = stmt.query_map(params![chunk_id], |row| {
            Ok(FeedbackRecord {
                id: row.get(0)?,
                message_id: row.get(1)?,
                chunk_id: row.get(2)?,
                relevance_score: row.get(3)?,
                comment: row.get(4)?,
                created_at: parse_ts(&row.get::<_, String>(5)?),
            })
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }
}

fn now_str() -> String {
    Utc::now().to_rfc3339()
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn kb_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<KnowledgeBase> {
    Ok(KnowledgeBase {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        created_at: parse_ts(&row.get::<_, String>(4)?),
        updated_at: parse_ts(&row.get::<_, String>(5)?),
    })
}

fn collection_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Collection> {
    Ok(Collection {
        id: row.get(0)?,
        knowledge_base_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        created_at: parse_ts(&row.get::<_, String>(4)?),
    })
}

fn document_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DocumentRecord> {
    let kind: String = row.get(3)?;
    let status: String = row.get(6)?;
    Ok(DocumentRecord {
        id: row.get(0)?,
        collection_id: row.get(1)?,
        name: row.get(2)?,
        source_kind: kind.parse().unwrap_or(SourceKind::Text),
        origin: row.get(4)?,
        checksum: row.get(5)?,
        status: status.parse().unwrap_or(DocumentStatus::Pending),
        error: row.get(7)?,
        created_at: parse_ts(&row.get::<_, String>(8)?),
        updated_at: parse_ts(&row.get::<_, String>(9)?),
    })
}

fn job_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobRecord> {
    let state: String = row.get(2)?;
    let started: Option<String> = row.get(8)?;
    let finished: Option<String> = row.get(9)?;
    Ok(JobRecord {
        id: row.get(0)?,
        document_id: row.get(1)?,
        state: state.parse().unwrap_or(JobState::Pending),
        attempts: row.get(3)?,
        max_attempts: row.get(4)?,
        error: row.get(5)?,
        cancel_requested: row.get::<_, i64>(6)? != 0,
        created_at: parse_ts(&row.get::<_, String>(7)?),
        started_at: started.as_deref().map(parse_ts),
        finished_at: finished.as_deref().map(parse_ts),
    })
}
