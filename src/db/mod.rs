//! Database module
//!
//! SQLite-backed stores for the entity tables: chunks, edges, clusters,
//! cluster membership, vector clocks, and the keyword full-text index.
//! One writer, many readers; WAL journal mode; every store initializes
//! the shared schema idempotently so tests can construct them alone.

pub mod chunks;
pub mod clocks;
pub mod clusters;
pub mod edges;
pub mod keywords;

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use tracing::info;

use crate::config::StorageConfig;
use crate::error::Result;

pub use chunks::ChunkStore;
pub use clocks::ClockStore;
pub use clusters::ClusterStore;
pub use edges::{EdgeStore, WeightedEdge};
pub use keywords::KeywordStore;

/// Current on-disk schema version
pub const SCHEMA_VERSION: i64 = 1;

// ============================================================================
// Pool creation
// ============================================================================

/// Open (or create) the memory database and initialize the schema.
pub async fn init_pool(storage: &StorageConfig) -> Result<SqlitePool> {
    std::fs::create_dir_all(&storage.data_dir)?;
    let db_path = storage.db_path();
    let db_url = format!("sqlite:{}?mode=rwc", db_path.display());
    info!("opening memory database: {}", db_path.display());

    let options = SqliteConnectOptions::from_str(&db_url)?
        .create_if_missing(true)
        .synchronous(SqliteSynchronous::Normal)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(std::time::Duration::from_secs(30));

    let pool = SqlitePoolOptions::new()
        .max_connections(storage.max_connections)
        .connect_with(options)
        .await?;

    init_schema(&pool).await?;
    Ok(pool)
}

/// In-memory pool for tests and throwaway engines. A single connection
/// is mandatory: every pooled connection would otherwise get its own
/// private `:memory:` database.
pub async fn memory_pool() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await?;
    init_schema(&pool).await?;
    Ok(pool)
}

/// Create every table the engine uses. Idempotent; each store calls this
/// from its constructor so partial setups (unit tests) still work.
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    let existing: Option<(i64,)> = sqlx::query_as("SELECT version FROM schema_version LIMIT 1")
        .fetch_optional(pool)
        .await?;
    if existing.is_none() {
        sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
            .bind(SCHEMA_VERSION)
            .execute(pool)
            .await?;
    }

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            session_slug TEXT NOT NULL,
            agent_id TEXT,
            turn_indices TEXT NOT NULL,
            start_time TEXT NOT NULL,
            end_time TEXT NOT NULL,
            content TEXT NOT NULL,
            approx_tokens INTEGER,
            code_block_count INTEGER NOT NULL DEFAULT 0,
            tool_use_count INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            last_accessed TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_session ON chunks(session_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_slug ON chunks(session_slug)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS edges (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source_chunk_id TEXT NOT NULL,
            target_chunk_id TEXT NOT NULL,
            edge_type TEXT NOT NULL,
            reference_type TEXT,
            initial_weight REAL NOT NULL,
            created_at TEXT NOT NULL,
            vector_clock TEXT,
            link_count INTEGER NOT NULL DEFAULT 1
        )
        "#,
    )
    .execute(pool)
    .await?;

    // NULL reference types must still collide, so the uniqueness index
    // coalesces them to the empty string.
    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_edges_tuple
        ON edges(source_chunk_id, target_chunk_id, edge_type, COALESCE(reference_type, ''))
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_edges_source ON edges(source_chunk_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_edges_target ON edges(target_chunk_id)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS clusters (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT,
            description TEXT,
            centroid BLOB NOT NULL,
            exemplar_ids TEXT NOT NULL,
            membership_hash TEXT NOT NULL,
            refreshed_at TEXT,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cluster_members (
            chunk_id TEXT NOT NULL,
            cluster_id INTEGER NOT NULL,
            distance REAL NOT NULL,
            PRIMARY KEY (chunk_id, cluster_id),
            FOREIGN KEY (cluster_id) REFERENCES clusters(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_members_cluster ON cluster_members(cluster_id)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS vector_clocks (
            session_slug TEXT NOT NULL,
            agent_id TEXT NOT NULL,
            counter INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (session_slug, agent_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(
            chunk_id UNINDEXED,
            session_slug UNINDEXED,
            content
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

// ============================================================================
// Blob helpers
// ============================================================================

/// Encode an f32 vector as little-endian bytes
pub(crate) fn vec_to_blob(values: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(values.len() * 4);
    for v in values {
        blob.extend_from_slice(&v.to_le_bytes());
    }
    blob
}

/// Decode a little-endian f32 blob; trailing partial floats are dropped.
pub(crate) fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

// ============================================================================
// Health and statistics
// ============================================================================

/// Database health snapshot
#[derive(Debug, Clone, serde::Serialize)]
pub struct DatabaseHealth {
    pub connected: bool,
    pub latency_ms: u64,
}

/// Verify the database answers a trivial query.
pub async fn health_check(pool: &SqlitePool) -> Result<DatabaseHealth> {
    let start = std::time::Instant::now();
    let row: (i32,) = sqlx::query_as("SELECT 1").fetch_one(pool).await?;
    Ok(DatabaseHealth {
        connected: row.0 == 1,
        latency_ms: start.elapsed().as_millis() as u64,
    })
}

/// Row counts across the entity tables
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct MemoryStats {
    pub chunk_count: i64,
    pub edge_count: i64,
    pub cluster_count: i64,
    pub assignment_count: i64,
}

/// Gather table counts for the daemon's startup log.
pub async fn memory_stats(pool: &SqlitePool) -> Result<MemoryStats> {
    let row: (i64, i64, i64, i64) = sqlx::query_as(
        r#"
        SELECT
            (SELECT COUNT(*) FROM chunks),
            (SELECT COUNT(*) FROM edges),
            (SELECT COUNT(*) FROM clusters),
            (SELECT COUNT(*) FROM cluster_members)
        "#,
    )
    .fetch_one(pool)
    .await?;
    Ok(MemoryStats {
        chunk_count: row.0,
        edge_count: row.1,
        cluster_count: row.2,
        assignment_count: row.3,
    })
}

/// Reclaim free pages in the relational store.
pub async fn compact(pool: &SqlitePool) -> Result<()> {
    sqlx::query("VACUUM").execute(pool).await?;
    Ok(())
}
