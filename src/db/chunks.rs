//! Chunk store
//!
//! CRUD over the `chunks` table. Chunks are immutable after ingest apart
//! from `last_accessed`, which retrieval bumps in a deferred batch to
//! keep write amplification off the hot path. Deleting a chunk cascades
//! to its edges, cluster assignments, and keyword rows in one
//! transaction; the caller evicts the vector row afterwards.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::{EngramError, Result};
use crate::types::Chunk;

type ChunkRow = (
    String,                 // id
    String,                 // session_id
    String,                 // session_slug
    Option<String>,         // agent_id
    String,                 // turn_indices (JSON)
    DateTime<Utc>,          // start_time
    DateTime<Utc>,          // end_time
    String,                 // content
    Option<i64>,            // approx_tokens
    i64,                    // code_block_count
    i64,                    // tool_use_count
    DateTime<Utc>,          // created_at
    DateTime<Utc>,          // last_accessed
);

const CHUNK_COLUMNS: &str = "id, session_id, session_slug, agent_id, turn_indices, start_time, \
     end_time, content, approx_tokens, code_block_count, tool_use_count, created_at, last_accessed";

fn row_to_chunk(row: ChunkRow) -> Result<Chunk> {
    let turn_indices: Vec<u32> = serde_json::from_str(&row.4)?;
    Ok(Chunk {
        id: row.0,
        session_id: row.1,
        session_slug: row.2,
        agent_id: row.3,
        turn_indices,
        start_time: row.5,
        end_time: row.6,
        content: row.7,
        approx_tokens: row.8.map(|t| t as u32),
        code_block_count: row.9 as u32,
        tool_use_count: row.10 as u32,
        created_at: row.11,
        last_accessed: row.12,
    })
}

/// Persistent store for transcript chunks
#[derive(Clone)]
pub struct ChunkStore {
    pool: SqlitePool,
}

impl ChunkStore {
    /// Create a store, initializing the schema if needed
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        super::init_schema(&pool).await?;
        Ok(Self { pool })
    }

    /// Insert one chunk.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` when the chunk violates its structural
    /// invariants (empty turn set, reversed time range).
    pub async fn insert(&self, chunk: &Chunk) -> Result<()> {
        let problems = chunk.validate();
        if !problems.is_empty() {
            return Err(EngramError::invalid(problems.join("; ")));
        }
        let mut tx = self.pool.begin().await?;
        insert_in_tx(&mut tx, chunk).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Insert a batch of chunks in a single transaction.
    pub async fn bulk_insert(&self, chunks: &[Chunk]) -> Result<usize> {
        if chunks.is_empty() {
            return Ok(0);
        }
        for chunk in chunks {
            let problems = chunk.validate();
            if !problems.is_empty() {
                return Err(EngramError::invalid(format!(
                    "chunk {}: {}",
                    chunk.id,
                    problems.join("; ")
                )));
            }
        }
        let mut tx = self.pool.begin().await?;
        for chunk in chunks {
            insert_in_tx(&mut tx, chunk).await?;
        }
        tx.commit().await?;
        debug!("inserted {} chunks", chunks.len());
        Ok(chunks.len())
    }

    /// Fetch one chunk. Missing ids are `None`, not an error.
    pub async fn get(&self, id: &str) -> Result<Option<Chunk>> {
        let row: Option<ChunkRow> =
            sqlx::query_as(&format!("SELECT {CHUNK_COLUMNS} FROM chunks WHERE id = ?"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(row_to_chunk).transpose()
    }

    /// Fetch several chunks; missing ids are skipped.
    pub async fn get_many(&self, ids: &[String]) -> Result<Vec<Chunk>> {
        let mut chunks = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(chunk) = self.get(id).await? {
                chunks.push(chunk);
            }
        }
        Ok(chunks)
    }

    /// All chunks of a session, in turn order
    pub async fn by_session(&self, session_id: &str) -> Result<Vec<Chunk>> {
        let rows: Vec<ChunkRow> = sqlx::query_as(&format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks WHERE session_id = ? ORDER BY start_time, id"
        ))
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_chunk).collect()
    }

    pub async fn count(&self) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    /// Delete a chunk and everything that references it: incident edges,
    /// cluster assignments, and the keyword row, in one transaction.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the chunk does not exist (delete is a
    /// write path).
    pub async fn delete(&self, id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let deleted = sqlx::query("DELETE FROM chunks WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if deleted.rows_affected() == 0 {
            return Err(EngramError::not_found("chunk", id));
        }
        sqlx::query("DELETE FROM edges WHERE source_chunk_id = ? OR target_chunk_id = ?")
            .bind(id)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM cluster_members WHERE chunk_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chunks_fts WHERE chunk_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        debug!("deleted chunk {} with cascade", id);
        Ok(())
    }

    /// Best-effort batch bump of `last_accessed` for retrieval hits.
    pub async fn bump_last_accessed(&self, ids: &[String], at: DateTime<Utc>) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for id in ids {
            sqlx::query("UPDATE chunks SET last_accessed = ? WHERE id = ?")
                .bind(at)
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Chunk id -> project slug map, rebuilt for project-filtered vector
    /// search.
    pub async fn project_index(&self) -> Result<HashMap<String, String>> {
        let rows: Vec<(String, String)> = sqlx::query_as("SELECT id, session_slug FROM chunks")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().collect())
    }

    /// Chunks with no incident edges at all
    pub async fn orphaned(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT id FROM chunks
            WHERE id NOT IN (SELECT source_chunk_id FROM edges)
              AND id NOT IN (SELECT target_chunk_id FROM edges)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Orphaned chunks not accessed since `cutoff` (the TTL-eviction set)
    pub async fn orphaned_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT id FROM chunks
            WHERE last_accessed < ?
              AND id NOT IN (SELECT source_chunk_id FROM edges)
              AND id NOT IN (SELECT target_chunk_id FROM edges)
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn insert_in_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    chunk: &Chunk,
) -> Result<()> {
    let turn_indices = serde_json::to_string(&chunk.turn_indices)?;
    sqlx::query(
        r#"
        INSERT INTO chunks (
            id, session_id, session_slug, agent_id, turn_indices,
            start_time, end_time, content, approx_tokens,
            code_block_count, tool_use_count, created_at, last_accessed
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&chunk.id)
    .bind(&chunk.session_id)
    .bind(&chunk.session_slug)
    .bind(&chunk.agent_id)
    .bind(turn_indices)
    .bind(chunk.start_time)
    .bind(chunk.end_time)
    .bind(&chunk.content)
    .bind(chunk.approx_tokens.map(|t| t as i64))
    .bind(chunk.code_block_count as i64)
    .bind(chunk.tool_use_count as i64)
    .bind(chunk.created_at)
    .bind(chunk.last_accessed)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[cfg(test)]
pub(crate) fn test_chunk(id: &str, session: &str, content: &str) -> Chunk {
    let now = Utc::now();
    Chunk {
        id: id.to_string(),
        session_id: session.to_string(),
        session_slug: format!("{session}-proj"),
        agent_id: None,
        turn_indices: vec![0],
        start_time: now,
        end_time: now,
        content: content.to_string(),
        approx_tokens: Some(content.split_whitespace().count() as u32),
        code_block_count: 0,
        tool_use_count: 0,
        created_at: now,
        last_accessed: now,
    }
}
