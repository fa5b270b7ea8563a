//! Keyword store
//!
//! Full-text index over chunk content via SQLite FTS5, scored with the
//! built-in `bm25()` rank. Absolute scores are not contractual: only the
//! rank order feeds the fusion stage downstream. The read path degrades
//! to an empty result when the index is missing or the query cannot be
//! parsed; retrieval then proceeds vector-only.

use sqlx::SqlitePool;
use tracing::warn;

use crate::error::Result;
use crate::types::Chunk;

/// Full-text keyword index over chunk content
#[derive(Clone)]
pub struct KeywordStore {
    pool: SqlitePool,
}

impl KeywordStore {
    /// Create a store, initializing the schema if needed
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        super::init_schema(&pool).await?;
        Ok(Self { pool })
    }

    /// Index one chunk's content
    pub async fn index_chunk(&self, chunk: &Chunk) -> Result<()> {
        sqlx::query("INSERT INTO chunks_fts (chunk_id, session_slug, content) VALUES (?, ?, ?)")
            .bind(&chunk.id)
            .bind(&chunk.session_slug)
            .bind(&chunk.content)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Index a batch of chunks in one transaction
    pub async fn index_many(&self, chunks: &[Chunk]) -> Result<usize> {
        if chunks.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        for chunk in chunks {
            sqlx::query("INSERT INTO chunks_fts (chunk_id, session_slug, content) VALUES (?, ?, ?)")
                .bind(&chunk.id)
                .bind(&chunk.session_slug)
                .bind(&chunk.content)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(chunks.len())
    }

    /// Remove a chunk from the index
    pub async fn remove(&self, chunk_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM chunks_fts WHERE chunk_id = ?")
            .bind(chunk_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Rank-ordered keyword matches as `(chunk_id, score)`, best first.
    /// Higher scores are better; failures return an empty list.
    pub async fn search(&self, query: &str, limit: usize) -> Vec<(String, f32)> {
        self.search_inner(query, None, limit).await
    }

    /// Keyword matches restricted to the given project slugs
    pub async fn search_by_project(
        &self,
        query: &str,
        projects: &[String],
        limit: usize,
    ) -> Vec<(String, f32)> {
        self.search_inner(query, Some(projects), limit).await
    }

    async fn search_inner(
        &self,
        query: &str,
        projects: Option<&[String]>,
        limit: usize,
    ) -> Vec<(String, f32)> {
        let Some(match_expr) = build_match_expression(query) else {
            return Vec::new();
        };

        let sql = match projects {
            Some(projects) if !projects.is_empty() => {
                let placeholders = vec!["?"; projects.len()].join(", ");
                format!(
                    "SELECT chunk_id, bm25(chunks_fts) FROM chunks_fts
                     WHERE chunks_fts MATCH ? AND session_slug IN ({placeholders})
                     ORDER BY bm25(chunks_fts) LIMIT ?"
                )
            }
            _ => "SELECT chunk_id, bm25(chunks_fts) FROM chunks_fts
                  WHERE chunks_fts MATCH ? ORDER BY bm25(chunks_fts) LIMIT ?"
                .to_string(),
        };

        let mut q = sqlx::query_as::<_, (String, f64)>(&sql).bind(&match_expr);
        if let Some(projects) = projects {
            for p in projects {
                q = q.bind(p);
            }
        }
        let result = q.bind(limit as i64).fetch_all(&self.pool).await;

        match result {
            // bm25() ranks best matches most negative; flip so callers
            // sort descending like every other score in the pipeline.
            Ok(rows) => rows
                .into_iter()
                .map(|(id, rank)| (id, -rank as f32))
                .collect(),
            Err(e) => {
                warn!("keyword search degraded to empty: {}", e);
                Vec::new()
            }
        }
    }
}

/// Turn free text into an FTS5 OR-query over its alphanumeric tokens.
/// Returns `None` when no token survives.
fn build_match_expression(query: &str) -> Option<String> {
    let tokens: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{t}\""))
        .collect();
    if tokens.is_empty() {
        return None;
    }
    Some(tokens.join(" OR "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::chunks::test_chunk;
    use crate::db::memory_pool;

    async fn seeded_store() -> KeywordStore {
        let pool = memory_pool().await.unwrap();
        let store = KeywordStore::new(pool).await.unwrap();
        store
            .index_many(&[
                test_chunk("c1", "s1", "fixed the oauth token refresh bug in the auth service"),
                test_chunk("c2", "s1", "refactored the database connection pool"),
                test_chunk("c3", "s2", "auth middleware now validates the session token"),
            ])
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_search_ranks_matches() {
        let store = seeded_store().await;
        let hits = store.search("auth token", 10).await;
        assert_eq!(hits.len(), 2);
        let ids: Vec<&str> = hits.iter().map(|(id, _)| id.as_str()).collect();
        assert!(ids.contains(&"c1"));
        assert!(ids.contains(&"c3"));
        // Scores are rank-ordered, best first.
        assert!(hits[0].1 >= hits[1].1);
    }

    #[tokio::test]
    async fn test_search_by_project() {
        let store = seeded_store().await;
        let hits = store
            .search_by_project("auth", &["s2-proj".to_string()], 10)
            .await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, "c3");
    }

    #[tokio::test]
    async fn test_degenerate_queries_return_empty() {
        let store = seeded_store().await;
        assert!(store.search("", 10).await.is_empty());
        assert!(store.search("!!! ???", 10).await.is_empty());
        // Quotes and operators in user text must not break the query.
        let hits = store.search("\"auth\" OR (token", 10).await;
        assert_eq!(hits.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_index_degrades_gracefully() {
        let pool = memory_pool().await.unwrap();
        let store = KeywordStore::new(pool.clone()).await.unwrap();
        sqlx::query("DROP TABLE chunks_fts").execute(&pool).await.unwrap();
        assert!(store.search("anything", 10).await.is_empty());
    }

    #[tokio::test]
    async fn test_remove() {
        let store = seeded_store().await;
        store.remove("c1").await.unwrap();
        let hits = store.search("oauth", 10).await;
        assert!(hits.is_empty());
    }
}
