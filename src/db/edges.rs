//! Edge store
//!
//! Directed, typed, weighted references between chunks. Writes go through
//! `create_or_boost`: re-observing a `(source, target, type, reference)`
//! tuple bumps `link_count`, merges vector clocks, and adds a diminishing
//! weight boost instead of inserting a second row. Reads decay weights at
//! query time; an edge whose effective weight hits zero is reported on
//! the dead-edge channel for the pruner and withheld from results, but
//! never deleted synchronously.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use crate::clock::{effective_weight, DecayConfig, VectorClock};
use crate::error::{EngramError, Result};
use crate::types::{Edge, EdgeType, ReferenceType};

/// Fraction of the new weight added on each repeated observation
const BOOST_FACTOR: f32 = 0.1;

type EdgeRow = (
    i64,            // id
    String,         // source_chunk_id
    String,         // target_chunk_id
    String,         // edge_type
    Option<String>, // reference_type
    f64,            // initial_weight
    DateTime<Utc>,  // created_at
    Option<String>, // vector_clock (JSON)
    i64,            // link_count
);

const EDGE_COLUMNS: &str = "id, source_chunk_id, target_chunk_id, edge_type, reference_type, \
     initial_weight, created_at, vector_clock, link_count";

fn row_to_edge(row: EdgeRow) -> Result<Edge> {
    let edge_type = EdgeType::parse(&row.3)
        .ok_or_else(|| EngramError::StateCorruption(format!("unknown edge type '{}'", row.3)))?;
    let reference_type = match row.4.as_deref() {
        None | Some("") => None,
        Some(s) => Some(ReferenceType::parse(s).ok_or_else(|| {
            EngramError::StateCorruption(format!("unknown reference type '{s}'"))
        })?),
    };
    let vector_clock = row.7.as_deref().map(serde_json::from_str).transpose()?;
    Ok(Edge {
        id: row.0,
        source_chunk_id: row.1,
        target_chunk_id: row.2,
        edge_type,
        reference_type,
        initial_weight: row.5 as f32,
        created_at: row.6,
        vector_clock,
        link_count: row.8 as u32,
    })
}

/// An edge with its query-time effective weight
#[derive(Debug, Clone)]
pub struct WeightedEdge {
    pub edge: Edge,
    pub effective_weight: f32,
}

/// Persistent store for reference edges
#[derive(Clone)]
pub struct EdgeStore {
    pool: SqlitePool,
    /// Dead edges observed at query time go here; the pruner owns the
    /// receiving end.
    dead_tx: UnboundedSender<i64>,
}

impl EdgeStore {
    /// Create a store, initializing the schema if needed. The sender is
    /// the pruner's intake channel.
    pub async fn new(pool: SqlitePool, dead_tx: UnboundedSender<i64>) -> Result<Self> {
        super::init_schema(&pool).await?;
        Ok(Self { pool, dead_tx })
    }

    /// Insert a new edge row. Fails on a duplicate tuple; use
    /// `create_or_boost` on the ingest path.
    pub async fn create(&self, edge: &Edge) -> Result<Edge> {
        validate_edge(edge)?;
        let clock_json = edge
            .vector_clock
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let result = sqlx::query(
            r#"
            INSERT INTO edges (
                source_chunk_id, target_chunk_id, edge_type, reference_type,
                initial_weight, created_at, vector_clock, link_count
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&edge.source_chunk_id)
        .bind(&edge.target_chunk_id)
        .bind(edge.edge_type.as_str())
        .bind(edge.reference_type.map(|r| r.as_str()))
        .bind(edge.initial_weight as f64)
        .bind(edge.created_at)
        .bind(clock_json)
        .bind(edge.link_count as i64)
        .execute(&self.pool)
        .await?;

        let mut stored = edge.clone();
        stored.id = result.last_insert_rowid();
        Ok(stored)
    }

    /// Insert the edge, or boost the existing row with the same
    /// `(source, target, type, reference)` tuple: `link_count += 1`,
    /// clocks merged, `initial_weight += 0.1 * new_weight`. Atomic; two
    /// concurrent boosts serialize through the transaction.
    pub async fn create_or_boost(&self, edge: &Edge) -> Result<Edge> {
        validate_edge(edge)?;
        let mut tx = self.pool.begin().await?;

        let reference = edge.reference_type.map(|r| r.as_str()).unwrap_or("");
        let existing: Option<EdgeRow> = sqlx::query_as(&format!(
            "SELECT {EDGE_COLUMNS} FROM edges
             WHERE source_chunk_id = ? AND target_chunk_id = ?
               AND edge_type = ? AND COALESCE(reference_type, '') = ?"
        ))
        .bind(&edge.source_chunk_id)
        .bind(&edge.target_chunk_id)
        .bind(edge.edge_type.as_str())
        .bind(reference)
        .fetch_optional(&mut *tx)
        .await?;

        let stored = match existing {
            Some(row) => {
                let mut current = row_to_edge(row)?;
                current.link_count += 1;
                current.initial_weight += BOOST_FACTOR * edge.initial_weight;
                current.vector_clock = match (&current.vector_clock, &edge.vector_clock) {
                    (Some(old), Some(new)) => Some(old.merge(new)),
                    (Some(old), None) => Some(old.clone()),
                    (None, new) => new.clone(),
                };
                let clock_json = current
                    .vector_clock
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?;
                sqlx::query(
                    "UPDATE edges SET link_count = ?, initial_weight = ?, vector_clock = ?
                     WHERE id = ?",
                )
                .bind(current.link_count as i64)
                .bind(current.initial_weight as f64)
                .bind(clock_json)
                .bind(current.id)
                .execute(&mut *tx)
                .await?;
                debug!(
                    "boosted edge {} ({} -> {}), link_count={}",
                    current.id, current.source_chunk_id, current.target_chunk_id, current.link_count
                );
                current
            }
            None => {
                let clock_json = edge
                    .vector_clock
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?;
                let result = sqlx::query(
                    r#"
                    INSERT INTO edges (
                        source_chunk_id, target_chunk_id, edge_type, reference_type,
                        initial_weight, created_at, vector_clock, link_count
                    )
                    VALUES (?, ?, ?, ?, ?, ?, ?, 1)
                    "#,
                )
                .bind(&edge.source_chunk_id)
                .bind(&edge.target_chunk_id)
                .bind(edge.edge_type.as_str())
                .bind(edge.reference_type.map(|r| r.as_str()))
                .bind(edge.initial_weight as f64)
                .bind(edge.created_at)
                .bind(clock_json)
                .execute(&mut *tx)
                .await?;
                let mut stored = edge.clone();
                stored.id = result.last_insert_rowid();
                stored.link_count = 1;
                stored
            }
        };

        tx.commit().await?;
        Ok(stored)
    }

    /// Raw outgoing edges, optionally filtered by type
    pub async fn outgoing(&self, chunk_id: &str, edge_type: Option<EdgeType>) -> Result<Vec<Edge>> {
        let rows: Vec<EdgeRow> = match edge_type {
            Some(t) => {
                sqlx::query_as(&format!(
                    "SELECT {EDGE_COLUMNS} FROM edges WHERE source_chunk_id = ? AND edge_type = ?"
                ))
                .bind(chunk_id)
                .bind(t.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(&format!(
                    "SELECT {EDGE_COLUMNS} FROM edges WHERE source_chunk_id = ?"
                ))
                .bind(chunk_id)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.into_iter().map(row_to_edge).collect()
    }

    /// Raw incoming edges
    pub async fn incoming(&self, chunk_id: &str) -> Result<Vec<Edge>> {
        let rows: Vec<EdgeRow> = sqlx::query_as(&format!(
            "SELECT {EDGE_COLUMNS} FROM edges WHERE target_chunk_id = ?"
        ))
        .bind(chunk_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_edge).collect()
    }

    /// Outgoing edges of the given types with positive effective weight
    /// under the decay model. Dead edges are enqueued for the pruner and
    /// withheld; the rows are untouched.
    pub async fn weighted_outgoing(
        &self,
        chunk_id: &str,
        query_time: DateTime<Utc>,
        decay: &DecayConfig,
        edge_types: &[EdgeType],
        reference: Option<&VectorClock>,
    ) -> Result<Vec<WeightedEdge>> {
        let all = self.outgoing(chunk_id, None).await?;
        let mut alive = Vec::new();
        for edge in all {
            if !edge_types.is_empty() && !edge_types.contains(&edge.edge_type) {
                continue;
            }
            let weight = effective_weight(&edge, query_time, decay, reference);
            if weight > 0.0 {
                alive.push(WeightedEdge {
                    edge,
                    effective_weight: weight,
                });
            } else {
                // Lazily reaped; the pruner may already be gone in tests.
                let _ = self.dead_tx.send(edge.id);
            }
        }
        Ok(alive)
    }

    /// Delete one edge by id.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the row does not exist.
    pub async fn delete(&self, id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM edges WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(EngramError::not_found("edge", id.to_string()));
        }
        Ok(())
    }

    /// Delete a batch of edges in one transaction; missing ids are
    /// tolerated (a retrieval may report an edge twice). Returns the
    /// number actually removed.
    pub async fn delete_many(&self, ids: &[i64]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let mut removed = 0;
        for id in ids {
            let result = sqlx::query("DELETE FROM edges WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            removed += result.rows_affected();
        }
        tx.commit().await?;
        Ok(removed)
    }

    /// Delete every edge incident to a chunk
    pub async fn delete_for_chunk(&self, chunk_id: &str) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM edges WHERE source_chunk_id = ? OR target_chunk_id = ?")
                .bind(chunk_id)
                .bind(chunk_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    pub async fn count(&self) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM edges")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn validate_edge(edge: &Edge) -> Result<()> {
    if edge.source_chunk_id == edge.target_chunk_id {
        return Err(EngramError::invalid("edge source and target must differ"));
    }
    if edge.initial_weight <= 0.0 {
        return Err(EngramError::invalid("edge initial_weight must be positive"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{DecayCurveKind, DecaySpec};
    use crate::db::memory_pool;
    use tokio::sync::mpsc;

    async fn store_with_channel() -> (EdgeStore, mpsc::UnboundedReceiver<i64>) {
        let pool = memory_pool().await.unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        (EdgeStore::new(pool, tx).await.unwrap(), rx)
    }

    #[tokio::test]
    async fn test_create_and_read_back() {
        let (store, _rx) = store_with_channel().await;
        let edge = Edge::new("a", "b", EdgeType::Forward, Some(ReferenceType::FilePath), 1.0);
        let stored = store.create(&edge).await.unwrap();
        assert!(stored.id > 0);

        let outgoing = store.outgoing("a", None).await.unwrap();
        assert_eq!(outgoing.len(), 1);
        assert_eq!(outgoing[0].edge_type, EdgeType::Forward);
        assert_eq!(outgoing[0].reference_type, Some(ReferenceType::FilePath));

        let incoming = store.incoming("b").await.unwrap();
        assert_eq!(incoming.len(), 1);
    }

    #[tokio::test]
    async fn test_self_edge_rejected() {
        let (store, _rx) = store_with_channel().await;
        let edge = Edge::new("a", "a", EdgeType::Forward, None, 1.0);
        assert!(store.create(&edge).await.is_err());
    }

    #[tokio::test]
    async fn test_create_or_boost_single_row() {
        let (store, _rx) = store_with_channel().await;
        let edge = Edge::new("a", "b", EdgeType::Forward, Some(ReferenceType::FilePath), 1.0);

        store.create_or_boost(&edge).await.unwrap();
        let boosted = store.create_or_boost(&edge).await.unwrap();

        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(boosted.link_count, 2);
        assert!((boosted.initial_weight - 1.1).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_boost_merges_clocks() {
        let (store, _rx) = store_with_channel().await;
        let mut first = Edge::new("a", "b", EdgeType::Backward, None, 1.0);
        let mut clock_a = VectorClock::new();
        clock_a.tick("alice");
        first.vector_clock = Some(clock_a);

        let mut second = first.clone();
        let mut clock_b = VectorClock::new();
        clock_b.tick("bob");
        clock_b.tick("bob");
        second.vector_clock = Some(clock_b);

        store.create_or_boost(&first).await.unwrap();
        let merged = store.create_or_boost(&second).await.unwrap();
        let clock = merged.vector_clock.unwrap();
        assert_eq!(clock.get("alice"), 1);
        assert_eq!(clock.get("bob"), 2);
    }

    #[tokio::test]
    async fn test_distinct_tuples_stay_separate() {
        let (store, _rx) = store_with_channel().await;
        let base = Edge::new("a", "b", EdgeType::Forward, Some(ReferenceType::FilePath), 1.0);
        let other_ref = Edge::new("a", "b", EdgeType::Forward, Some(ReferenceType::CodeEntity), 1.0);
        let no_ref = Edge::new("a", "b", EdgeType::Forward, None, 1.0);

        store.create_or_boost(&base).await.unwrap();
        store.create_or_boost(&other_ref).await.unwrap();
        store.create_or_boost(&no_ref).await.unwrap();
        // Null references still collide with themselves only.
        store.create_or_boost(&no_ref).await.unwrap();

        assert_eq!(store.count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_weighted_outgoing_filters_and_reaps() {
        let (store, mut rx) = store_with_channel().await;
        let decay = DecayConfig {
            backward: DecaySpec {
                kind: DecayCurveKind::Linear,
                dies_at_hops: 10.0,
                hold_hops: 0.0,
            },
            forward: DecaySpec {
                kind: DecayCurveKind::Linear,
                dies_at_hops: 10.0,
                hold_hops: 0.0,
            },
            ms_per_hop: 3_600_000.0,
        };

        let mut fresh = Edge::new("a", "b", EdgeType::Backward, None, 1.0);
        fresh.created_at = Utc::now();
        let mut stale = Edge::new("a", "c", EdgeType::Backward, None, 1.0);
        stale.created_at = Utc::now() - chrono::Duration::hours(100);
        let mut wrong_type = Edge::new("a", "d", EdgeType::Forward, None, 1.0);
        wrong_type.created_at = Utc::now();

        store.create(&fresh).await.unwrap();
        let stale_stored = store.create(&stale).await.unwrap();
        store.create(&wrong_type).await.unwrap();

        let alive = store
            .weighted_outgoing("a", Utc::now(), &decay, EdgeType::backward_set(), None)
            .await
            .unwrap();
        assert_eq!(alive.len(), 1);
        assert_eq!(alive[0].edge.target_chunk_id, "b");
        assert!(alive[0].effective_weight > 0.9);

        // The dead edge landed on the pruner channel.
        assert_eq!(rx.try_recv().unwrap(), stale_stored.id);

        // The row itself is still there (lazy reaping).
        assert_eq!(store.count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_delete_paths() {
        let (store, _rx) = store_with_channel().await;
        let stored = store
            .create(&Edge::new("a", "b", EdgeType::Forward, None, 1.0))
            .await
            .unwrap();

        store.delete(stored.id).await.unwrap();
        assert!(store.delete(stored.id).await.is_err());

        store.create(&Edge::new("a", "b", EdgeType::Backward, None, 1.0)).await.unwrap();
        store.create(&Edge::new("c", "a", EdgeType::Backward, None, 1.0)).await.unwrap();
        assert_eq!(store.delete_for_chunk("a").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_delete_many_tolerates_missing() {
        let (store, _rx) = store_with_channel().await;
        let stored = store
            .create(&Edge::new("a", "b", EdgeType::Forward, None, 1.0))
            .await
            .unwrap();
        let removed = store.delete_many(&[stored.id, 9999]).await.unwrap();
        assert_eq!(removed, 1);
    }
}
