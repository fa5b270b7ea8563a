//! Pruner
//!
//! Lazy reaper for dead edges. Retrieval never deletes on the hot path;
//! edges whose effective weight hit zero are reported on an MPSC channel
//! and sit in the queue until `flush_now` deletes them in a batch and
//! counts the chunks that lost their last edge. Those orphans are the
//! TTL-cleanup candidates: their vectors fall to `cleanup_expired` once
//! stale. The edge store holds the sending end, which breaks the
//! edge-store/pruner dependency cycle.

use std::collections::HashSet;

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tracing::info;

use crate::db::{ChunkStore, EdgeStore};
use crate::error::Result;

/// Outcome of one flush
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PruneReport {
    pub edges_deleted: u64,
    pub chunks_orphaned: usize,
}

/// Consumer of the dead-edge queue
pub struct Pruner {
    queue: Mutex<UnboundedReceiver<i64>>,
    edges: EdgeStore,
    chunks: ChunkStore,
}

impl Pruner {
    /// Create the dead-edge channel. The sender goes to the edge store's
    /// constructor; the receiver goes to `Pruner::new`.
    pub fn channel() -> (UnboundedSender<i64>, UnboundedReceiver<i64>) {
        unbounded_channel()
    }

    pub fn new(queue: UnboundedReceiver<i64>, edges: EdgeStore, chunks: ChunkStore) -> Self {
        Self {
            queue: Mutex::new(queue),
            edges,
            chunks,
        }
    }

    /// Drain the queue, delete the queued edges in one batch, then count
    /// chunks left without any incident edge.
    pub async fn flush_now(&self) -> Result<PruneReport> {
        let ids: Vec<i64> = {
            let mut queue = self.queue.lock().await;
            let mut seen = HashSet::new();
            let mut ids = Vec::new();
            while let Ok(id) = queue.try_recv() {
                if seen.insert(id) {
                    ids.push(id);
                }
            }
            ids
        };

        if ids.is_empty() {
            return Ok(PruneReport::default());
        }

        let edges_deleted = self.edges.delete_many(&ids).await?;
        let chunks_orphaned = self.chunks.orphaned().await?.len();

        if edges_deleted > 0 {
            info!(
                "pruned {} dead edges; {} chunks now orphaned",
                edges_deleted, chunks_orphaned
            );
        }
        Ok(PruneReport {
            edges_deleted,
            chunks_orphaned,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{DecayConfig, DecayCurveKind, DecaySpec};
    use crate::db::chunks::test_chunk;
    use crate::db::memory_pool;
    use crate::types::{Edge, EdgeType};
    use chrono::Utc;

    async fn setup() -> (EdgeStore, ChunkStore, Pruner) {
        let pool = memory_pool().await.unwrap();
        let (tx, rx) = Pruner::channel();
        let edges = EdgeStore::new(pool.clone(), tx).await.unwrap();
        let chunks = ChunkStore::new(pool).await.unwrap();
        let pruner = Pruner::new(rx, edges.clone(), chunks.clone());
        (edges, chunks, pruner)
    }

    #[tokio::test]
    async fn test_flush_empty_queue() {
        let (_, _, pruner) = setup().await;
        let report = pruner.flush_now().await.unwrap();
        assert_eq!(report.edges_deleted, 0);
        assert_eq!(report.chunks_orphaned, 0);
    }

    #[tokio::test]
    async fn test_decayed_edge_is_reaped_on_flush() {
        let (edges, chunks, pruner) = setup().await;
        chunks.insert(&test_chunk("a", "s1", "src")).await.unwrap();
        chunks.insert(&test_chunk("b", "s1", "dst")).await.unwrap();

        // Backward linear decay dying at 10 hops; the edge's clock sits
        // 12 hops behind the reference, so it is dead at query time.
        let decay = DecayConfig {
            backward: DecaySpec {
                kind: DecayCurveKind::Linear,
                dies_at_hops: 10.0,
                hold_hops: 0.0,
            },
            ..DecayConfig::default()
        };
        let mut edge = Edge::new("a", "b", EdgeType::Backward, None, 1.0);
        let mut edge_clock = crate::clock::VectorClock::new();
        edge_clock.0.insert("agent".to_string(), 0);
        edge.vector_clock = Some(edge_clock);
        edges.create(&edge).await.unwrap();

        let mut reference = crate::clock::VectorClock::new();
        reference.0.insert("agent".to_string(), 12);
        let alive = edges
            .weighted_outgoing("a", Utc::now(), &decay, EdgeType::backward_set(), Some(&reference))
            .await
            .unwrap();
        assert!(alive.is_empty());

        let report = pruner.flush_now().await.unwrap();
        assert_eq!(report.edges_deleted, 1);
        // Both endpoints lost their only edge.
        assert_eq!(report.chunks_orphaned, 2);
        assert_eq!(edges.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_reports_delete_once() {
        let (edges, chunks, pruner) = setup().await;
        chunks.insert(&test_chunk("a", "s1", "src")).await.unwrap();
        chunks.insert(&test_chunk("b", "s1", "dst")).await.unwrap();

        let mut stale = Edge::new("a", "b", EdgeType::Backward, None, 1.0);
        stale.created_at = Utc::now() - chrono::Duration::days(365);
        edges.create(&stale).await.unwrap();

        // Two retrievals both observe the dead edge.
        for _ in 0..2 {
            let alive = edges
                .weighted_outgoing(
                    "a",
                    Utc::now(),
                    &DecayConfig::default(),
                    EdgeType::backward_set(),
                    None,
                )
                .await
                .unwrap();
            assert!(alive.is_empty());
        }

        let report = pruner.flush_now().await.unwrap();
        assert_eq!(report.edges_deleted, 1);
    }
}
