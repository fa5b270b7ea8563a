//! Graph traverser
//!
//! Weighted best-first expansion over the reference graph. Seeds start at
//! their retrieval weights; each hop multiplies by the edge's query-time
//! effective weight, so paths fade with both distance and decay. The
//! direction picks which edge types are followed: forward chases
//! consequences (forward, team-spawn, brief), backward chases causes
//! (backward, within-chain, debrief, team-report, peer-message).

use std::collections::{BinaryHeap, HashMap};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::clock::{DecayConfig, VectorClock};
use crate::db::EdgeStore;
use crate::error::{EngramError, Result};
use crate::types::EdgeType;

/// Traversal direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

impl Direction {
    fn edge_types(self) -> &'static [EdgeType] {
        match self {
            Direction::Forward => EdgeType::forward_set(),
            Direction::Backward => EdgeType::backward_set(),
        }
    }
}

/// One reached chunk
#[derive(Debug, Clone, PartialEq)]
pub struct TraversalHit {
    pub chunk_id: String,
    pub weight: f32,
    pub depth: u32,
}

/// Traversal caps, taken from configuration
#[derive(Debug, Clone, Copy)]
pub struct TraversalLimits {
    pub max_depth: u32,
    pub min_weight: f32,
    pub max_visited: usize,
}

/// Best-first frontier entry; ordered by weight so the strongest node
/// expands first.
struct Frontier {
    weight: f32,
    depth: u32,
    chunk_id: String,
}

impl PartialEq for Frontier {
    fn eq(&self, other: &Self) -> bool {
        self.weight == other.weight
    }
}
impl Eq for Frontier {}
impl PartialOrd for Frontier {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Frontier {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.weight.total_cmp(&other.weight)
    }
}

/// Decay-weighted graph walker
#[derive(Clone)]
pub struct Traverser {
    edges: EdgeStore,
}

impl Traverser {
    pub fn new(edges: EdgeStore) -> Self {
        Self { edges }
    }

    /// Walk the graph from weighted seeds. Returns every reached chunk
    /// (seeds included, at depth 0) with its best weight and the depth at
    /// which that weight was recorded.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for an empty seed set.
    pub async fn traverse(
        &self,
        seeds: &[(String, f32)],
        direction: Direction,
        query_time: DateTime<Utc>,
        decay: &DecayConfig,
        reference: Option<&VectorClock>,
        limits: TraversalLimits,
    ) -> Result<Vec<TraversalHit>> {
        if seeds.is_empty() {
            return Err(EngramError::invalid("traversal requires at least one seed"));
        }
        let edge_types = direction.edge_types();

        // chunk_id -> (best weight, depth of that weight)
        let mut visited: HashMap<String, (f32, u32)> = HashMap::new();
        let mut queue: BinaryHeap<Frontier> = BinaryHeap::new();
        for (id, weight) in seeds {
            let entry = visited.entry(id.clone()).or_insert((*weight, 0));
            if entry.0 < *weight {
                *entry = (*weight, 0);
            }
            queue.push(Frontier {
                weight: *weight,
                depth: 0,
                chunk_id: id.clone(),
            });
        }

        while let Some(node) = queue.pop() {
            if visited.len() >= limits.max_visited {
                debug!("traversal stopped at visited cap {}", limits.max_visited);
                break;
            }
            // Skip frontier entries superseded by a better path.
            match visited.get(&node.chunk_id) {
                Some(&(best, _)) if best > node.weight => continue,
                _ => {}
            }
            if node.depth >= limits.max_depth {
                continue;
            }

            let outgoing = self
                .edges
                .weighted_outgoing(&node.chunk_id, query_time, decay, edge_types, reference)
                .await?;
            for weighted in outgoing {
                let propagated = node.weight * weighted.effective_weight;
                if propagated < limits.min_weight {
                    continue;
                }
                let target = &weighted.edge.target_chunk_id;
                let improved = match visited.get(target) {
                    Some(&(best, _)) => best < propagated,
                    None => true,
                };
                if improved {
                    visited.insert(target.clone(), (propagated, node.depth + 1));
                    queue.push(Frontier {
                        weight: propagated,
                        depth: node.depth + 1,
                        chunk_id: target.clone(),
                    });
                }
            }
        }

        let mut hits: Vec<TraversalHit> = visited
            .into_iter()
            .map(|(chunk_id, (weight, depth))| TraversalHit {
                chunk_id,
                weight,
                depth,
            })
            .collect();
        hits.sort_by(|a, b| b.weight.total_cmp(&a.weight).then_with(|| a.chunk_id.cmp(&b.chunk_id)));
        Ok(hits)
    }
}

/// Merge several traversal result sets: each chunk keeps its maximum
/// weight (and that weight's depth), then everything sorts descending.
/// The sort is stable with an id tie-break, so equal weights order
/// deterministically.
pub fn dedupe_and_rank(result_sets: Vec<Vec<TraversalHit>>) -> Vec<TraversalHit> {
    let mut best: HashMap<String, TraversalHit> = HashMap::new();
    for hits in result_sets {
        for hit in hits {
            match best.get(&hit.chunk_id) {
                Some(existing) if existing.weight >= hit.weight => {}
                _ => {
                    best.insert(hit.chunk_id.clone(), hit);
                }
            }
        }
    }
    let mut merged: Vec<TraversalHit> = best.into_values().collect();
    merged.sort_by(|a, b| b.weight.total_cmp(&a.weight).then_with(|| a.chunk_id.cmp(&b.chunk_id)));
    merged
}
