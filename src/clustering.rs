//! Cluster manager
//!
//! Drives periodic reclustering: fetch every embedding, run HDBSCAN,
//! rebuild the cluster table with centroids and exemplars, carry labels
//! over from the previous generation by membership overlap, and softly
//! rescue noise points that sit close enough to a new centroid. The
//! fitted model stays in memory so new chunks can be assigned between
//! reclusters without refitting.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::ClusteringConfig;
use crate::db::ClusterStore;
use crate::error::Result;
use crate::hdbscan::{self, HdbscanModel, HdbscanParams, Metric, SelectionMethod};
use crate::math::angular_distance;
use crate::types::{Cluster, ClusterAssignment};
use crate::vectors::VectorStore;

/// Minimum Jaccard overlap for a new cluster to inherit an old label
const CARRY_OVER_THRESHOLD: f32 = 0.5;

/// Outcome of one recluster run
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ReclusterReport {
    pub num_clusters: usize,
    /// Distinct chunks holding at least one assignment
    pub assigned_chunks: usize,
    pub noise_chunks: usize,
    /// Noise fraction of all clustered points
    pub noise_ratio: f32,
    pub cluster_sizes: Vec<usize>,
    /// Distinct noise chunks rescued into at least one cluster
    pub reassigned_noise: usize,
    pub duration_ms: u64,
}

/// Owns the clustering lifecycle and the fitted model
pub struct ClusterManager {
    clusters: ClusterStore,
    vectors: Arc<VectorStore>,
    config: ClusteringConfig,
    /// Latest fitted model plus the row ids its labels map to
    model: RwLock<Option<(HdbscanModel, Vec<i64>)>>,
}

impl ClusterManager {
    pub fn new(clusters: ClusterStore, vectors: Arc<VectorStore>, config: ClusteringConfig) -> Self {
        Self {
            clusters,
            vectors,
            config,
            model: RwLock::new(None),
        }
    }

    /// Re-run HDBSCAN over every stored embedding and atomically replace
    /// the cluster tables.
    pub async fn recluster(&self) -> Result<ReclusterReport> {
        let started = std::time::Instant::now();

        let entries = self.vectors.all_vectors();
        let chunk_ids: Vec<String> = entries.iter().map(|(id, _)| id.clone()).collect();
        let points: Vec<Vec<f32>> = entries.into_iter().map(|(_, v)| v).collect();

        if points.is_empty() {
            self.clusters.replace_all(&[], &[]).await?;
            *self.model.write().await = None;
            return Ok(ReclusterReport {
                duration_ms: started.elapsed().as_millis() as u64,
                ..ReclusterReport::default()
            });
        }

        let params = HdbscanParams {
            min_cluster_size: self.config.min_cluster_size,
            min_samples: None,
            metric: Metric::Angular,
            selection: SelectionMethod::Eom,
            approximate_knn: false,
            parallel: true,
        };
        let (result, model) = hdbscan::fit(&points, &params)?;

        // Snapshot the outgoing generation for label carry-over.
        let mut old_generation = Vec::new();
        for cluster in self.clusters.all().await? {
            let members: HashSet<String> = self
                .clusters
                .members(cluster.id)
                .await?
                .into_iter()
                .map(|a| a.chunk_id)
                .collect();
            old_generation.push((cluster, members));
        }

        // Build the new generation from the fitted shapes.
        let now = Utc::now();
        let mut new_clusters = Vec::with_capacity(model.clusters.len());
        let mut new_members: Vec<HashSet<String>> = Vec::with_capacity(model.clusters.len());
        let mut assignments: Vec<(usize, ClusterAssignment)> = Vec::new();

        for (index, shape) in model.clusters.iter().enumerate() {
            let member_ids: Vec<String> = shape
                .members
                .iter()
                .map(|&p| chunk_ids[p].clone())
                .collect();
            let exemplar_ids: Vec<String> = shape
                .exemplars
                .iter()
                .map(|&p| chunk_ids[p].clone())
                .collect();

            for &point in &shape.members {
                let distance = angular_distance(&points[point], &shape.centroid)?;
                assignments.push((
                    index,
                    ClusterAssignment {
                        chunk_id: chunk_ids[point].clone(),
                        cluster_id: 0,
                        distance,
                    },
                ));
            }

            new_members.push(member_ids.iter().cloned().collect());
            new_clusters.push(Cluster {
                id: 0,
                name: None,
                description: None,
                centroid: shape.centroid.clone(),
                exemplar_ids,
                membership_hash: membership_hash(&member_ids),
                refreshed_at: None,
                created_at: now,
            });
        }

        let carried = carry_over_labels(&old_generation, &mut new_clusters, &new_members);

        // Noise rescue: any noise point near enough to a centroid joins
        // that cluster softly; one point may join several.
        let mut rescued: HashSet<String> = HashSet::new();
        for (point_index, &label) in result.labels.iter().enumerate() {
            if label != -1 {
                continue;
            }
            for (cluster_index, shape) in model.clusters.iter().enumerate() {
                let distance = angular_distance(&points[point_index], &shape.centroid)?;
                if distance < self.config.threshold {
                    assignments.push((
                        cluster_index,
                        ClusterAssignment {
                            chunk_id: chunk_ids[point_index].clone(),
                            cluster_id: 0,
                            distance,
                        },
                    ));
                    rescued.insert(chunk_ids[point_index].clone());
                }
            }
        }

        let row_ids = self.clusters.replace_all(&new_clusters, &assignments).await?;

        let assigned_chunks: HashSet<&String> = assignments.iter().map(|(_, a)| &a.chunk_id).collect();
        let report = ReclusterReport {
            num_clusters: new_clusters.len(),
            assigned_chunks: assigned_chunks.len(),
            noise_chunks: result.noise_count,
            noise_ratio: result.noise_count as f32 / points.len() as f32,
            cluster_sizes: model.clusters.iter().map(|c| c.members.len()).collect(),
            reassigned_noise: rescued.len(),
            duration_ms: started.elapsed().as_millis() as u64,
        };

        *self.model.write().await = Some((model, row_ids));
        info!(
            "recluster: {} clusters, {} assigned, {} noise ({} rescued), {} carried labels, {}ms",
            report.num_clusters,
            report.assigned_chunks,
            report.noise_chunks,
            report.reassigned_noise,
            carried,
            report.duration_ms
        );
        Ok(report)
    }

    /// Assign a new embedding against the latest fitted model. Returns
    /// the cluster row id, or `None` when no model is fitted or the
    /// point lands in noise.
    pub async fn predict(&self, point: &[f32]) -> Result<Option<i64>> {
        let guard = self.model.read().await;
        let Some((model, row_ids)) = guard.as_ref() else {
            return Ok(None);
        };
        let label = model.predict(point)?;
        if label < 0 {
            return Ok(None);
        }
        Ok(row_ids.get(label as usize).copied())
    }

    /// Whether a fitted model is available
    pub async fn has_model(&self) -> bool {
        self.model.read().await.is_some()
    }
}

/// Deterministic hash of the sorted member ids
pub fn membership_hash(member_ids: &[String]) -> String {
    let mut sorted: Vec<&String> = member_ids.iter().collect();
    sorted.sort();
    let mut hasher = Sha256::new();
    for id in sorted {
        hasher.update(id.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f32 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    intersection as f32 / union as f32
}

/// Greedy highest-overlap 1:1 matching between generations. Only old
/// clusters that were actually labeled (name and refreshed_at present)
/// can donate. Returns how many labels were carried.
fn carry_over_labels(
    old_generation: &[(Cluster, HashSet<String>)],
    new_clusters: &mut [Cluster],
    new_members: &[HashSet<String>],
) -> usize {
    let mut pairs: Vec<(f32, usize, usize)> = Vec::new();
    for (old_index, (old, old_members)) in old_generation.iter().enumerate() {
        if old.name.is_none() || old.refreshed_at.is_none() {
            continue;
        }
        for (new_index, members) in new_members.iter().enumerate() {
            let overlap = jaccard(old_members, members);
            if overlap >= CARRY_OVER_THRESHOLD {
                pairs.push((overlap, old_index, new_index));
            }
        }
    }
    pairs.sort_by(|a, b| b.0.total_cmp(&a.0));

    let mut used_old = HashSet::new();
    let mut used_new = HashSet::new();
    let mut carried = 0;
    for (overlap, old_index, new_index) in pairs {
        if used_old.contains(&old_index) || used_new.contains(&new_index) {
            continue;
        }
        used_old.insert(old_index);
        used_new.insert(new_index);

        let old = &old_generation[old_index].0;
        let target = &mut new_clusters[new_index];
        target.name = old.name.clone();
        target.description = old.description.clone();
        target.refreshed_at = old.refreshed_at;
        carried += 1;
        debug!(
            "carried label '{}' forward (jaccard {:.2})",
            old.name.as_deref().unwrap_or(""),
            overlap
        );
    }
    carried
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_pool;
    use tempfile::tempdir;

    fn unit3(x: f32, y: f32, z: f32) -> Vec<f32> {
        let mut v = vec![x, y, z];
        crate::math::normalize(&mut v);
        v
    }

    /// Two tight angular groups plus a point between them
    async fn seeded_manager(threshold: f32) -> (ClusterManager, Arc<VectorStore>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let vectors = Arc::new(VectorStore::open(dir.path().join("v.bin"), 3).unwrap());
        for i in 0..5 {
            let jitter = i as f32 * 0.01;
            vectors
                .upsert(&format!("x{i}"), &unit3(1.0, jitter, 0.0), Utc::now())
                .unwrap();
            vectors
                .upsert(&format!("y{i}"), &unit3(0.0, jitter, 1.0), Utc::now())
                .unwrap();
        }
        vectors
            .upsert("between", &unit3(1.0, 0.0, 0.9), Utc::now())
            .unwrap();

        let pool = memory_pool().await.unwrap();
        let clusters = ClusterStore::new(pool).await.unwrap();
        let manager = ClusterManager::new(
            clusters,
            vectors.clone(),
            ClusteringConfig {
                threshold,
                min_cluster_size: 3,
            },
        );
        (manager, vectors, dir)
    }

    #[test]
    fn test_membership_hash_order_independent() {
        let a = membership_hash(&["b".into(), "a".into(), "c".into()]);
        let b = membership_hash(&["c".into(), "b".into(), "a".into()]);
        assert_eq!(a, b);
        let c = membership_hash(&["a".into(), "b".into()]);
        assert_ne!(a, c);
    }

    #[test]
    fn test_jaccard() {
        let a: HashSet<String> = ["1", "2", "3"].iter().map(|s| s.to_string()).collect();
        let b: HashSet<String> = ["2", "3", "4"].iter().map(|s| s.to_string()).collect();
        assert!((jaccard(&a, &b) - 0.5).abs() < 1e-6);
        assert_eq!(jaccard(&a, &a), 1.0);
        assert_eq!(jaccard(&HashSet::new(), &HashSet::new()), 0.0);
    }

    #[tokio::test]
    async fn test_recluster_empty_store() {
        let dir = tempdir().unwrap();
        let vectors = Arc::new(VectorStore::open(dir.path().join("v.bin"), 3).unwrap());
        let pool = memory_pool().await.unwrap();
        let clusters = ClusterStore::new(pool).await.unwrap();
        let manager = ClusterManager::new(clusters, vectors, ClusteringConfig::default());

        let report = manager.recluster().await.unwrap();
        assert_eq!(report.num_clusters, 0);
        assert_eq!(report.assigned_chunks, 0);
        assert!(!manager.has_model().await);
    }

    #[tokio::test]
    async fn test_recluster_builds_two_clusters() {
        let (manager, _vectors, _dir) = seeded_manager(0.10).await;
        let report = manager.recluster().await.unwrap();

        assert_eq!(report.num_clusters, 2);
        assert!(report.assigned_chunks >= 10);
        assert!(report.noise_ratio < 0.2);
        for size in &report.cluster_sizes {
            assert!(*size >= 3);
        }

        let stored = manager.clusters.all().await.unwrap();
        assert_eq!(stored.len(), 2);
        for cluster in &stored {
            assert!(!cluster.exemplar_ids.is_empty());
            assert!(cluster.exemplar_ids.len() <= 3);
            assert!((crate::math::l2_norm(&cluster.centroid) - 1.0).abs() < 1e-4);
        }
    }

    #[tokio::test]
    async fn test_label_carry_over() {
        let (manager, _vectors, _dir) = seeded_manager(0.10).await;
        manager.recluster().await.unwrap();

        // An external labeler names both clusters.
        for cluster in manager.clusters.all().await.unwrap() {
            manager
                .clusters
                .update_label(cluster.id, Some("stable topic"), Some("desc"), Utc::now())
                .await
                .unwrap();
        }

        // Same data: the next generation overlaps fully and inherits.
        manager.recluster().await.unwrap();
        let relabeled = manager.clusters.all().await.unwrap();
        assert_eq!(relabeled.len(), 2);
        for cluster in relabeled {
            assert_eq!(cluster.name.as_deref(), Some("stable topic"));
            assert!(cluster.refreshed_at.is_some());
        }
    }

    #[tokio::test]
    async fn test_unlabeled_old_clusters_do_not_donate() {
        let (manager, _vectors, _dir) = seeded_manager(0.10).await;
        manager.recluster().await.unwrap();
        // No labeling pass: name/refreshed_at are absent.
        manager.recluster().await.unwrap();
        for cluster in manager.clusters.all().await.unwrap() {
            assert!(cluster.name.is_none());
        }
    }

    #[tokio::test]
    async fn test_noise_rescue_with_wide_threshold() {
        // A generous threshold lets the in-between point join a cluster.
        let (manager, _vectors, _dir) = seeded_manager(0.5).await;
        let report = manager.recluster().await.unwrap();
        if report.noise_chunks > 0 {
            assert!(report.reassigned_noise > 0);
        }
    }

    #[tokio::test]
    async fn test_predict_after_fit() {
        let (manager, _vectors, _dir) = seeded_manager(0.10).await;
        assert!(manager.predict(&unit3(1.0, 0.0, 0.0)).await.unwrap().is_none());

        manager.recluster().await.unwrap();
        let assigned = manager.predict(&unit3(1.0, 0.02, 0.0)).await.unwrap();
        assert!(assigned.is_some());
        // The predicted row id exists in the store.
        let cluster = manager.clusters.get(assigned.unwrap()).await.unwrap();
        assert!(cluster.is_some());
    }
}
