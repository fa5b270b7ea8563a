//! HDBSCAN clustering engine
//!
//! Density-based clustering over chunk embeddings:
//!
//! 1. Core distances (k-th nearest neighbor, quickselect or KD-tree)
//! 2. Prim MST over mutual reachability distances
//! 3. Condensed cluster tree with `min_cluster_size` fallout
//! 4. Stability and EOM / leaf selection
//! 5. Labels, membership probabilities, GLOSH-like outlier scores
//! 6. Model capture (centroids, exemplars) for incremental `predict`
//!
//! The fitted model assigns new points without refitting: a point joins
//! the cluster minimizing its exemplar mutual-reachability (or centroid
//! distance) when that falls within `2 / cluster_max_lambda`.

mod core;
mod mst;
mod tree;

use serde::{Deserialize, Serialize};

use crate::error::{EngramError, Result};
use crate::math::normalized_centroid;

use self::core::{core_distances, quickselect};
use self::mst::prim_mst;
use self::tree::CondensedTree;

// ============================================================================
// Parameters
// ============================================================================

/// Distance metric for clustering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Euclidean,
    /// `1 - dot` over unit vectors
    #[default]
    Angular,
}

/// Cluster selection strategy over the condensed tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMethod {
    /// Excess of mass: a node beats its children when its own stability
    /// is at least their propagated total
    #[default]
    Eom,
    /// Every leaf cluster is selected
    Leaf,
}

/// Clustering parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HdbscanParams {
    /// Smallest component promoted to a cluster; must be >= 2
    pub min_cluster_size: usize,
    /// Neighborhood size for core distances; defaults to `min_cluster_size`
    pub min_samples: Option<usize>,
    pub metric: Metric,
    pub selection: SelectionMethod,
    /// Route euclidean core distances through the KD-tree on larger inputs
    pub approximate_knn: bool,
    /// Spread core-distance rows across threads on larger inputs
    pub parallel: bool,
}

impl Default for HdbscanParams {
    fn default() -> Self {
        Self {
            min_cluster_size: 4,
            min_samples: None,
            metric: Metric::Angular,
            selection: SelectionMethod::Eom,
            approximate_knn: false,
            parallel: false,
        }
    }
}

impl HdbscanParams {
    pub(crate) fn min_samples(&self) -> usize {
        self.min_samples.unwrap_or(self.min_cluster_size)
    }

    fn validate(&self) -> Result<()> {
        if self.min_cluster_size < 2 {
            return Err(EngramError::invalid("min_cluster_size must be >= 2"));
        }
        if self.min_samples() == 0 {
            return Err(EngramError::invalid("min_samples must be positive"));
        }
        Ok(())
    }
}

// ============================================================================
// Results and fitted model
// ============================================================================

/// Per-point clustering outcome
#[derive(Debug, Clone, Default)]
pub struct HdbscanResult {
    /// -1 for noise, otherwise 0..num_clusters-1
    pub labels: Vec<i32>,
    /// Membership strength in [0, 1]; 0 for noise
    pub probabilities: Vec<f32>,
    /// GLOSH-like outlier score in [0, 1]
    pub outlier_scores: Vec<f32>,
    pub num_clusters: usize,
    pub noise_count: usize,
    /// Edges in the spanning tree (always `n - 1` for `n >= 1`)
    pub mst_edge_count: usize,
}

/// Captured per-cluster state for incremental assignment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterShape {
    /// Unit-normalized mean of member vectors
    pub centroid: Vec<f32>,
    /// Point indices closest to the centroid, at most `NUM_EXEMPLARS`
    pub exemplars: Vec<usize>,
    /// Densest fall-out lambda inside the cluster
    pub max_lambda: f32,
    /// Member point indices
    pub members: Vec<usize>,
}

/// Exemplars kept per cluster for prediction
pub const NUM_EXEMPLARS: usize = 3;

/// A fitted clustering usable for incremental prediction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HdbscanModel {
    pub params: HdbscanParams,
    pub clusters: Vec<ClusterShape>,
    /// Core distance of every fitted point
    pub core_distances: Vec<f32>,
    /// The original embeddings, in fit order
    pub embeddings: Vec<Vec<f32>>,
}

impl HdbscanModel {
    /// Assign one new point against the fitted model. Returns the cluster
    /// label, or -1 when the point fits nowhere.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` on a dimension mismatch.
    pub fn predict(&self, point: &[f32]) -> Result<i32> {
        if self.embeddings.is_empty() || self.clusters.is_empty() {
            return Ok(-1);
        }
        let dim = self.embeddings[0].len();
        if point.len() != dim {
            return Err(EngramError::invalid(format!(
                "predict dimension {} does not match model dimension {}",
                point.len(),
                dim
            )));
        }

        // Core distance of the new point against the fitted set.
        let mut dists: Vec<f32> = self
            .embeddings
            .iter()
            .map(|e| self.params.metric.distance(point, e))
            .collect();
        let k = self.params.min_samples().min(dists.len());
        let point_core = quickselect(&mut dists, k - 1);

        let mut best: Option<(usize, f32)> = None;
        for (idx, cluster) in self.clusters.iter().enumerate() {
            let min_mrd = cluster
                .exemplars
                .iter()
                .map(|&e| {
                    let d = self.params.metric.distance(point, &self.embeddings[e]);
                    d.max(point_core).max(self.core_distances[e])
                })
                .fold(f32::INFINITY, f32::min);
            let centroid_dist = self.params.metric.distance(point, &cluster.centroid);
            let effective = min_mrd.min(centroid_dist);
            if best.map(|(_, b)| effective < b).unwrap_or(true) {
                best = Some((idx, effective));
            }
        }

        let Some((idx, effective)) = best else {
            return Ok(-1);
        };
        let max_lambda = self.clusters[idx].max_lambda;
        if max_lambda <= 0.0 || effective <= 2.0 / max_lambda {
            Ok(idx as i32)
        } else {
            Ok(-1)
        }
    }
}

// ============================================================================
// Fit
// ============================================================================

/// Run the full pipeline over `points`.
///
/// Boundary behavior: zero points yields an all-empty result; a single
/// point is noise. Duplicate points never panic (reachability ties break
/// by index).
///
/// # Errors
///
/// Returns `InvalidArgument` for inconsistent dimensions or degenerate
/// parameters.
pub fn fit(points: &[Vec<f32>], params: &HdbscanParams) -> Result<(HdbscanResult, HdbscanModel)> {
    params.validate()?;
    let n = points.len();
    let empty_model = |core: Vec<f32>| HdbscanModel {
        params: params.clone(),
        clusters: Vec::new(),
        core_distances: core,
        embeddings: points.to_vec(),
    };

    if n == 0 {
        return Ok((HdbscanResult::default(), empty_model(Vec::new())));
    }
    let dim = points[0].len();
    if points.iter().any(|p| p.len() != dim) {
        return Err(EngramError::invalid("points must share one dimension"));
    }
    if n == 1 {
        let result = HdbscanResult {
            labels: vec![-1],
            probabilities: vec![0.0],
            outlier_scores: vec![0.0],
            num_clusters: 0,
            noise_count: 1,
            mst_edge_count: 0,
        };
        return Ok((result, empty_model(vec![0.0])));
    }

    let core = core_distances(points, params)?;
    let edges = prim_mst(points, &core, params);
    let mst_edge_count = edges.len();

    if n < params.min_cluster_size {
        // Nothing can be promoted; everything is noise at every scale.
        let result = HdbscanResult {
            labels: vec![-1; n],
            probabilities: vec![0.0; n],
            outlier_scores: vec![0.0; n],
            num_clusters: 0,
            noise_count: n,
            mst_edge_count,
        };
        return Ok((result, empty_model(core)));
    }

    let tree = CondensedTree::build(n, &edges, params.min_cluster_size);
    let selected = tree.select(params.selection);
    let labels = tree.labels(&selected);
    let probabilities = tree.probabilities(&selected, &labels);
    let outlier_scores = tree.outlier_scores();
    let noise_count = labels.iter().filter(|&&l| l == -1).count();

    let mut clusters = Vec::with_capacity(selected.len());
    for (label, &cluster_idx) in selected.iter().enumerate() {
        let members: Vec<usize> = labels
            .iter()
            .enumerate()
            .filter(|(_, &l)| l == label as i32)
            .map(|(p, _)| p)
            .collect();
        let member_vecs: Vec<&[f32]> = members.iter().map(|&p| points[p].as_slice()).collect();
        let centroid = normalized_centroid(&member_vecs)?.unwrap_or_else(|| vec![0.0; dim]);

        let mut by_distance: Vec<(usize, f32)> = members
            .iter()
            .map(|&p| (p, params.metric.distance(&points[p], &centroid)))
            .collect();
        by_distance.sort_by(|a, b| a.1.total_cmp(&b.1));
        let exemplars: Vec<usize> = by_distance
            .iter()
            .take(NUM_EXEMPLARS)
            .map(|&(p, _)| p)
            .collect();

        clusters.push(ClusterShape {
            centroid,
            exemplars,
            max_lambda: tree.subtree_max_lambda(cluster_idx),
            members,
        });
    }

    let result = HdbscanResult {
        num_clusters: selected.len(),
        labels,
        probabilities,
        outlier_scores,
        noise_count,
        mst_edge_count,
    };
    let model = HdbscanModel {
        params: params.clone(),
        clusters,
        core_distances: core,
        embeddings: points.to_vec(),
    };
    Ok((result, model))
}
