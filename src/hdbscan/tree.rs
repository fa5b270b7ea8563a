//! Condensed cluster tree
//!
//! Second half of the clustering pipeline: the sorted MST edges feed a
//! union-find that builds the single-linkage hierarchy, which is then
//! condensed against `min_cluster_size`. Cluster nodes get ids >= n
//! (points keep 0..n-1); components too small to promote fall out into
//! their parent at the lambda of the split. Stability, EOM/leaf selection,
//! labels, probabilities, and outlier scores all read off this tree.

use std::collections::HashMap;

use super::mst::MstEdge;
use super::SelectionMethod;

/// Distances below this are clamped before inversion so duplicate points
/// produce a large finite lambda instead of infinity.
const MIN_SPLIT_DISTANCE: f32 = 1e-8;

#[inline]
fn lambda_of(dist: f32) -> f32 {
    1.0 / dist.max(MIN_SPLIT_DISTANCE)
}

// ============================================================================
// Single-linkage hierarchy
// ============================================================================

/// Internal node of the single-linkage dendrogram. Leaves are point ids
/// 0..n-1; internal nodes are n..2n-2 in merge order.
struct SlNode {
    left: usize,
    right: usize,
    dist: f32,
    size: usize,
}

struct SingleLinkage {
    n: usize,
    nodes: Vec<SlNode>,
}

impl SingleLinkage {
    fn build(n: usize, edges: &[MstEdge]) -> Self {
        let mut sorted: Vec<&MstEdge> = edges.iter().collect();
        sorted.sort_by(|x, y| {
            x.weight
                .total_cmp(&y.weight)
                .then(x.a.cmp(&y.a))
                .then(x.b.cmp(&y.b))
        });

        // Union-find over components; each component tracks the id of the
        // dendrogram node currently representing it.
        let mut uf_parent: Vec<usize> = (0..n).collect();
        let mut component_node: Vec<usize> = (0..n).collect();
        let mut component_size: Vec<usize> = vec![1; n];

        fn find(uf: &mut [usize], mut x: usize) -> usize {
            while uf[x] != x {
                uf[x] = uf[uf[x]];
                x = uf[x];
            }
            x
        }

        let mut nodes = Vec::with_capacity(n.saturating_sub(1));
        for edge in sorted {
            let ra = find(&mut uf_parent, edge.a);
            let rb = find(&mut uf_parent, edge.b);
            debug_assert_ne!(ra, rb, "MST edges never join one component twice");
            let new_id = n + nodes.len();
            nodes.push(SlNode {
                left: component_node[ra],
                right: component_node[rb],
                dist: edge.weight,
                size: component_size[ra] + component_size[rb],
            });
            uf_parent[rb] = ra;
            component_node[ra] = new_id;
            component_size[ra] += component_size[rb];
        }

        Self { n, nodes }
    }

    fn size_of(&self, id: usize) -> usize {
        if id < self.n {
            1
        } else {
            self.nodes[id - self.n].size
        }
    }

    /// All point ids beneath a dendrogram node
    fn collect_points(&self, id: usize, out: &mut Vec<usize>) {
        let mut stack = vec![id];
        while let Some(cur) = stack.pop() {
            if cur < self.n {
                out.push(cur);
            } else {
                let node = &self.nodes[cur - self.n];
                stack.push(node.left);
                stack.push(node.right);
            }
        }
    }
}

// ============================================================================
// Condensed tree
// ============================================================================

/// One cluster node of the condensed tree
pub(crate) struct CondensedCluster {
    /// Global id (>= n; points hold 0..n-1)
    pub id: usize,
    /// Local index of the parent cluster
    pub parent: Option<usize>,
    /// Local indices of child clusters (empty for leaves)
    pub children: Vec<usize>,
    pub lambda_birth: f32,
    /// Lambda at which this cluster split in two or dissolved
    pub lambda_death: f32,
    /// Points recorded directly in this cluster, with their fall-out lambda
    pub own_points: Vec<(usize, f32)>,
    /// Total points in this cluster's subtree
    pub subtree_size: usize,
    pub stability: f32,
}

pub(crate) struct CondensedTree {
    pub n_points: usize,
    pub clusters: Vec<CondensedCluster>,
    /// For every point: local index of the cluster it was recorded in
    pub point_cluster: Vec<usize>,
    /// For every point: lambda at which it fell out
    pub point_lambda: Vec<f32>,
}

impl CondensedTree {
    /// Condense the single-linkage hierarchy of `edges` over `n` points.
    /// Requires `n >= 2` and `min_cluster_size >= 2`.
    pub fn build(n: usize, edges: &[MstEdge], min_cluster_size: usize) -> Self {
        let sl = SingleLinkage::build(n, edges);
        let root_sl = if n >= 2 { 2 * n - 2 } else { 0 };

        let mut tree = Self {
            n_points: n,
            clusters: Vec::new(),
            point_cluster: vec![usize::MAX; n],
            point_lambda: vec![0.0; n],
        };

        // Root condensed cluster is born at lambda 0 (infinite distance).
        tree.clusters.push(CondensedCluster {
            id: n,
            parent: None,
            children: Vec::new(),
            lambda_birth: 0.0,
            lambda_death: 0.0,
            own_points: Vec::new(),
            subtree_size: 0,
            stability: 0.0,
        });

        // Each stack entry condenses one cluster starting at an sl node.
        let mut stack: Vec<(usize, usize)> = vec![(0, root_sl)];
        while let Some((cluster_idx, start)) = stack.pop() {
            tree.condense_chain(&sl, cluster_idx, start, min_cluster_size, &mut stack);
        }

        tree.compute_subtree_sizes();
        tree.compute_stability();
        tree
    }

    /// Follow the continuing chain of one condensed cluster: shed small
    /// sides until the cluster truly splits or dissolves.
    fn condense_chain(
        &mut self,
        sl: &SingleLinkage,
        cluster_idx: usize,
        start: usize,
        min_cluster_size: usize,
        stack: &mut Vec<(usize, usize)>,
    ) {
        let mut current = start;
        loop {
            if current < sl.n {
                // A single point left in the chain: it leaves when its
                // final merge dissolves, which the parent recorded.
                self.record_point(cluster_idx, current, self.clusters[cluster_idx].lambda_death);
                return;
            }
            let node = &sl.nodes[current - sl.n];
            let lambda = lambda_of(node.dist);
            let left_size = sl.size_of(node.left);
            let right_size = sl.size_of(node.right);
            let left_big = left_size >= min_cluster_size;
            let right_big = right_size >= min_cluster_size;

            if left_big && right_big {
                // True split: this cluster dies, two children are born.
                self.clusters[cluster_idx].lambda_death = lambda;
                for side in [node.left, node.right] {
                    let child_idx = self.clusters.len();
                    self.clusters.push(CondensedCluster {
                        id: sl.n + child_idx,
                        parent: Some(cluster_idx),
                        children: Vec::new(),
                        lambda_birth: lambda,
                        lambda_death: lambda,
                        own_points: Vec::new(),
                        subtree_size: 0,
                        stability: 0.0,
                    });
                    self.clusters[cluster_idx].children.push(child_idx);
                    stack.push((child_idx, side));
                }
                return;
            }

            if !left_big && !right_big {
                // Dissolution: every remaining point falls out here.
                self.clusters[cluster_idx].lambda_death = lambda;
                let mut points = Vec::new();
                sl.collect_points(node.left, &mut points);
                sl.collect_points(node.right, &mut points);
                for p in points {
                    self.record_point(cluster_idx, p, lambda);
                }
                return;
            }

            // One small side sheds its points; the big side continues as
            // the same cluster.
            let (small, big) = if left_big {
                (node.right, node.left)
            } else {
                (node.left, node.right)
            };
            let mut points = Vec::new();
            sl.collect_points(small, &mut points);
            for p in points {
                self.record_point(cluster_idx, p, lambda);
            }
            self.clusters[cluster_idx].lambda_death = lambda;
            current = big;
        }
    }

    fn record_point(&mut self, cluster_idx: usize, point: usize, lambda: f32) {
        self.clusters[cluster_idx].own_points.push((point, lambda));
        self.point_cluster[point] = cluster_idx;
        self.point_lambda[point] = lambda;
    }

    fn compute_subtree_sizes(&mut self) {
        // Children always carry a larger local index than their parent, so
        // a reverse scan is a bottom-up traversal.
        for idx in (0..self.clusters.len()).rev() {
            let own = self.clusters[idx].own_points.len();
            let children_total: usize = self.clusters[idx]
                .children
                .iter()
                .map(|&c| self.clusters[c].subtree_size)
                .sum();
            self.clusters[idx].subtree_size = own + children_total;
        }
    }

    /// Stability = sum over member points of
    /// `min(lambda_death, lambda_point_left) - lambda_birth`. Points that
    /// survive into child clusters are capped at this cluster's death.
    fn compute_stability(&mut self) {
        for idx in (0..self.clusters.len()).rev() {
            let cluster = &self.clusters[idx];
            let own: f32 = cluster
                .own_points
                .iter()
                .map(|&(_, lambda)| (lambda.min(cluster.lambda_death) - cluster.lambda_birth).max(0.0))
                .sum();
            let surviving: usize = cluster
                .children
                .iter()
                .map(|&c| self.clusters[c].subtree_size)
                .sum();
            let capped = surviving as f32 * (cluster.lambda_death - cluster.lambda_birth).max(0.0);
            self.clusters[idx].stability = own + capped;
        }
    }

    // ------------------------------------------------------------------------
    // Selection
    // ------------------------------------------------------------------------

    /// Local indices of the selected clusters, ascending by cluster id
    pub fn select(&self, method: SelectionMethod) -> Vec<usize> {
        match method {
            SelectionMethod::Leaf => {
                let mut selected: Vec<usize> = (0..self.clusters.len())
                    .filter(|&i| self.clusters[i].children.is_empty())
                    .collect();
                selected.sort_by_key(|&i| self.clusters[i].id);
                selected
            }
            SelectionMethod::Eom => self.select_eom(),
        }
    }

    /// Excess-of-mass: bottom-up, a node keeps its own stability when it
    /// beats the total of its children, deselecting everything below.
    fn select_eom(&self) -> Vec<usize> {
        let count = self.clusters.len();
        let mut propagated = vec![0.0f32; count];
        let mut flagged = vec![false; count];

        for idx in (0..count).rev() {
            let children_total: f32 = self.clusters[idx]
                .children
                .iter()
                .map(|&c| propagated[c])
                .sum();
            let own = self.clusters[idx].stability;
            if self.clusters[idx].children.is_empty() || own >= children_total {
                propagated[idx] = own;
                flagged[idx] = true;
            } else {
                propagated[idx] = children_total;
            }
        }

        // A flagged node only survives when no flagged ancestor shadows it.
        let mut selected = Vec::new();
        for idx in 0..count {
            if !flagged[idx] {
                continue;
            }
            let mut ancestor = self.clusters[idx].parent;
            let mut shadowed = false;
            while let Some(a) = ancestor {
                if flagged[a] {
                    shadowed = true;
                    break;
                }
                ancestor = self.clusters[a].parent;
            }
            if !shadowed {
                selected.push(idx);
            }
        }
        selected.sort_by_key(|&i| self.clusters[i].id);
        selected
    }

    // ------------------------------------------------------------------------
    // Point-level outputs
    // ------------------------------------------------------------------------

    /// Labels in 0..K-1 for points inside a selected cluster's subtree,
    /// -1 for noise
    pub fn labels(&self, selected: &[usize]) -> Vec<i32> {
        let label_of: HashMap<usize, i32> = selected
            .iter()
            .enumerate()
            .map(|(k, &idx)| (idx, k as i32))
            .collect();

        let mut labels = vec![-1i32; self.n_points];
        for p in 0..self.n_points {
            let mut cursor = Some(self.point_cluster[p]);
            while let Some(idx) = cursor {
                if let Some(&label) = label_of.get(&idx) {
                    labels[p] = label;
                    break;
                }
                cursor = self.clusters[idx].parent;
            }
        }
        labels
    }

    /// Max fall-out lambda over a cluster's whole subtree
    pub fn subtree_max_lambda(&self, cluster_idx: usize) -> f32 {
        let mut max_lambda = 0.0f32;
        let mut stack = vec![cluster_idx];
        while let Some(idx) = stack.pop() {
            for &(_, lambda) in &self.clusters[idx].own_points {
                max_lambda = max_lambda.max(lambda);
            }
            stack.extend(self.clusters[idx].children.iter().copied());
        }
        max_lambda
    }

    /// Membership strength per point: `lambda_leave / cluster_max_lambda`
    /// clamped to [0, 1]; noise scores 0.
    pub fn probabilities(&self, selected: &[usize], labels: &[i32]) -> Vec<f32> {
        let max_lambda: Vec<f32> = selected
            .iter()
            .map(|&idx| self.subtree_max_lambda(idx))
            .collect();

        labels
            .iter()
            .enumerate()
            .map(|(p, &label)| {
                if label < 0 {
                    return 0.0;
                }
                let cluster_max = max_lambda[label as usize];
                if cluster_max <= 0.0 {
                    return 1.0;
                }
                (self.point_lambda[p] / cluster_max).clamp(0.0, 1.0)
            })
            .collect()
    }

    /// GLOSH-like outlier score per point: `1 - lambda_leave / lambda_max`
    /// where `lambda_max` is the densest lambda reachable beneath the
    /// cluster the point last belonged to. Early drop-outs score near 1.
    pub fn outlier_scores(&self) -> Vec<f32> {
        let mut cache: HashMap<usize, f32> = HashMap::new();
        (0..self.n_points)
            .map(|p| {
                let cluster_idx = self.point_cluster[p];
                let max_lambda = *cache
                    .entry(cluster_idx)
                    .or_insert_with(|| self.subtree_max_lambda(cluster_idx));
                if max_lambda <= 0.0 {
                    return 0.0;
                }
                (1.0 - self.point_lambda[p] / max_lambda).clamp(0.0, 1.0)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Two tight pairs far apart, plus one distant straggler.
    fn line_edges() -> (usize, Vec<MstEdge>) {
        // Points: 0 at x=0, 1 at x=0.1, 2 at x=10, 3 at x=10.1, 4 at x=50
        let edges = vec![
            MstEdge { a: 0, b: 1, weight: 0.1 },
            MstEdge { a: 1, b: 2, weight: 9.9 },
            MstEdge { a: 2, b: 3, weight: 0.1 },
            MstEdge { a: 3, b: 4, weight: 39.9 },
        ];
        (5, edges)
    }

    #[test]
    fn test_condensed_tree_two_pairs() {
        let (n, edges) = line_edges();
        let tree = CondensedTree::build(n, &edges, 2);
        let selected = tree.select(SelectionMethod::Leaf);
        let labels = tree.labels(&selected);

        // The two tight pairs form two clusters; the straggler is shed
        // into an ancestor before any leaf cluster forms.
        assert_eq!(labels[0], labels[1]);
        assert_eq!(labels[2], labels[3]);
        assert_ne!(labels[0], labels[2]);
        assert_eq!(labels[4], -1);
    }

    #[test]
    fn test_probabilities_bounds() {
        let (n, edges) = line_edges();
        let tree = CondensedTree::build(n, &edges, 2);
        let selected = tree.select(SelectionMethod::Eom);
        let labels = tree.labels(&selected);
        let probs = tree.probabilities(&selected, &labels);
        for (p, &label) in probs.iter().zip(labels.iter()) {
            assert!((0.0..=1.0).contains(p));
            if label == -1 {
                assert_eq!(*p, 0.0);
            }
        }
    }

    #[test]
    fn test_outlier_scores_straggler_high() {
        let (n, edges) = line_edges();
        let tree = CondensedTree::build(n, &edges, 2);
        let scores = tree.outlier_scores();
        for s in &scores {
            assert!((0.0..=1.0).contains(s));
        }
        // Point 4 disconnects at lambda 1/39.9 against a subtree whose
        // densest lambda is 1/0.1.
        assert!(scores[4] >= 0.8, "straggler score {}", scores[4]);
    }

    #[test]
    fn test_stability_prefers_tight_children() {
        let (n, edges) = line_edges();
        let tree = CondensedTree::build(n, &edges, 2);
        let selected = tree.select(SelectionMethod::Eom);
        // EOM must pick the two tight pairs over their loose parent.
        assert_eq!(selected.len(), 2);
        for &idx in &selected {
            assert!(tree.clusters[idx].children.is_empty());
        }
    }

    #[test]
    fn test_single_merge_tree() {
        let edges = vec![MstEdge { a: 0, b: 1, weight: 1.0 }];
        let tree = CondensedTree::build(2, &edges, 2);
        let selected = tree.select(SelectionMethod::Eom);
        let labels = tree.labels(&selected);
        // Both points dissolve out of the root together and the root is
        // the only selectable cluster.
        assert_eq!(labels, vec![0, 0]);
    }
}
