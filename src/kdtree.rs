//! KD-tree and decrease-key min-heap
//!
//! Supporting structures for the clustering pipeline: an approximate k-NN
//! KD-tree used for euclidean core distances, and a binary min-heap with an
//! index map that Prim's MST relies on for `decrease_key`.
//!
//! The KD-tree degrades to brute-force behavior in high dimensions but
//! stays correct; callers choose whether to build it at all.

use std::collections::HashMap;

use crate::error::{EngramError, Result};
use crate::math::euclidean_distance_unchecked;

// ============================================================================
// KD-tree
// ============================================================================

struct KdNode {
    /// Index into the original point set
    point: usize,
    axis: usize,
    left: Option<usize>,
    right: Option<usize>,
}

/// KD-tree over a fixed, owned point set
pub struct KdTree {
    points: Vec<Vec<f32>>,
    nodes: Vec<KdNode>,
    root: Option<usize>,
    dim: usize,
}

impl KdTree {
    /// Build a tree over the given points. The splitting axis cycles with
    /// depth; each node takes the median point along its axis.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the points disagree on dimension.
    pub fn build(points: Vec<Vec<f32>>) -> Result<Self> {
        let dim = points.first().map(|p| p.len()).unwrap_or(0);
        if points.iter().any(|p| p.len() != dim) {
            return Err(EngramError::invalid("kd-tree points must share one dimension"));
        }
        let mut tree = Self {
            nodes: Vec::with_capacity(points.len()),
            root: None,
            points,
            dim,
        };
        if !tree.points.is_empty() && dim > 0 {
            let mut indices: Vec<usize> = (0..tree.points.len()).collect();
            tree.root = tree.build_recursive(&mut indices, 0);
        }
        Ok(tree)
    }

    fn build_recursive(&mut self, indices: &mut [usize], depth: usize) -> Option<usize> {
        if indices.is_empty() {
            return None;
        }
        let axis = depth % self.dim;
        indices.sort_by(|&a, &b| self.points[a][axis].total_cmp(&self.points[b][axis]));
        let median = indices.len() / 2;
        let point = indices[median];

        let node_id = self.nodes.len();
        self.nodes.push(KdNode {
            point,
            axis,
            left: None,
            right: None,
        });

        // Split around the median without cloning the index slice.
        let (left_part, rest) = indices.split_at_mut(median);
        let right_part = &mut rest[1..];
        let left = self.build_recursive(left_part, depth + 1);
        let right = self.build_recursive(right_part, depth + 1);
        self.nodes[node_id].left = left;
        self.nodes[node_id].right = right;
        Some(node_id)
    }

    /// Number of indexed points
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Whether the tree is empty
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// The `k` nearest points to `query`, ascending by euclidean distance,
    /// as `(point_index, distance)` pairs. `exclude` removes one point
    /// index from consideration (self-exclusion during core-distance
    /// computation).
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` on a dimension mismatch or `k == 0`.
    pub fn k_nearest(
        &self,
        query: &[f32],
        k: usize,
        exclude: Option<usize>,
    ) -> Result<Vec<(usize, f32)>> {
        if k == 0 {
            return Err(EngramError::invalid("k must be positive"));
        }
        if query.len() != self.dim {
            return Err(EngramError::invalid(format!(
                "query dimension {} does not match tree dimension {}",
                query.len(),
                self.dim
            )));
        }
        // Max-heap of the current best k, keyed by distance; the root is
        // the worst kept candidate.
        let mut best: Vec<(f32, usize)> = Vec::with_capacity(k + 1);
        if let Some(root) = self.root {
            self.search(root, query, k, exclude, &mut best);
        }
        best.sort_by(|a, b| a.0.total_cmp(&b.0));
        Ok(best.into_iter().map(|(d, i)| (i, d)).collect())
    }

    fn search(
        &self,
        node_id: usize,
        query: &[f32],
        k: usize,
        exclude: Option<usize>,
        best: &mut Vec<(f32, usize)>,
    ) {
        let node = &self.nodes[node_id];
        let point = &self.points[node.point];

        if Some(node.point) != exclude {
            let dist = euclidean_distance_unchecked(query, point);
            if best.len() < k {
                best.push((dist, node.point));
            } else if let Some(worst) = current_worst(best) {
                if dist < worst {
                    replace_worst(best, (dist, node.point));
                }
            }
        }

        let axis = node.axis;
        let diff = query[axis] - point[axis];
        let (near, far) = if diff < 0.0 {
            (node.left, node.right)
        } else {
            (node.right, node.left)
        };

        if let Some(near) = near {
            self.search(near, query, k, exclude, best);
        }
        // Visit the far subtree only when the splitting plane is closer
        // than the current kth distance (or the candidate set is short).
        let kth = if best.len() < k {
            f32::INFINITY
        } else {
            current_worst(best).unwrap_or(f32::INFINITY)
        };
        if let Some(far) = far {
            if diff.abs() < kth {
                self.search(far, query, k, exclude, best);
            }
        }
    }
}

fn current_worst(best: &[(f32, usize)]) -> Option<f32> {
    best.iter().map(|(d, _)| *d).max_by(|a, b| a.total_cmp(b))
}

fn replace_worst(best: &mut [(f32, usize)], candidate: (f32, usize)) {
    if let Some(pos) = best
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.0.total_cmp(&b.0))
        .map(|(i, _)| i)
    {
        best[pos] = candidate;
    }
}

// ============================================================================
// MinHeap with decrease-key
// ============================================================================

/// Binary min-heap over `usize` values keyed by `f32`, with an index map
/// from value to heap position so `decrease_key` runs in O(log n).
pub struct MinHeap {
    /// (value, key) pairs in heap order
    data: Vec<(usize, f32)>,
    /// value -> position in `data`
    positions: HashMap<usize, usize>,
}

impl Default for MinHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl MinHeap {
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            positions: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Whether `value` is currently in the heap
    pub fn has(&self, value: usize) -> bool {
        self.positions.contains_key(&value)
    }

    /// Current key for `value`, if present
    pub fn get_key(&self, value: usize) -> Option<f32> {
        self.positions.get(&value).map(|&pos| self.data[pos].1)
    }

    /// The minimum entry without removing it
    pub fn peek(&self) -> Option<(usize, f32)> {
        self.data.first().copied()
    }

    /// Insert a value with the given key. Inserting a value already in the
    /// heap is treated as `decrease_key`.
    pub fn insert(&mut self, value: usize, key: f32) {
        if self.has(value) {
            self.decrease_key(value, key);
            return;
        }
        self.data.push((value, key));
        let pos = self.data.len() - 1;
        self.positions.insert(value, pos);
        self.sift_up(pos);
    }

    /// Remove and return the minimum entry
    pub fn extract_min(&mut self) -> Option<(usize, f32)> {
        if self.data.is_empty() {
            return None;
        }
        let last = self.data.len() - 1;
        self.data.swap(0, last);
        let (value, key) = self.data.pop().expect("non-empty");
        self.positions.remove(&value);
        if !self.data.is_empty() {
            self.positions.insert(self.data[0].0, 0);
            self.sift_down(0);
        }
        Some((value, key))
    }

    /// Lower the key of an existing value. A no-op when the new key is not
    /// strictly smaller, or when the value is absent.
    pub fn decrease_key(&mut self, value: usize, new_key: f32) {
        let Some(&pos) = self.positions.get(&value) else {
            return;
        };
        if new_key >= self.data[pos].1 {
            return;
        }
        self.data[pos].1 = new_key;
        self.sift_up(pos);
    }

    fn sift_up(&mut self, mut pos: usize) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if self.data[pos].1 < self.data[parent].1 {
                self.swap(pos, parent);
                pos = parent;
            } else {
                break;
            }
        }
    }

    fn sift_down(&mut self, mut pos: usize) {
        loop {
            let left = 2 * pos + 1;
            let right = 2 * pos + 2;
            let mut smallest = pos;
            if left < self.data.len() && self.data[left].1 < self.data[smallest].1 {
                smallest = left;
            }
            if right < self.data.len() && self.data[right].1 < self.data[smallest].1 {
                smallest = right;
            }
            if smallest == pos {
                break;
            }
            self.swap(pos, smallest);
            pos = smallest;
        }
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.data.swap(a, b);
        self.positions.insert(self.data[a].0, a);
        self.positions.insert(self.data[b].0, b);
    }
}
