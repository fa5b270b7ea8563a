//! Minimum spanning tree over mutual reachability distances
//!
//! Prim's algorithm with a decrease-key heap. The graph is implicit and
//! complete: `mrd(i, j) = max(core[i], core[j], d(i, j))`. Ties keep the
//! earlier-seen parent, so equal-weight neighbors resolve to the smaller
//! index deterministically.

use crate::kdtree::MinHeap;

use super::HdbscanParams;

/// One MST edge
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MstEdge {
    pub a: usize,
    pub b: usize,
    pub weight: f32,
}

/// Mutual reachability distance between two points
#[inline]
pub(crate) fn mutual_reachability(
    points: &[Vec<f32>],
    core: &[f32],
    params: &HdbscanParams,
    i: usize,
    j: usize,
) -> f32 {
    let d = params.metric.distance(&points[i], &points[j]);
    d.max(core[i]).max(core[j])
}

/// Prim's MST from vertex 0. Returns exactly `n - 1` edges for `n >= 1`.
pub(crate) fn prim_mst(
    points: &[Vec<f32>],
    core: &[f32],
    params: &HdbscanParams,
) -> Vec<MstEdge> {
    let n = points.len();
    if n <= 1 {
        return Vec::new();
    }

    let mut heap = MinHeap::new();
    let mut parent: Vec<usize> = vec![usize::MAX; n];
    let mut in_tree = vec![false; n];

    heap.insert(0, 0.0);
    for v in 1..n {
        heap.insert(v, f32::INFINITY);
    }

    let mut edges = Vec::with_capacity(n - 1);
    while let Some((u, key)) = heap.extract_min() {
        in_tree[u] = true;
        if parent[u] != usize::MAX {
            edges.push(MstEdge {
                a: parent[u],
                b: u,
                weight: key,
            });
        }
        // Relax every remaining vertex against the freshly added one.
        // Strict `<` keeps the first (smaller-index) parent on ties.
        for v in 0..n {
            if in_tree[v] {
                continue;
            }
            let mrd = mutual_reachability(points, core, params, u, v);
            if let Some(current) = heap.get_key(v) {
                if mrd < current {
                    heap.decrease_key(v, mrd);
                    parent[v] = u;
                }
            }
        }
    }

    debug_assert_eq!(edges.len(), n - 1);
    edges
}
