//! Core distances and selection helpers
//!
//! The first stage of the clustering pipeline: for every point, the
//! distance to its k-th nearest neighbor. Small inputs short-circuit to
//! zero; the euclidean metric can route through the KD-tree, everything
//! else brute-forces a distance row and quickselects the k-th entry.

use crate::error::Result;
use crate::kdtree::KdTree;
use crate::math::{angular_distance_unchecked, euclidean_distance_unchecked};

use super::{HdbscanParams, Metric};

/// Point count above which the KD-tree pays for itself
const KDTREE_MIN_POINTS: usize = 256;

impl Metric {
    /// Raw distance under this metric; dimensions are validated once at
    /// pipeline entry.
    #[inline]
    pub(crate) fn distance(self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Metric::Euclidean => euclidean_distance_unchecked(a, b),
            Metric::Angular => angular_distance_unchecked(a, b),
        }
    }
}

/// k-th smallest element (0-based `k`) of a scratch buffer, by quickselect.
/// Average O(n); the buffer is consumed.
pub(crate) fn quickselect(values: &mut [f32], k: usize) -> f32 {
    debug_assert!(k < values.len());
    let mut lo = 0;
    let mut hi = values.len() - 1;
    loop {
        if lo == hi {
            return values[lo];
        }
        // Median-of-three pivot keeps sorted inputs from degrading.
        let mid = lo + (hi - lo) / 2;
        if values[mid] < values[lo] {
            values.swap(mid, lo);
        }
        if values[hi] < values[lo] {
            values.swap(hi, lo);
        }
        if values[hi] < values[mid] {
            values.swap(hi, mid);
        }
        let pivot = values[mid];

        let mut i = lo;
        let mut j = hi;
        while i <= j {
            while values[i] < pivot {
                i += 1;
            }
            while values[j] > pivot {
                j -= 1;
            }
            if i <= j {
                values.swap(i, j);
                i += 1;
                if j == 0 {
                    break;
                }
                j -= 1;
            }
        }
        if k <= j {
            hi = j;
        } else if k >= i {
            lo = i;
        } else {
            return values[k];
        }
    }
}

/// Core distance of every point: distance to the k-th nearest neighbor
/// with `k = min(min_samples, n - 1)`. When `n <= min_samples + 1` the
/// whole set shares a neighborhood and core distances collapse to zero.
pub(crate) fn core_distances(points: &[Vec<f32>], params: &HdbscanParams) -> Result<Vec<f32>> {
    let n = points.len();
    let min_samples = params.min_samples();
    if n <= min_samples + 1 {
        return Ok(vec![0.0; n]);
    }
    let k = min_samples.min(n - 1);

    if params.approximate_knn && params.metric == Metric::Euclidean && n > KDTREE_MIN_POINTS {
        return core_distances_kdtree(points, k);
    }
    Ok(core_distances_brute(points, k, params))
}

fn core_distances_kdtree(points: &[Vec<f32>], k: usize) -> Result<Vec<f32>> {
    let tree = KdTree::build(points.to_vec())?;
    let mut core = Vec::with_capacity(points.len());
    for (i, p) in points.iter().enumerate() {
        let neighbors = tree.k_nearest(p, k, Some(i))?;
        let kth = neighbors
            .last()
            .map(|(_, d)| *d)
            .unwrap_or(0.0);
        core.push(kth);
    }
    Ok(core)
}

fn core_distances_brute(points: &[Vec<f32>], k: usize, params: &HdbscanParams) -> Vec<f32> {
    let n = points.len();
    let row = |i: usize| -> f32 {
        let mut dists: Vec<f32> = (0..n)
            .filter(|&j| j != i)
            .map(|j| params.metric.distance(&points[i], &points[j]))
            .collect();
        quickselect(&mut dists, k - 1)
    };

    if params.parallel && n >= 512 {
        let workers = std::thread::available_parallelism()
            .map(|p| p.get())
            .unwrap_or(1)
            .min(8);
        let chunk = n.div_ceil(workers);
        let mut core = vec![0.0f32; n];
        let row = &row;
        std::thread::scope(|scope| {
            for (w, slot) in core.chunks_mut(chunk).enumerate() {
                let start = w * chunk;
                scope.spawn(move || {
                    for (offset, out) in slot.iter_mut().enumerate() {
                        *out = row(start + offset);
                    }
                });
            }
        });
        core
    } else {
        (0..n).map(row).collect()
    }
}
