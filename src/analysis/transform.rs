use log::warn;

use crate::config::Workload;
use crate::problem::OperationSpace;

/// Running coordinate of the traversal: the index tuple currently active
/// (one entry per loop level, innermost first) and the problem point it
/// denotes. Passed explicitly to every transform call; the transform itself
/// holds no mutable state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformCache {
    pub indices: Vec<usize>,
    pub point: Vec<i64>,
}

/// Memoized affine mapping from loop indices to problem-space points.
///
/// Built once per analysis: per-level scale factors (the product of inner
/// bounds indexing the same problem dimension) make the mapping incremental,
/// and per-level molds (the data-space footprint of the subtree rooted at
/// each level, anchored at the origin) make subtree footprints a translate
/// away from the current point.
#[derive(Debug, Clone)]
pub struct PointTransform {
    dims: Vec<usize>,
    bounds: Vec<usize>,
    scales: Vec<i64>,
    /// molds[l]: footprint of levels 0..=l (innermost first) at origin.
    molds: Vec<OperationSpace>,
    /// Footprint of a single elementary iteration at the origin.
    body_mold: OperationSpace,
}

impl PointTransform {
    /// `dims`/`bounds` are per loop level, innermost first.
    pub fn new(workload: &Workload, dims: &[usize], bounds: &[usize]) -> PointTransform {
        let num_levels = dims.len();
        let mut extent = vec![1i64; workload.num_dims()];
        let mut scales = Vec::with_capacity(num_levels);
        let mut molds = Vec::with_capacity(num_levels);
        let origin = vec![0i64; workload.num_dims()];
        for l in 0..num_levels {
            scales.push(extent[dims[l]]);
            extent[dims[l]] *= bounds[l] as i64;
            molds.push(OperationSpace::from_problem_region(
                workload, &origin, &extent,
            ));
        }
        for d in 0..workload.num_dims() {
            if extent[d] != workload.dim_sizes[d] as i64 {
                warn!(
                    "nest covers {} of {} along problem dimension {}",
                    extent[d], workload.dim_sizes[d], workload.dim_names[d]
                );
            }
        }
        let unit = vec![1i64; workload.num_dims()];
        PointTransform {
            dims: dims.to_vec(),
            bounds: bounds.to_vec(),
            scales,
            molds,
            body_mold: OperationSpace::from_problem_region(workload, &origin, &unit),
        }
    }

    pub fn new_cache(&self, workload: &Workload) -> TransformCache {
        TransformCache {
            indices: vec![0; self.dims.len()],
            point: vec![0; workload.num_dims()],
        }
    }

    /// Moves one level's index, updating only that level's contribution to
    /// the cached point.
    pub fn set_index(&self, cache: &mut TransformCache, level: usize, index: usize) {
        debug_assert!(index < self.bounds[level], "index out of declared bounds");
        let old = cache.indices[level];
        if old == index {
            return;
        }
        cache.point[self.dims[level]] += (index as i64 - old as i64) * self.scales[level];
        cache.indices[level] = index;
    }

    /// Footprint of the subtree rooted at `level` (everything at and inside
    /// it), anchored at the cached point's contributions from outer levels.
    /// The cache's indices at and inside `level` must be zero.
    pub fn subtree_space(
        &self,
        workload: &Workload,
        cache: &TransformCache,
        level: usize,
    ) -> OperationSpace {
        debug_assert!(cache.indices[..=level].iter().all(|&i| i == 0));
        self.molds[level].translated(&workload.project_point(&cache.point))
    }

    /// Footprint of one elementary iteration at the cached point.
    pub fn body_space(&self, workload: &Workload, cache: &TransformCache) -> OperationSpace {
        self.body_mold
            .translated(&workload.project_point(&cache.point))
    }

    /// Working-set size of the subtree rooted at `level`, per data space.
    /// Independent of the cache: mold extents do not move under translation.
    pub fn subtree_sizes(&self, level: usize) -> Vec<u64> {
        let mold = &self.molds[level];
        (0..mold.num_data_spaces()).map(|ds| mold.size(ds)).collect()
    }

    pub fn body_sizes(&self) -> Vec<u64> {
        let mold = &self.body_mold;
        (0..mold.num_data_spaces()).map(|ds| mold.size(ds)).collect()
    }
}
