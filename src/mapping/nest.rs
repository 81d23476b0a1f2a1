use anyhow::{bail, Result};

use crate::config::Workload;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopKind {
    Temporal,
    SpatialX,
    SpatialY,
}

impl LoopKind {
    pub fn is_spatial(&self) -> bool {
        !matches!(self, LoopKind::Temporal)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LoopLevel {
    pub dim: usize,
    pub bound: usize,
    pub kind: LoopKind,
}

impl LoopLevel {
    pub fn temporal(dim: usize, bound: usize) -> LoopLevel {
        LoopLevel {
            dim,
            bound,
            kind: LoopKind::Temporal,
        }
    }

    pub fn spatial_x(dim: usize, bound: usize) -> LoopLevel {
        LoopLevel {
            dim,
            bound,
            kind: LoopKind::SpatialX,
        }
    }

    pub fn spatial_y(dim: usize, bound: usize) -> LoopLevel {
        LoopLevel {
            dim,
            bound,
            kind: LoopKind::SpatialY,
        }
    }
}

/// A candidate mapping: a loop nest over the problem iteration space,
/// annotated with storage tiling boundaries and link information.
///
/// `levels` is ordered outermost first. `storage_boundaries[s]` is the
/// position, counted from the innermost level, of the outermost loop of
/// storage level `s`'s tiling region (region 0 is innermost). `linked[s]`
/// declares that the spatial instances of storage level `s` are connected
/// by on-chip links.
#[derive(Debug, Clone)]
pub struct Nest {
    pub levels: Vec<LoopLevel>,
    pub storage_boundaries: Vec<usize>,
    pub linked: Vec<bool>,
}

impl Nest {
    pub fn new(levels: Vec<LoopLevel>, storage_boundaries: Vec<usize>, linked: Vec<bool>) -> Nest {
        Nest {
            levels,
            storage_boundaries,
            linked,
        }
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    pub fn num_storage_levels(&self) -> usize {
        self.storage_boundaries.len()
    }

    /// Checks the nest against a workload. Boundary positions must be
    /// strictly increasing and the outermost level must close the outermost
    /// storage region; every maximal run of spatial levels must start at a
    /// storage boundary (its master spatial level) and must not swallow
    /// another boundary.
    pub fn validate(&self, workload: &Workload) -> Result<()> {
        let n = self.levels.len();
        if n == 0 {
            bail!("nest has no loop levels");
        }
        for level in self.levels.iter() {
            if level.bound == 0 {
                bail!("loop over dimension {} has bound 0", level.dim);
            }
            if level.dim >= workload.num_dims() {
                bail!("loop references undeclared problem dimension {}", level.dim);
            }
        }
        if self.storage_boundaries.is_empty() {
            bail!("nest declares no storage boundaries");
        }
        if self.linked.len() != self.storage_boundaries.len() {
            bail!(
                "linked flags ({}) do not match storage levels ({})",
                self.linked.len(),
                self.storage_boundaries.len()
            );
        }
        let mut prev: Option<usize> = None;
        for &b in self.storage_boundaries.iter() {
            if b >= n {
                bail!("storage boundary {} out of range ({} levels)", b, n);
            }
            if let Some(p) = prev {
                if b <= p {
                    bail!("storage boundaries must be strictly increasing");
                }
            }
            prev = Some(b);
        }
        if *self.storage_boundaries.last().unwrap() != n - 1 {
            bail!("outermost loop level must be a storage boundary");
        }

        // Spatial runs, walking innermost-first. A run's topmost level is its
        // master spatial level and must carry a storage boundary; interior
        // run levels must not.
        let is_boundary =
            |l: usize| -> bool { self.storage_boundaries.iter().any(|&b| b == l) };
        let kind_at = |l: usize| self.levels[n - 1 - l].kind;
        let mut l = 0;
        while l < n {
            if !kind_at(l).is_spatial() {
                l += 1;
                continue;
            }
            let bottom = l;
            while l + 1 < n && kind_at(l + 1).is_spatial() {
                l += 1;
            }
            let master = l;
            if !is_boundary(master) {
                bail!(
                    "spatial run at levels {}..={} is not anchored at a storage boundary \
                     (missing master spatial level)",
                    bottom,
                    master
                );
            }
            for k in bottom..master {
                if is_boundary(k) {
                    bail!(
                        "storage boundary at level {} lies inside a spatial run",
                        k
                    );
                }
            }
            l += 1;
        }
        Ok(())
    }
}
