use anyhow::{bail, Result};

/// A tensor accessed by the computation. Each data-space dimension is an
/// affine combination of problem dimensions with non-negative coefficients,
/// e.g. the input width of a convolution is `1*P + 1*R`.
#[derive(Debug, Clone)]
pub struct DataSpace {
    pub name: String,
    /// projection[d] lists the (problem dimension, coefficient) terms
    /// contributing to data-space dimension d.
    pub projection: Vec<Vec<(usize, i64)>>,
}

impl DataSpace {
    pub fn new(name: &str, projection: Vec<Vec<(usize, i64)>>) -> DataSpace {
        DataSpace {
            name: String::from(name),
            projection,
        }
    }

    pub fn num_dims(&self) -> usize {
        self.projection.len()
    }
}

/// Workload configuration: the iteration-space shape and the data spaces
/// touched by it. Owned by the caller; the analysis engine copies what it
/// needs when a handle is passed to `init`.
#[derive(Debug, Clone)]
pub struct Workload {
    pub dim_names: Vec<String>,
    pub dim_sizes: Vec<usize>,
    pub data_spaces: Vec<DataSpace>,
}

impl Workload {
    pub fn new(dims: &[(&str, usize)], data_spaces: Vec<DataSpace>) -> Workload {
        Workload {
            dim_names: dims.iter().map(|(n, _)| String::from(*n)).collect(),
            dim_sizes: dims.iter().map(|(_, s)| *s).collect(),
            data_spaces,
        }
    }

    pub fn num_dims(&self) -> usize {
        self.dim_sizes.len()
    }

    pub fn num_data_spaces(&self) -> usize {
        self.data_spaces.len()
    }

    pub fn validate(&self) -> Result<()> {
        if self.dim_sizes.is_empty() {
            bail!("workload has no problem dimensions");
        }
        for (d, &size) in self.dim_sizes.iter().enumerate() {
            if size == 0 {
                bail!("problem dimension {} has size 0", self.dim_names[d]);
            }
        }
        for ds in self.data_spaces.iter() {
            if ds.projection.is_empty() {
                bail!("data space {} has no dimensions", ds.name);
            }
            for terms in ds.projection.iter() {
                if terms.is_empty() {
                    bail!("data space {} has a dimension with no terms", ds.name);
                }
                for &(dim, coef) in terms.iter() {
                    if dim >= self.num_dims() {
                        bail!(
                            "data space {} references undeclared problem dimension {}",
                            ds.name,
                            dim
                        );
                    }
                    if coef < 0 {
                        bail!("data space {} has a negative coefficient", ds.name);
                    }
                }
            }
        }
        Ok(())
    }

    /// Projects a problem point into each data space.
    /// Returns one coordinate vector per data space.
    pub fn project_point(&self, point: &[i64]) -> Vec<Vec<i64>> {
        self.data_spaces
            .iter()
            .map(|ds| {
                ds.projection
                    .iter()
                    .map(|terms| terms.iter().map(|&(dim, coef)| coef * point[dim]).sum())
                    .collect()
            })
            .collect()
    }

    /// Projects a half-open problem region `[low, high)` into each data
    /// space, returning per-data-space `(low, high)` bounds.
    pub fn project_region(&self, low: &[i64], high: &[i64]) -> Vec<(Vec<i64>, Vec<i64>)> {
        self.data_spaces
            .iter()
            .map(|ds| {
                let mut dlow = Vec::with_capacity(ds.num_dims());
                let mut dhigh = Vec::with_capacity(ds.num_dims());
                for terms in ds.projection.iter() {
                    let mut lo = 0i64;
                    let mut hi = 0i64;
                    for &(dim, coef) in terms.iter() {
                        lo += coef * low[dim];
                        hi += coef * (high[dim] - 1);
                    }
                    dlow.push(lo);
                    dhigh.push(hi + 1);
                }
                (dlow, dhigh)
            })
            .collect()
    }
}
