use crate::config::Workload;

/// Half-open axis-aligned box `[low, high)` of data-space coordinates.
/// The empty box is canonically `low == high`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AxisAlignedHyperRect {
    pub low: Vec<i64>,
    pub high: Vec<i64>,
}

impl AxisAlignedHyperRect {
    pub fn empty(num_dims: usize) -> AxisAlignedHyperRect {
        AxisAlignedHyperRect {
            low: vec![0; num_dims],
            high: vec![0; num_dims],
        }
    }

    pub fn new(low: Vec<i64>, high: Vec<i64>) -> AxisAlignedHyperRect {
        assert_eq!(low.len(), high.len());
        AxisAlignedHyperRect { low, high }
    }

    pub fn num_dims(&self) -> usize {
        self.low.len()
    }

    pub fn size(&self) -> u64 {
        let mut size = 1u64;
        for d in 0..self.low.len() {
            if self.high[d] <= self.low[d] {
                return 0;
            }
            size *= (self.high[d] - self.low[d]) as u64;
        }
        size
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn contains(&self, point: &[i64]) -> bool {
        debug_assert_eq!(point.len(), self.low.len());
        point
            .iter()
            .enumerate()
            .all(|(d, &c)| self.low[d] <= c && c < self.high[d])
    }

    /// True if every point of `self` lies in `other`.
    pub fn subset_of(&self, other: &AxisAlignedHyperRect) -> bool {
        if self.is_empty() {
            return true;
        }
        (0..self.low.len())
            .all(|d| other.low[d] <= self.low[d] && self.high[d] <= other.high[d])
    }

    pub fn intersect_size(&self, other: &AxisAlignedHyperRect) -> u64 {
        let mut size = 1u64;
        for d in 0..self.low.len() {
            let lo = self.low[d].max(other.low[d]);
            let hi = self.high[d].min(other.high[d]);
            if hi <= lo {
                return 0;
            }
            size *= (hi - lo) as u64;
        }
        size
    }

    /// Number of points in `self` but not in `other`.
    pub fn diff_size(&self, other: &AxisAlignedHyperRect) -> u64 {
        self.size() - self.intersect_size(other)
    }

    /// Grows `self` to the bounding box of both rectangles.
    pub fn union_with(&mut self, other: &AxisAlignedHyperRect) {
        if other.is_empty() {
            return;
        }
        if self.is_empty() {
            self.low.clone_from(&other.low);
            self.high.clone_from(&other.high);
            return;
        }
        for d in 0..self.low.len() {
            self.low[d] = self.low[d].min(other.low[d]);
            self.high[d] = self.high[d].max(other.high[d]);
        }
    }

    pub fn translated(&self, offset: &[i64]) -> AxisAlignedHyperRect {
        AxisAlignedHyperRect {
            low: self.low.iter().zip(offset).map(|(&c, &o)| c + o).collect(),
            high: self.high.iter().zip(offset).map(|(&c, &o)| c + o).collect(),
        }
    }

    /// Visits every point in row-major order.
    pub fn for_each_point(&self, mut f: impl FnMut(&[i64])) {
        if self.is_empty() {
            return;
        }
        let dims = self.low.len();
        let mut point = self.low.clone();
        loop {
            f(&point);
            let mut d = dims;
            loop {
                if d == 0 {
                    return;
                }
                d -= 1;
                point[d] += 1;
                if point[d] < self.high[d] {
                    break;
                }
                point[d] = self.low[d];
            }
        }
    }
}

/// The set of data-space points touched by a loop-nest subtree: one
/// bounding box per data space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationSpace {
    pub spaces: Vec<AxisAlignedHyperRect>,
}

impl OperationSpace {
    pub fn empty_for(workload: &Workload) -> OperationSpace {
        OperationSpace {
            spaces: workload
                .data_spaces
                .iter()
                .map(|ds| AxisAlignedHyperRect::empty(ds.num_dims()))
                .collect(),
        }
    }

    /// Footprint of a half-open problem region, projected per data space.
    pub fn from_problem_region(workload: &Workload, low: &[i64], high: &[i64]) -> OperationSpace {
        OperationSpace {
            spaces: workload
                .project_region(low, high)
                .into_iter()
                .map(|(lo, hi)| AxisAlignedHyperRect::new(lo, hi))
                .collect(),
        }
    }

    pub fn num_data_spaces(&self) -> usize {
        self.spaces.len()
    }

    pub fn size(&self, ds: usize) -> u64 {
        self.spaces[ds].size()
    }

    pub fn union_with(&mut self, other: &OperationSpace) {
        debug_assert_eq!(self.spaces.len(), other.spaces.len());
        for (a, b) in self.spaces.iter_mut().zip(other.spaces.iter()) {
            a.union_with(b);
        }
    }

    pub fn diff_size(&self, other: &OperationSpace, ds: usize) -> u64 {
        self.spaces[ds].diff_size(&other.spaces[ds])
    }

    /// Shifts every data space by its own offset vector.
    pub fn translated(&self, offsets: &[Vec<i64>]) -> OperationSpace {
        debug_assert_eq!(self.spaces.len(), offsets.len());
        OperationSpace {
            spaces: self
                .spaces
                .iter()
                .zip(offsets.iter())
                .map(|(rect, off)| rect.translated(off))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_and_empty() {
        let r = AxisAlignedHyperRect::new(vec![0, 0], vec![4, 3]);
        assert_eq!(r.size(), 12);
        assert!(!r.is_empty());
        assert!(AxisAlignedHyperRect::empty(2).is_empty());
    }

    #[test]
    fn test_union_hull() {
        let mut a = AxisAlignedHyperRect::new(vec![0], vec![2]);
        let b = AxisAlignedHyperRect::new(vec![3], vec![5]);
        a.union_with(&b);
        assert_eq!(a, AxisAlignedHyperRect::new(vec![0], vec![5]));

        let mut e = AxisAlignedHyperRect::empty(1);
        e.union_with(&b);
        assert_eq!(e, b);
    }

    #[test]
    fn test_diff_size() {
        let a = AxisAlignedHyperRect::new(vec![0, 0], vec![4, 4]);
        let b = AxisAlignedHyperRect::new(vec![2, 0], vec![6, 4]);
        assert_eq!(a.diff_size(&b), 8);
        assert_eq!(b.diff_size(&a), 8);
        assert_eq!(a.diff_size(&AxisAlignedHyperRect::empty(2)), 16);
    }

    #[test]
    fn test_subset_and_contains() {
        let a = AxisAlignedHyperRect::new(vec![1], vec![3]);
        let b = AxisAlignedHyperRect::new(vec![0], vec![4]);
        assert!(a.subset_of(&b));
        assert!(!b.subset_of(&a));
        assert!(b.contains(&[3]));
        assert!(!b.contains(&[4]));
    }

    #[test]
    fn test_for_each_point_row_major() {
        let r = AxisAlignedHyperRect::new(vec![0, 1], vec![2, 3]);
        let mut seen = Vec::new();
        r.for_each_point(|p| seen.push(p.to_vec()));
        assert_eq!(
            seen,
            vec![vec![0, 1], vec![0, 2], vec![1, 1], vec![1, 2]]
        );
    }

    #[test]
    fn test_translated() {
        let r = AxisAlignedHyperRect::new(vec![0, 0], vec![2, 2]);
        let t = r.translated(&[5, -1]);
        assert_eq!(t, AxisAlignedHyperRect::new(vec![5, -1], vec![7, 1]));
    }
}
