use serde::{Deserialize, Serialize};

/// Per (data space, storage level) movement statistics. Access, scatter,
/// and hop counters are bucketed by multicast degree: index `n-1` counts
/// points delivered to `n` spatial elements. Purely temporal accounting
/// uses the single degree-1 bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileInfo {
    pub size: u64,
    pub accesses: Vec<u64>,
    pub scatter_factors: Vec<u64>,
    pub cumulative_hops: Vec<u64>,
    pub link_transfers: u64,
    pub accounting_steps: u64,
}

impl TileInfo {
    pub fn new(degrees: usize) -> TileInfo {
        TileInfo {
            size: 0,
            accesses: vec![0; degrees],
            scatter_factors: vec![0; degrees],
            cumulative_hops: vec![0; degrees],
            link_transfers: 0,
            accounting_steps: 0,
        }
    }

    pub fn total_accesses(&self) -> u64 {
        self.accesses.iter().sum()
    }

    /// Access-weighted average multicast degree.
    pub fn multicast_factor(&self) -> f64 {
        let total = self.total_accesses();
        if total == 0 {
            return 1.0;
        }
        let weighted: u64 = self
            .accesses
            .iter()
            .enumerate()
            .map(|(i, &a)| (i as u64 + 1) * a)
            .sum();
        weighted as f64 / total as f64
    }

    /// Average number of distinct deliveries per accounting step.
    pub fn scatter_factor(&self) -> f64 {
        if self.accounting_steps == 0 {
            return 1.0;
        }
        let scattered: u64 = self.scatter_factors.iter().sum();
        scattered as f64 / self.accounting_steps as f64
    }

    pub fn total_hops(&self) -> u64 {
        self.cumulative_hops.iter().sum()
    }
}

/// Statistics of the innermost computational body, independent of the
/// storage hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BodyInfo {
    /// Elementary operations across all spatial elements.
    pub ops: u64,
    /// Operations executed by a single innermost spatial element.
    pub ops_per_element: u64,
}

impl BodyInfo {
    pub fn new() -> BodyInfo {
        BodyInfo {
            ops: 0,
            ops_per_element: 0,
        }
    }
}

impl Default for BodyInfo {
    fn default() -> BodyInfo {
        BodyInfo::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multicast_factor_weighted() {
        let mut tile = TileInfo::new(4);
        tile.accesses[0] = 2; // 2 points at degree 1
        tile.accesses[3] = 2; // 2 points at degree 4
        assert_eq!(tile.total_accesses(), 4);
        assert!((tile.multicast_factor() - 2.5).abs() < 1e-9);
    }

    #[test]
    fn test_scatter_factor_per_step() {
        let mut tile = TileInfo::new(2);
        tile.scatter_factors[0] = 8;
        tile.accounting_steps = 4;
        assert!((tile.scatter_factor() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_tile_factors() {
        let tile = TileInfo::new(1);
        assert_eq!(tile.total_accesses(), 0);
        assert!((tile.multicast_factor() - 1.0).abs() < 1e-9);
        assert!((tile.scatter_factor() - 1.0).abs() < 1e-9);
    }
}
