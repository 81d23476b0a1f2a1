use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::analysis::tiling::{BodyInfo, TileInfo};

pub const CHECKPOINT_VERSION: u32 = 1;

/// Persisted analysis results, for checkpointing long-running mapping
/// searches. The schema is explicitly versioned: readers dispatch on the
/// `version` tag and migrate older payloads forward; unknown extra fields
/// from newer writers are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    /// [data space][storage level, innermost first]
    pub working_sets: Vec<Vec<TileInfo>>,
    pub body: BodyInfo,
    #[serde(default)]
    pub label: Option<String>,
}

/// Version 0 stored only the working-set capacities.
#[derive(Debug, Deserialize)]
struct CheckpointV0 {
    working_set_sizes: Vec<Vec<u64>>,
}

fn migrate_v0(old: CheckpointV0) -> Checkpoint {
    Checkpoint {
        version: CHECKPOINT_VERSION,
        working_sets: old
            .working_set_sizes
            .into_iter()
            .map(|row| {
                row.into_iter()
                    .map(|size| {
                        let mut tile = TileInfo::new(1);
                        tile.size = size;
                        tile
                    })
                    .collect()
            })
            .collect(),
        body: BodyInfo::new(),
        label: None,
    }
}

impl Checkpoint {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("serializing checkpoint")
    }

    pub fn from_json(text: &str) -> Result<Checkpoint> {
        let value: serde_json::Value =
            serde_json::from_str(text).context("parsing checkpoint")?;
        // a missing tag means a pre-tagging v0 writer
        let version = value.get("version").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
        match version {
            0 => {
                let old: CheckpointV0 =
                    serde_json::from_value(value).context("reading v0 checkpoint")?;
                Ok(migrate_v0(old))
            }
            1 => serde_json::from_value(value).context("reading v1 checkpoint"),
            v => bail!("unsupported checkpoint version {}", v),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_json()?)
            .with_context(|| format!("writing checkpoint to {}", path.display()))
    }

    pub fn load(path: &Path) -> Result<Checkpoint> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading checkpoint from {}", path.display()))?;
        Checkpoint::from_json(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Checkpoint {
        let mut tile = TileInfo::new(2);
        tile.size = 4;
        tile.accesses = vec![0, 4];
        tile.scatter_factors = vec![0, 4];
        tile.cumulative_hops = vec![0, 8];
        tile.link_transfers = 4;
        tile.accounting_steps = 4;
        Checkpoint {
            version: CHECKPOINT_VERSION,
            working_sets: vec![vec![tile]],
            body: BodyInfo {
                ops: 8,
                ops_per_element: 4,
            },
            label: Some(String::from("unit")),
        }
    }

    #[test]
    fn test_roundtrip() -> Result<()> {
        let ck = sample();
        let loaded = Checkpoint::from_json(&ck.to_json()?)?;
        assert_eq!(loaded, ck);
        Ok(())
    }

    #[test]
    fn test_v0_payload_migrates() -> Result<()> {
        let text = r#"{"version": 0, "working_set_sizes": [[1, 4]]}"#;
        let loaded = Checkpoint::from_json(text)?;
        assert_eq!(loaded.version, CHECKPOINT_VERSION);
        assert_eq!(loaded.working_sets[0][0].size, 1);
        assert_eq!(loaded.working_sets[0][1].size, 4);
        assert_eq!(loaded.working_sets[0][1].total_accesses(), 0);
        Ok(())
    }

    #[test]
    fn test_untagged_payload_reads_as_v0() -> Result<()> {
        let text = r#"{"working_set_sizes": [[2]]}"#;
        let loaded = Checkpoint::from_json(text)?;
        assert_eq!(loaded.working_sets[0][0].size, 2);
        Ok(())
    }

    #[test]
    fn test_unknown_fields_are_ignored() -> Result<()> {
        let mut text = sample().to_json()?;
        text = text.replacen(
            "\"version\": 1,",
            "\"version\": 1, \"future_field\": {\"nested\": true},",
            1,
        );
        let loaded = Checkpoint::from_json(&text)?;
        assert_eq!(loaded, sample());
        Ok(())
    }

    #[test]
    fn test_future_version_rejected() {
        let text = r#"{"version": 99}"#;
        assert!(Checkpoint::from_json(text).is_err());
    }
}
