//! Limits applied while planning and serving rollups.

use serde::{Deserialize, Serialize};
use tracing::warn;

fn default_max_partitions() -> usize {
    crate::planner::DEFAULT_MAX_PARTITIONS
}

fn default_max_source_rows() -> usize {
    10_000
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollupConfig {
    /// Upper bound on partitions planned for one load
    #[serde(default = "default_max_partitions")]
    pub max_partitions: usize,

    /// Upper bound on rows the live tail of a lambda query may return
    #[serde(default = "default_max_source_rows")]
    pub max_source_rows: usize,
}

impl Default for RollupConfig {
    fn default() -> Self {
        Self {
            max_partitions: default_max_partitions(),
            max_source_rows: default_max_source_rows(),
        }
    }
}

impl RollupConfig {
    /// Defaults overridden by `QUERYHOUSE_MAX_PARTITIONS` and
    /// `QUERYHOUSE_MAX_SOURCE_ROWS`.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        let number = |name: &str| -> Option<usize> {
            let raw = lookup(name)?;
            match raw.trim().parse::<usize>() {
                Ok(v) if v > 0 => Some(v),
                _ => {
                    warn!(variable = name, value = %raw, "Ignoring invalid limit");
                    None
                }
            }
        };

        if let Some(v) = number("QUERYHOUSE_MAX_PARTITIONS") {
            config.max_partitions = v;
        }
        if let Some(v) = number("QUERYHOUSE_MAX_SOURCE_ROWS") {
            config.max_source_rows = v;
        }

        config
    }
}
