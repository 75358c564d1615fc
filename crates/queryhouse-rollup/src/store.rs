//! Partition Store
//!
//! Keeps the built version of every partition table. Loading compares the
//! refresh key values and load range a partition would be built with against
//! the latest [`VersionEntry`] to decide whether it is stale.
//!
//! [`PartitionStore::build`] must make the new version visible atomically:
//! readers see either the previous version or the new one, never a
//! partially loaded table. A build that started before the current version's
//! build does not replace it.

use crate::error::{Result, RollupError};
use async_trait::async_trait;
use queryhouse_core::time::now_ms;
use queryhouse_core::{BuildTarget, CompiledQuery, Driver, Rows, TimeRange};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

/// One built version of a partition table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionEntry {
    pub table_name: String,
    pub partition_table_name: String,
    pub version_id: String,
    pub refresh_key_values: Vec<Value>,
    pub load_range: TimeRange,
    pub sealed: bool,
    /// Milliseconds since epoch
    pub built_at: i64,
    pub row_count: usize,
}

impl VersionEntry {
    pub fn new(target: &BuildTarget, row_count: usize) -> Self {
        Self {
            table_name: target.table_name.clone(),
            partition_table_name: target.partition_table_name.clone(),
            version_id: Uuid::new_v4().to_string(),
            refresh_key_values: target.refresh_key_values.clone(),
            load_range: target.load_range,
            sealed: target.sealed,
            built_at: now_ms(),
            row_count,
        }
    }
}

#[async_trait]
pub trait PartitionStore: Send + Sync {
    /// Latest built version of `partition_table_name`, if any.
    async fn latest_version(&self, partition_table_name: &str) -> Result<Option<VersionEntry>>;

    /// Run `load` and swap its rows in as the latest version of the target.
    async fn build(&self, target: &BuildTarget, load: &CompiledQuery) -> Result<VersionEntry>;
}

struct StoredPartition {
    version: VersionEntry,
    rows: Rows,
    /// Order in which the build producing this version started
    build_seq: u64,
}

/// Partition store keeping tables in process memory.
///
/// Load queries run through the data source's [`Driver`]; the returned rows
/// become the partition table.
pub struct MemoryPartitionStore {
    driver: Arc<dyn Driver>,
    tables: RwLock<HashMap<String, StoredPartition>>,
    build_seq: AtomicU64,
}

impl MemoryPartitionStore {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self {
            driver,
            tables: RwLock::new(HashMap::new()),
            build_seq: AtomicU64::new(0),
        }
    }

    /// Rows of the latest version of `partition_table_name`.
    pub async fn rows(&self, partition_table_name: &str) -> Option<Rows> {
        self.tables
            .read()
            .await
            .get(partition_table_name)
            .map(|t| t.rows.clone())
    }

    pub async fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl PartitionStore for MemoryPartitionStore {
    async fn latest_version(&self, partition_table_name: &str) -> Result<Option<VersionEntry>> {
        Ok(self
            .tables
            .read()
            .await
            .get(partition_table_name)
            .map(|t| t.version.clone()))
    }

    async fn build(&self, target: &BuildTarget, load: &CompiledQuery) -> Result<VersionEntry> {
        let start = Instant::now();
        let build_seq = self.build_seq.fetch_add(1, Ordering::SeqCst);
        let rows = self
            .driver
            .execute(&load.sql, &load.params)
            .await
            .map_err(|e| {
                RollupError::Store(format!(
                    "loading {} failed: {}",
                    target.partition_table_name, e
                ))
            })?;

        let version = VersionEntry::new(target, rows.len());
        {
            let mut tables = self.tables.write().await;
            if let Some(current) = tables.get(&target.partition_table_name) {
                if current.build_seq > build_seq {
                    debug!(
                        partition = %target.partition_table_name,
                        version_id = %current.version.version_id,
                        "Newer build already swapped in, discarding"
                    );
                    return Ok(current.version.clone());
                }
            }
            tables.insert(
                target.partition_table_name.clone(),
                StoredPartition {
                    version: version.clone(),
                    rows,
                    build_seq,
                },
            );
        }

        info!(
            partition = %target.partition_table_name,
            version_id = %version.version_id,
            rows = version.row_count,
            sealed = version.sealed,
            duration_ms = start.elapsed().as_millis() as u64,
            "Partition built"
        );

        Ok(version)
    }
}
