//! Query Identity and Payload
//!
//! This module defines what travels through the queue:
//!
//! - **QueryKey**: deterministic fingerprint of a unit of work. Two requests
//!   with the same key are the same logical query and share one execution.
//! - **CompiledQuery**: the opaque payload produced by the compiler (SQL text,
//!   parameters and optional rollup metadata).
//! - **HandlerKind**: which registered handler processes the payload.
//!
//! ## Fingerprints
//!
//! A key is the lowercase hex SHA-256 of the JSON serialization of the key
//! material. Struct fields serialize in declaration order and JSON objects
//! are backed by a sorted map, so the same material always yields the same key
//! regardless of which process computes it.
//!
//! ```ignore
//! let query = CompiledQuery::new("warehouse", "SELECT 1", vec![]);
//! let key = query.query_key()?;
//! assert_eq!(key, query.query_key()?);
//! ```

use crate::error::Result;
use crate::rollup::{RollupDefinition, TimeRange};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Deterministic fingerprint of a compiled query plus its execution parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryKey(String);

impl QueryKey {
    /// Fingerprint arbitrary serializable key material.
    pub fn of<T: Serialize + ?Sized>(material: &T) -> Result<Self> {
        let bytes = serde_json::to_vec(material)?;
        Ok(Self(hex::encode(Sha256::digest(&bytes))))
    }

    /// Wrap an already computed hash (e.g. read back from the shared store).
    pub fn from_hash(hash: impl Into<String>) -> Self {
        Self(hash.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for log lines.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Handler a queued payload is dispatched to.
///
/// The set of kinds is closed; each queue maps every kind it accepts to a
/// typed handler when it is constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerKind {
    /// Plain query against the data source.
    Query,
    /// Build (or rebuild) one rollup partition.
    PreAggregationBuild,
    /// Evaluate a refresh key SQL.
    RefreshKey,
    /// Discover the build range of a rollup.
    BuildRange,
}

impl HandlerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandlerKind::Query => "query",
            HandlerKind::PreAggregationBuild => "pre_aggregation_build",
            HandlerKind::RefreshKey => "refresh_key",
            HandlerKind::BuildRange => "build_range",
        }
    }
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HandlerKind {
    type Err = crate::error::CoreError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "query" => Ok(HandlerKind::Query),
            "pre_aggregation_build" => Ok(HandlerKind::PreAggregationBuild),
            "refresh_key" => Ok(HandlerKind::RefreshKey),
            "build_range" => Ok(HandlerKind::BuildRange),
            other => Err(crate::error::CoreError::UnknownHandler(other.to_string())),
        }
    }
}

/// Partition a build payload targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildTarget {
    /// Base rollup table name
    pub table_name: String,

    /// Name of the partition table (base name plus date suffix)
    pub partition_table_name: String,

    /// Local-time range loaded into the partition
    pub load_range: TimeRange,

    /// Whether the load range reaches the end of the calendar bucket
    pub sealed: bool,

    /// Refresh key values the build was computed against
    pub refresh_key_values: Vec<Value>,
}

/// Compiler output consumed by the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledQuery {
    /// Data source (backend) the SQL runs against
    pub data_source: String,

    /// Dialect-specific SQL text
    pub sql: String,

    /// Positional parameters
    #[serde(default)]
    pub params: Vec<Value>,

    /// SQL whose result changes when the underlying data changes
    #[serde(default)]
    pub refresh_key_sql: Option<String>,

    /// Rollup this query belongs to, if any
    #[serde(default)]
    pub rollup_meta: Option<Box<RollupDefinition>>,

    /// Set for partition build payloads
    #[serde(default)]
    pub build_target: Option<BuildTarget>,
}

impl CompiledQuery {
    pub fn new(data_source: impl Into<String>, sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            data_source: data_source.into(),
            sql: sql.into(),
            params,
            refresh_key_sql: None,
            rollup_meta: None,
            build_target: None,
        }
    }

    /// Key of a plain query: data source, SQL text and parameters.
    pub fn query_key(&self) -> Result<QueryKey> {
        QueryKey::of(&(&self.data_source, &self.sql, &self.params))
    }
}
