//! Configuration of a query queue.
//!
//! Durations are (de)serialized as integer milliseconds. [`QueueConfig::from_env`]
//! reads `QUERYHOUSE_*` variables on top of the defaults.

use crate::error::{QueueError, Result};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Lowest accepted priority.
pub const MIN_PRIORITY: i32 = -10_000;

/// Highest accepted priority.
pub const MAX_PRIORITY: i32 = 10_000;

/// `Duration` <-> milliseconds for serde.
pub mod serde_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Backend a queue stores its entries in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum QueueDriverKind {
    /// Process-local; only coordinates queues in this process
    #[default]
    Memory,
    /// SQLite database file shared by every process that opens it
    Sqlite { path: PathBuf },
}

impl std::fmt::Display for QueueDriverKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueDriverKind::Memory => write!(f, "memory"),
            QueueDriverKind::Sqlite { path } => write!(f, "sqlite:{}", path.display()),
        }
    }
}

fn default_concurrency() -> usize {
    2
}

fn default_continue_wait_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_execution_timeout() -> Duration {
    Duration::from_secs(600)
}

fn default_orphaned_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_heartbeat_timeout() -> Duration {
    default_heartbeat_interval() * 4
}

fn default_reconcile_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_max_requeue_attempts() -> u32 {
    3
}

fn default_result_poll_interval() -> Duration {
    Duration::from_millis(100)
}

/// Settings of one query queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum simultaneously active entries (across all processes)
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Length of one waiter long-poll cycle
    #[serde(default = "default_continue_wait_timeout", with = "serde_millis")]
    pub continue_wait_timeout: Duration,

    /// Hard ceiling on a query, measured from submission for callers and
    /// from activation for workers
    #[serde(default = "default_execution_timeout", with = "serde_millis")]
    pub execution_timeout: Duration,

    /// A pending entry without a live waiter for this long is dropped;
    /// outcomes are retained for the same duration
    #[serde(default = "default_orphaned_timeout", with = "serde_millis")]
    pub orphaned_timeout: Duration,

    #[serde(default = "default_heartbeat_interval", with = "serde_millis")]
    pub heartbeat_interval: Duration,

    /// Lease duration; an active entry without a heartbeat for this long is stalled
    #[serde(default = "default_heartbeat_timeout", with = "serde_millis")]
    pub heartbeat_timeout: Duration,

    #[serde(default = "default_reconcile_interval", with = "serde_millis")]
    pub reconcile_interval: Duration,

    /// Stalled entries are requeued this many times before failing as orphaned
    #[serde(default = "default_max_requeue_attempts")]
    pub max_requeue_attempts: u32,

    /// Polling interval of backends without result notifications
    #[serde(default = "default_result_poll_interval", with = "serde_millis")]
    pub result_poll_interval: Duration,

    #[serde(default)]
    pub driver_retry: RetryPolicy,

    #[serde(default)]
    pub driver: QueueDriverKind,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            continue_wait_timeout: default_continue_wait_timeout(),
            execution_timeout: default_execution_timeout(),
            orphaned_timeout: default_orphaned_timeout(),
            heartbeat_interval: default_heartbeat_interval(),
            heartbeat_timeout: default_heartbeat_timeout(),
            reconcile_interval: default_reconcile_interval(),
            max_requeue_attempts: default_max_requeue_attempts(),
            result_poll_interval: default_result_poll_interval(),
            driver_retry: RetryPolicy::default(),
            driver: QueueDriverKind::default(),
        }
    }
}

impl QueueConfig {
    /// Defaults overridden by `QUERYHOUSE_*` environment variables.
    ///
    /// | Variable | Field |
    /// |----------|-------|
    /// | `QUERYHOUSE_QUEUE_CONCURRENCY` | `concurrency` |
    /// | `QUERYHOUSE_CONTINUE_WAIT_TIMEOUT_MS` | `continue_wait_timeout` |
    /// | `QUERYHOUSE_EXECUTION_TIMEOUT_MS` | `execution_timeout` |
    /// | `QUERYHOUSE_ORPHANED_TIMEOUT_MS` | `orphaned_timeout` |
    /// | `QUERYHOUSE_HEARTBEAT_INTERVAL_MS` | `heartbeat_interval` (timeout follows at 4x) |
    /// | `QUERYHOUSE_RECONCILE_INTERVAL_MS` | `reconcile_interval` |
    /// | `QUERYHOUSE_MAX_REQUEUE_ATTEMPTS` | `max_requeue_attempts` |
    /// | `QUERYHOUSE_QUEUE_DRIVER` | `memory` or `sqlite` |
    /// | `QUERYHOUSE_QUEUE_DB` | SQLite path (default `./data/queue.db`) |
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        let number = |name: &str| -> Option<u64> {
            let raw = lookup(name)?;
            match raw.trim().parse::<u64>() {
                Ok(v) => Some(v),
                Err(_) => {
                    warn!(variable = name, value = %raw, "Ignoring non-numeric setting");
                    None
                }
            }
        };

        if let Some(v) = number("QUERYHOUSE_QUEUE_CONCURRENCY") {
            config.concurrency = v as usize;
        }
        if let Some(v) = number("QUERYHOUSE_CONTINUE_WAIT_TIMEOUT_MS") {
            config.continue_wait_timeout = Duration::from_millis(v);
        }
        if let Some(v) = number("QUERYHOUSE_EXECUTION_TIMEOUT_MS") {
            config.execution_timeout = Duration::from_millis(v);
        }
        if let Some(v) = number("QUERYHOUSE_ORPHANED_TIMEOUT_MS") {
            config.orphaned_timeout = Duration::from_millis(v);
        }
        if let Some(v) = number("QUERYHOUSE_HEARTBEAT_INTERVAL_MS") {
            config.heartbeat_interval = Duration::from_millis(v);
            config.heartbeat_timeout = config.heartbeat_interval * 4;
        }
        if let Some(v) = number("QUERYHOUSE_RECONCILE_INTERVAL_MS") {
            config.reconcile_interval = Duration::from_millis(v);
        }
        if let Some(v) = number("QUERYHOUSE_MAX_REQUEUE_ATTEMPTS") {
            config.max_requeue_attempts = v as u32;
        }

        match lookup("QUERYHOUSE_QUEUE_DRIVER").as_deref() {
            None | Some("memory") => {}
            Some("sqlite") => {
                let path = lookup("QUERYHOUSE_QUEUE_DB")
                    .unwrap_or_else(|| "./data/queue.db".to_string());
                config.driver = QueueDriverKind::Sqlite { path: path.into() };
            }
            Some(other) => {
                warn!(driver = other, "Unknown queue driver, using memory");
            }
        }

        config
    }

    /// Reject settings the queue cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(QueueError::InvalidConfig(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if self.continue_wait_timeout.is_zero() {
            return Err(QueueError::InvalidConfig(
                "continue_wait_timeout must be positive".to_string(),
            ));
        }
        if self.heartbeat_interval.is_zero() || self.reconcile_interval.is_zero() {
            return Err(QueueError::InvalidConfig(
                "heartbeat_interval and reconcile_interval must be positive".to_string(),
            ));
        }
        if self.orphaned_timeout < self.min_orphaned_timeout() {
            return Err(QueueError::InvalidConfig(format!(
                "orphaned_timeout ({:?}) must be at least twice continue_wait_timeout ({:?})",
                self.orphaned_timeout, self.continue_wait_timeout
            )));
        }
        if self.heartbeat_timeout <= self.heartbeat_interval {
            return Err(QueueError::InvalidConfig(format!(
                "heartbeat_timeout ({:?}) must exceed heartbeat_interval ({:?})",
                self.heartbeat_timeout, self.heartbeat_interval
            )));
        }
        Ok(())
    }

    /// Shortest orphan timeout a waiter can keep alive: its deadline is only
    /// refreshed between wait cycles.
    pub fn min_orphaned_timeout(&self) -> Duration {
        self.continue_wait_timeout.saturating_mul(2)
    }

    /// Orphan timeout of one call, raised to [`min_orphaned_timeout`](Self::min_orphaned_timeout).
    pub fn orphaned_timeout_for(&self, requested: Option<Duration>) -> Duration {
        requested
            .unwrap_or(self.orphaned_timeout)
            .max(self.min_orphaned_timeout())
    }
}
