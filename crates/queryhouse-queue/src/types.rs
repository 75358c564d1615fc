//! Queue Driver Types
//!
//! Records stored and returned by [`QueueDriver`](crate::QueueDriver)
//! implementations. All timestamps are milliseconds since the Unix epoch.

use queryhouse_core::{CompiledQuery, HandlerKind, QueryKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Opaque owner of a processing lease.
pub type ProcessingId = String;

/// Lifecycle state of an entry still present in the queue.
///
/// Finished entries are removed; their outcome lives in the result table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryState {
    Pending,
    Active,
}

impl EntryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryState::Pending => "pending",
            EntryState::Active => "active",
        }
    }
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(EntryState::Pending),
            "active" => Ok(EntryState::Active),
            other => Err(format!("unknown entry state: {}", other)),
        }
    }
}

/// A queued unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Deduplication key, unique within the queue
    pub key: QueryKey,

    /// Handler the payload is dispatched to
    pub handler: HandlerKind,

    pub payload: CompiledQuery,

    /// Higher runs first, within [-10000, 10000]
    pub priority: i32,

    pub added_at: i64,

    /// Insertion order tie-breaker
    pub seq: u64,

    pub state: EntryState,

    /// Number of callers currently waiting on the outcome
    pub waiter_count: u32,

    /// Bumped on every mutation, compared by optimistic updates
    pub version: u64,

    /// Owner of the current lease
    pub processing_id: Option<ProcessingId>,

    pub lease_expires_at: Option<i64>,
    pub heartbeat_at: Option<i64>,
    pub activated_at: Option<i64>,
    pub started_at: Option<i64>,

    /// A pending entry past this deadline has no live waiter
    pub orphaned_at: i64,

    /// Orphan window of this entry; also how long its outcome is retained
    pub orphaned_timeout_ms: i64,

    /// Times the entry was requeued after its worker stalled
    pub attempts: u32,

    pub cancel_requested: bool,

    pub request_id: Option<String>,
}

/// Request to enqueue (or join) a unit of work.
#[derive(Debug, Clone)]
pub struct NewQueueEntry {
    pub key: QueryKey,
    pub handler: HandlerKind,
    pub payload: CompiledQuery,
    pub priority: i32,
    pub request_id: Option<String>,
    pub orphaned_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddToQueueResponse {
    /// True when this call created the entry, false when it joined one
    pub added: bool,

    /// Entries in the queue after the call
    pub queue_size: usize,

    /// Enqueue time of the (possibly pre-existing) entry
    pub added_at: i64,
}

/// Category of a stored failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoredErrorKind {
    Handler,
    Timeout,
    Cancelled,
    Orphaned,
}

/// Failure outcome shared with every waiter of a key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredError {
    pub kind: StoredErrorKind,
    pub message: String,
}

impl StoredError {
    pub fn new(kind: StoredErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for StoredError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// Final result of an entry.
pub type ExecutionOutcome = Result<Value, StoredError>;

/// Exclusive right to process an entry until `expires_at`.
#[derive(Debug, Clone)]
pub struct Lease {
    pub key: QueryKey,
    pub processing_id: ProcessingId,
    pub version: u64,
    pub expires_at: i64,
    pub entry: QueueEntry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatStatus {
    Renewed,
    /// Lease renewed, but someone asked for the query to be cancelled
    CancelRequested,
    /// The caller no longer owns the entry
    LeaseLost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StaleReason {
    /// Active entry whose lease expired without a heartbeat
    Stalled,
    /// Active entry running longer than the execution timeout
    ExecutionTimeout,
    /// Pending entry nobody waits for anymore
    Orphaned,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleQuery {
    pub key: QueryKey,
    pub version: u64,
    pub reason: StaleReason,
}

/// Mutation applied by [`optimistic_query_update`](crate::QueueDriver::optimistic_query_update).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryUpdate {
    /// Record when the handler started running
    MarkStarted { started_at: i64 },

    /// Return a stalled entry to pending and count the attempt
    Requeue,
}

/// Settings every driver is constructed with.
#[derive(Debug, Clone)]
pub struct QueueDriverOptions {
    /// Queue namespace (the data source name)
    pub queue: String,

    /// Maximum number of active entries
    pub concurrency: usize,

    /// Active entries older than this are reported as timed out
    pub execution_timeout: Duration,

    /// Result polling interval of backends without notifications
    pub poll_interval: Duration,
}

impl QueueDriverOptions {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            ..Default::default()
        }
    }
}

impl Default for QueueDriverOptions {
    fn default() -> Self {
        Self {
            queue: "default".to_string(),
            concurrency: 2,
            execution_timeout: Duration::from_secs(600),
            poll_interval: Duration::from_millis(50),
        }
    }
}

pub(crate) fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// Classify an entry at `now`, oldest reason first.
pub(crate) fn stale_reason(
    entry: &QueueEntry,
    now: i64,
    execution_timeout_ms: i64,
) -> Option<StaleReason> {
    match entry.state {
        EntryState::Active => {
            if entry.lease_expires_at.map_or(true, |at| at < now) {
                Some(StaleReason::Stalled)
            } else if entry
                .activated_at
                .map_or(false, |at| at.saturating_add(execution_timeout_ms) < now)
            {
                Some(StaleReason::ExecutionTimeout)
            } else {
                None
            }
        }
        EntryState::Pending => (entry.orphaned_at < now).then_some(StaleReason::Orphaned),
    }
}
