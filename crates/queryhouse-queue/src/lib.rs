//! QueryHouse Queue Driver
//!
//! This crate implements the storage layer of the query queue: the place where
//! queued queries, their leases and their outcomes live.
//!
//! ## Purpose
//!
//! The queue itself (admission, dispatch, waiting) lives in
//! `queryhouse-orchestrator`. Everything that must be consistent between
//! concurrent callers is delegated to a [`QueueDriver`]:
//! - **Entries**: one per query key, pending or active
//! - **Leases**: which worker currently processes an active entry
//! - **Outcomes**: the stored result every waiter of a key receives
//!
//! ## Backends
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐
//! │ QueryQueue A │   │ QueryQueue B │   (same or different processes)
//! └──────┬───────┘   └──────┬───────┘
//!        │                  │
//!        ▼                  ▼
//! ┌─────────────────────────────────┐
//! │           QueueDriver           │ ◄── You are here
//! │  MemoryQueueDriver (one process)│
//! │  SqliteQueueDriver (shared file)│
//! └─────────────────────────────────┘
//! ```
//!
//! - [`MemoryQueueDriver`]: in-process state behind a mutex, result fan-out
//!   through `tokio::sync::watch` channels. Clones share state.
//! - [`SqliteQueueDriver`]: SQLite database file opened by every process,
//!   atomic single-statement claims, compare-and-swap on a `version` column.
//!
//! ## Usage Example
//!
//! ```ignore
//! use queryhouse_queue::{MemoryQueueDriver, QueueDriver, QueueDriverOptions};
//!
//! let driver = MemoryQueueDriver::new(QueueDriverOptions::new("warehouse"));
//! let response = driver.add_to_queue(entry).await?;
//!
//! if let Some(lease) = driver
//!     .retrieve_for_processing(&key, &processing_id, Duration::from_secs(120))
//!     .await?
//! {
//!     let value = run(lease.entry.payload).await;
//!     driver.set_result_and_remove_query(&key, &processing_id, Ok(value)).await?;
//! }
//! ```
//!
//! ## Guarantees
//!
//! - Every operation is atomic with respect to concurrent callers
//! - At most `concurrency` entries of a queue are active at any time
//! - An outcome is only published by the current lease owner, or by a forced
//!   removal (cancellation, reconciliation)
//! - Drivers never retry; failures carry
//!   [`is_retryable`](QueueDriverError::is_retryable) for the caller

pub mod error;
pub mod memory;
pub mod sqlite;
pub mod types;

pub use error::{QueueDriverError, Result};
pub use memory::MemoryQueueDriver;
pub use sqlite::SqliteQueueDriver;
pub use types::*;

use async_trait::async_trait;
use queryhouse_core::QueryKey;
use std::time::Duration;

/// Storage and coordination backend of one queue.
#[async_trait]
pub trait QueueDriver: Send + Sync {
    /// Namespace this driver operates on.
    fn queue_name(&self) -> &str;

    /// Insert an entry, or join the existing entry with the same key.
    ///
    /// Joining increments the waiter count and extends the orphan deadline.
    /// A newly created entry discards outcomes stored before it.
    async fn add_to_queue(&self, entry: NewQueueEntry) -> Result<AddToQueueResponse>;

    /// Stored outcome of a key, if it has not expired.
    async fn get_result(&self, key: &QueryKey) -> Result<Option<ExecutionOutcome>>;

    /// Move a pending entry to active if a processing slot is free.
    ///
    /// Returns `None` when the entry is missing, already active, or the queue
    /// is at its concurrency limit.
    async fn retrieve_for_processing(
        &self,
        key: &QueryKey,
        processing_id: &str,
        lease_duration: Duration,
    ) -> Result<Option<Lease>>;

    /// Extend the lease of an active entry owned by `processing_id`.
    async fn update_heartbeat(
        &self,
        key: &QueryKey,
        processing_id: &str,
        lease_duration: Duration,
    ) -> Result<HeartbeatStatus>;

    /// Give a claimed entry back; it becomes pending again.
    async fn free_processing_lock(&self, key: &QueryKey, processing_id: &str) -> Result<()>;

    /// Store the outcome and remove the entry, iff `processing_id` still owns it.
    ///
    /// All waiters of the key are woken. Returns false when the lease was lost.
    async fn set_result_and_remove_query(
        &self,
        key: &QueryKey,
        processing_id: &str,
        outcome: ExecutionOutcome,
    ) -> Result<bool>;

    /// Remove an entry regardless of its owner and store `outcome` for its waiters.
    async fn remove_with_outcome(
        &self,
        key: &QueryKey,
        outcome: ExecutionOutcome,
    ) -> Result<Option<QueueEntry>>;

    /// Wait up to `timeout` for the outcome of a key.
    async fn get_result_blocking(
        &self,
        key: &QueryKey,
        timeout: Duration,
    ) -> Result<Option<ExecutionOutcome>>;

    /// Active keys by activation time, and pending keys in dispatch order.
    ///
    /// Dispatch order is priority descending, then `added_at`, then `seq`.
    async fn get_active_and_to_process(&self) -> Result<(Vec<QueryKey>, Vec<QueryKey>)>;

    /// Entries that need reconciliation.
    async fn get_queries_to_cancel(&self) -> Result<Vec<StaleQuery>>;

    /// Apply `update` iff the entry's version still equals `expected_version`.
    async fn optimistic_query_update(
        &self,
        key: &QueryKey,
        expected_version: u64,
        update: EntryUpdate,
    ) -> Result<bool>;

    /// Flag an active entry for cancellation. Returns the entry if it exists.
    async fn request_cancel(&self, key: &QueryKey) -> Result<Option<QueueEntry>>;

    /// A waiter gave up. A pending entry without waiters becomes orphan-eligible.
    async fn release_waiter(&self, key: &QueryKey) -> Result<()>;

    /// Push the orphan deadline of an entry out to `orphaned_at` (never earlier).
    async fn refresh_orphan_deadline(&self, key: &QueryKey, orphaned_at: i64) -> Result<()>;

    async fn get_query_def(&self, key: &QueryKey) -> Result<Option<QueueEntry>>;

    async fn list_entries(&self) -> Result<Vec<QueueEntry>>;

    /// Drop outcomes past their retention. Returns how many were removed.
    async fn purge_expired_results(&self) -> Result<u64>;
}
