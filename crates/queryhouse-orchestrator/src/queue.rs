//! Query Queue - Deduplicating, Concurrency-Bounded Execution
//!
//! A `QueryQueue` serves one data source. Callers submit work with
//! [`QueryQueue::execute_in_queue`]; every concurrent call with the same
//! [`QueryKey`] shares a single execution and receives the same outcome.
//!
//! ## Architecture
//!
//! ```text
//!  execute_in_queue ──add_to_queue──►┌─────────────┐◄──claim/heartbeat── process_query
//!        │                           │ QueueDriver │                          ▲
//!        └──get_result_blocking─────►│ (shared)    │◄──stale scan───┐         │ spawn
//!                                    └─────────────┘                │         │
//!                                                             ┌─────┴─────────┴──┐
//!                                          wake / interval ──►│    reconciler    │
//!                                                             └──────────────────┘
//! ```
//!
//! - **Waiters** long-poll the driver for the outcome in cycles of
//!   `continue_wait_timeout`, refreshing the orphan deadline each cycle, and
//!   give up once `execution_timeout` has elapsed since submission.
//! - **The reconciler** is the worker pool. On every wake-up and every
//!   `reconcile_interval` it resolves stale entries, purges expired outcomes
//!   and spawns `process_query` for as many pending keys as there are free
//!   slots.
//! - **Workers** claim an entry with a lease, keep it alive with a
//!   [`LeaseHeartbeat`], run the handler under `execution_timeout`, and
//!   publish the outcome only if they still own the entry.
//!
//! All cross-process coordination goes through the driver; the in-process
//! state here only tracks which keys this process is running.

use crate::config::{QueueConfig, MAX_PRIORITY, MIN_PRIORITY};
use crate::error::{HandlerError, QueueError, Result};
use crate::handler::{HandlerRegistry, QueryHandler};
use crate::heartbeat::LeaseHeartbeat;
use crate::orchestrator::queue_driver_factory;
use crate::retry::retry_driver_call;
use queryhouse_core::time::now_ms;
use queryhouse_core::{CompiledQuery, HandlerKind, QueryKey};
use queryhouse_observability::metrics::{
    QUERY_DURATION, QUERY_ERRORS_TOTAL, QUEUE_ACTIVE, QUEUE_DEDUPLICATED_TOTAL,
    QUEUE_ENQUEUED_TOTAL, QUEUE_PENDING, QUEUE_RECONCILED_TOTAL, QUEUE_RESULT_HITS_TOTAL,
};
use queryhouse_queue::{
    EntryState, EntryUpdate, ExecutionOutcome, NewQueueEntry, QueueDriver, StaleQuery,
    StaleReason, StoredError, StoredErrorKind,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Per-call overrides for [`QueryQueue::execute_in_queue`].
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Correlation id carried into logs and `list_queries`
    pub request_id: Option<String>,

    /// How long this caller waits, measured from submission
    pub execution_timeout: Option<Duration>,

    /// Orphan window (and outcome retention) of a newly created entry; never
    /// shorter than two wait cycles
    pub orphaned_timeout: Option<Duration>,

    /// Skip the stored-outcome fast path and run the handler again
    pub force_build: bool,
}

/// Entry counts of a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueState {
    pub active: usize,
    pub pending: usize,
}

/// One entry as reported by [`QueryQueue::list_queries`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueuedQuery {
    pub key: QueryKey,
    pub handler: HandlerKind,
    pub status: EntryState,
    pub priority: i32,
    pub added_at: i64,
    pub activated_at: Option<i64>,
    pub started_at: Option<i64>,
    pub waiter_count: u32,
    pub attempts: u32,
    pub request_id: Option<String>,
}

/// Where a query currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum QueryStage {
    /// Claimed by a worker for `elapsed`
    Executing { elapsed: Duration },
    /// Waiting for a slot; `position` 0 is next
    Queued { position: usize },
}

struct RunningQuery {
    processing_id: String,
    token: CancellationToken,
    /// Tripped once the worker has published and let go of the entry
    finished: CancellationToken,
}

struct QueueInner {
    name: String,
    config: QueueConfig,
    driver: Arc<dyn QueueDriver>,
    handlers: HandlerRegistry,
    process_id: Uuid,
    processing_counter: AtomicU64,
    running: Mutex<HashMap<QueryKey, RunningQuery>>,
    wake: Notify,
    shutdown: CancellationToken,
    reconcile_lock: Mutex<()>,
}

/// Query queue of one data source.
///
/// Dropping the queue stops its reconciler; call [`shutdown`](Self::shutdown)
/// to also wait for running queries to hand their entries back.
pub struct QueryQueue {
    inner: Arc<QueueInner>,
    reconciler: Mutex<Option<JoinHandle<()>>>,
}

/// Builder for [`QueryQueue`].
pub struct QueryQueueBuilder {
    name: String,
    config: QueueConfig,
    driver: Option<Arc<dyn QueueDriver>>,
    handlers: HandlerRegistry,
}

impl QueryQueueBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: QueueConfig::default(),
            driver: None,
            handlers: HandlerRegistry::new(),
        }
    }

    pub fn config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    /// Use an existing driver instead of creating one from `config.driver`.
    pub fn driver(mut self, driver: Arc<dyn QueueDriver>) -> Self {
        self.driver = Some(driver);
        self
    }

    pub fn handler(mut self, kind: HandlerKind, handler: Arc<dyn QueryHandler>) -> Self {
        self.handlers = self.handlers.with(kind, handler);
        self
    }

    pub fn handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }

    /// Validate the configuration, open the driver and start the reconciler.
    pub async fn build(self) -> Result<QueryQueue> {
        self.config.validate()?;
        if self.handlers.is_empty() {
            return Err(QueueError::InvalidConfig(format!(
                "queue {} has no handlers",
                self.name
            )));
        }

        let driver = match self.driver {
            Some(driver) => driver,
            None => queue_driver_factory(&self.config, &self.name).await?,
        };

        queryhouse_observability::init_metrics();

        let inner = Arc::new(QueueInner {
            name: self.name,
            config: self.config,
            driver,
            handlers: self.handlers,
            process_id: Uuid::new_v4(),
            processing_counter: AtomicU64::new(0),
            running: Mutex::new(HashMap::new()),
            wake: Notify::new(),
            shutdown: CancellationToken::new(),
            reconcile_lock: Mutex::new(()),
        });

        info!(
            queue = %inner.name,
            process_id = %inner.process_id,
            concurrency = inner.config.concurrency,
            handlers = ?inner.handlers,
            "Query queue started"
        );

        let reconciler = tokio::spawn(Arc::clone(&inner).reconcile_loop());

        Ok(QueryQueue {
            inner,
            reconciler: Mutex::new(Some(reconciler)),
        })
    }
}

impl QueryQueue {
    pub fn builder(name: impl Into<String>) -> QueryQueueBuilder {
        QueryQueueBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    pub fn driver(&self) -> &Arc<dyn QueueDriver> {
        &self.inner.driver
    }

    /// Run `payload` through the handler for `kind`, or join the execution
    /// already queued under `key`.
    ///
    /// # Errors
    ///
    /// - `InvalidPriority` / `UnknownHandler` before anything is queued
    /// - `Handler`, `Cancelled`, `Orphaned`, `Timeout`: the stored outcome
    /// - `Timeout` when no outcome arrived within the execution timeout
    /// - `Driver` when the driver keeps failing after retries
    pub async fn execute_in_queue(
        &self,
        kind: HandlerKind,
        key: QueryKey,
        payload: CompiledQuery,
        priority: i32,
        options: ExecuteOptions,
    ) -> Result<Value> {
        let inner = &self.inner;

        if inner.shutdown.is_cancelled() {
            return Err(QueueError::ShuttingDown);
        }
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
            return Err(QueueError::InvalidPriority(priority));
        }
        if !inner.handlers.contains(kind) {
            return Err(QueueError::UnknownHandler(kind));
        }

        let execution_timeout = options
            .execution_timeout
            .unwrap_or(inner.config.execution_timeout);
        let orphaned_timeout = inner.config.orphaned_timeout_for(options.orphaned_timeout);
        let policy = &inner.config.driver_retry;
        let driver = inner.driver.as_ref();
        let key_ref = &key;

        if !options.force_build {
            let stored = retry_driver_call(policy, "get_result", move || {
                driver.get_result(key_ref)
            })
            .await?;
            if let Some(outcome) = stored {
                QUEUE_RESULT_HITS_TOTAL
                    .with_label_values(&[inner.name.as_str()])
                    .inc();
                debug!(queue = %inner.name, query_key = %key.short(), "Served stored outcome");
                return into_result(&key, outcome, execution_timeout);
            }
        }

        let submitted = Instant::now();
        let new_entry = NewQueueEntry {
            key: key.clone(),
            handler: kind,
            payload,
            priority,
            request_id: options.request_id.clone(),
            orphaned_timeout,
        };
        let response = retry_driver_call(policy, "add_to_queue", move || {
            driver.add_to_queue(new_entry.clone())
        })
        .await?;
        let mut waiter = WaiterGuard::new(Arc::clone(inner), key.clone());

        if response.added {
            QUEUE_ENQUEUED_TOTAL
                .with_label_values(&[inner.name.as_str(), kind.as_str()])
                .inc();
            info!(
                queue = %inner.name,
                query_key = %key.short(),
                handler = %kind,
                priority,
                queue_size = response.queue_size,
                request_id = ?options.request_id,
                "Query added to queue"
            );
        } else {
            QUEUE_DEDUPLICATED_TOTAL
                .with_label_values(&[inner.name.as_str()])
                .inc();
            debug!(
                queue = %inner.name,
                query_key = %key.short(),
                queue_size = response.queue_size,
                "Joined queued query"
            );
        }
        inner.wake.notify_one();

        let deadline = submitted + execution_timeout;
        let orphaned_timeout_ms = i64::try_from(orphaned_timeout.as_millis()).unwrap_or(i64::MAX);

        loop {
            if inner.shutdown.is_cancelled() {
                return Err(QueueError::ShuttingDown);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            let cycle = remaining.min(inner.config.continue_wait_timeout);
            let outcome = retry_driver_call(policy, "get_result_blocking", move || {
                driver.get_result_blocking(key_ref, cycle)
            })
            .await?;
            if let Some(outcome) = outcome {
                waiter.disarm();
                return into_result(&key, outcome, execution_timeout);
            }

            let orphaned_at = now_ms().saturating_add(orphaned_timeout_ms);
            retry_driver_call(policy, "refresh_orphan_deadline", move || {
                driver.refresh_orphan_deadline(key_ref, orphaned_at)
            })
            .await?;

            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(continue_wait_jitter().min(remaining)).await;
        }

        waiter.disarm();
        if let Err(e) = retry_driver_call(policy, "release_waiter", move || {
            driver.release_waiter(key_ref)
        })
        .await
        {
            warn!(queue = %inner.name, query_key = %key.short(), error = %e, "Failed to release waiter");
        }

        QUERY_ERRORS_TOTAL
            .with_label_values(&[inner.name.as_str(), kind.as_str(), "timeout"])
            .inc();
        warn!(
            queue = %inner.name,
            query_key = %key.short(),
            timeout_ms = execution_timeout.as_millis() as u64,
            "Gave up waiting for query"
        );

        Err(QueueError::Timeout {
            key: key.to_string(),
            timeout: execution_timeout,
        })
    }

    /// Cancel a queued or running query.
    ///
    /// Returns false when no entry exists for `key`. For a query running in
    /// this process, returns once the worker has run the cancel hook and
    /// delivered `Cancelled` to the waiters. A query running elsewhere is only
    /// flagged; its owner stops on the next heartbeat.
    pub async fn cancel_query(&self, key: &QueryKey) -> Result<bool> {
        let inner = &self.inner;
        let policy = &inner.config.driver_retry;
        let driver = inner.driver.as_ref();

        let Some(entry) =
            retry_driver_call(policy, "get_query_def", move || driver.get_query_def(key)).await?
        else {
            return Ok(false);
        };

        match entry.state {
            EntryState::Pending => {
                let outcome: ExecutionOutcome = Err(StoredError::new(
                    StoredErrorKind::Cancelled,
                    "cancelled before execution",
                ));
                let removed = retry_driver_call(policy, "remove_with_outcome", move || {
                    driver.remove_with_outcome(key, outcome.clone())
                })
                .await?;
                info!(queue = %inner.name, query_key = %key.short(), "Cancelled queued query");
                Ok(removed.is_some())
            }
            EntryState::Active => {
                let finished = {
                    let running = inner.running.lock().await;
                    running
                        .get(key)
                        .filter(|local| {
                            entry.processing_id.as_deref() == Some(local.processing_id.as_str())
                        })
                        .map(|local| {
                            local.token.cancel();
                            local.finished.clone()
                        })
                };
                if let Some(finished) = finished {
                    info!(queue = %inner.name, query_key = %key.short(), "Cancelling running query");
                    finished.cancelled().await;
                    return Ok(true);
                }

                let flagged = retry_driver_call(policy, "request_cancel", move || {
                    driver.request_cancel(key)
                })
                .await?;
                info!(
                    queue = %inner.name,
                    query_key = %key.short(),
                    processing_id = ?entry.processing_id,
                    "Requested cancellation from owning worker"
                );
                Ok(flagged.is_some())
            }
        }
    }

    pub async fn get_queue_state(&self) -> Result<QueueState> {
        let driver = self.inner.driver.as_ref();
        let (active, pending) = retry_driver_call(
            &self.inner.config.driver_retry,
            "get_active_and_to_process",
            move || driver.get_active_and_to_process(),
        )
        .await?;
        Ok(QueueState {
            active: active.len(),
            pending: pending.len(),
        })
    }

    pub async fn list_queries(&self) -> Result<Vec<QueuedQuery>> {
        let driver = self.inner.driver.as_ref();
        let entries = retry_driver_call(&self.inner.config.driver_retry, "list_entries", move || {
            driver.list_entries()
        })
        .await?;

        Ok(entries
            .into_iter()
            .map(|e| QueuedQuery {
                key: e.key,
                handler: e.handler,
                status: e.state,
                priority: e.priority,
                added_at: e.added_at,
                activated_at: e.activated_at,
                started_at: e.started_at,
                waiter_count: e.waiter_count,
                attempts: e.attempts,
                request_id: e.request_id,
            })
            .collect())
    }

    pub async fn get_query_stage(&self, key: &QueryKey) -> Result<Option<QueryStage>> {
        let policy = &self.inner.config.driver_retry;
        let driver = self.inner.driver.as_ref();

        let Some(entry) =
            retry_driver_call(policy, "get_query_def", move || driver.get_query_def(key)).await?
        else {
            return Ok(None);
        };

        match entry.state {
            EntryState::Active => {
                let since = entry.started_at.or(entry.activated_at).unwrap_or(entry.added_at);
                let elapsed = Duration::from_millis(now_ms().saturating_sub(since).max(0) as u64);
                Ok(Some(QueryStage::Executing { elapsed }))
            }
            EntryState::Pending => {
                let (_, pending) =
                    retry_driver_call(policy, "get_active_and_to_process", move || {
                        driver.get_active_and_to_process()
                    })
                    .await?;
                Ok(pending
                    .iter()
                    .position(|k| k == key)
                    .map(|position| QueryStage::Queued { position }))
            }
        }
    }

    /// Run one reconciliation pass now.
    pub async fn reconcile_queue(&self) -> Result<()> {
        self.inner.reconcile().await
    }

    /// Stop dispatching, hand running entries back and wait for workers.
    ///
    /// Waiters still blocked in `execute_in_queue` fail with `ShuttingDown`
    /// at their next poll cycle.
    pub async fn shutdown(&self) {
        info!(queue = %self.inner.name, "Shutting down query queue");
        self.inner.shutdown.cancel();

        if let Some(handle) = self.reconciler.lock().await.take() {
            if let Err(e) = handle.await {
                error!(queue = %self.inner.name, error = %e, "Reconciler task failed");
            }
        }

        let deadline = Instant::now() + self.inner.config.continue_wait_timeout;
        loop {
            let remaining = self.inner.running.lock().await.len();
            if remaining == 0 {
                break;
            }
            if Instant::now() >= deadline {
                warn!(
                    queue = %self.inner.name,
                    running = remaining,
                    "Workers still running after shutdown grace period"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        info!(queue = %self.inner.name, "Query queue stopped");
    }
}

impl Drop for QueryQueue {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

impl QueueInner {
    fn next_processing_id(&self) -> String {
        let n = self.processing_counter.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.process_id, n)
    }

    async fn reconcile_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.reconcile_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
                _ = self.wake.notified() => {}
            }

            if let Err(e) = self.reconcile().await {
                warn!(queue = %self.name, error = %e, "Reconciliation failed");
            }
        }

        debug!(queue = %self.name, "Reconciler stopped");
    }

    async fn reconcile(self: &Arc<Self>) -> Result<()> {
        let _guard = self.reconcile_lock.lock().await;
        let policy = &self.config.driver_retry;
        let driver = self.driver.as_ref();

        let stale = retry_driver_call(policy, "get_queries_to_cancel", move || {
            driver.get_queries_to_cancel()
        })
        .await?;
        for query in stale {
            if let Err(e) = self.resolve_stale(&query).await {
                warn!(
                    queue = %self.name,
                    query_key = %query.key.short(),
                    reason = ?query.reason,
                    error = %e,
                    "Failed to resolve stale query"
                );
            }
        }

        let purged = retry_driver_call(policy, "purge_expired_results", move || {
            driver.purge_expired_results()
        })
        .await?;
        if purged > 0 {
            debug!(queue = %self.name, purged, "Purged expired outcomes");
        }

        let (active, pending) = retry_driver_call(policy, "get_active_and_to_process", move || {
            driver.get_active_and_to_process()
        })
        .await?;
        QUEUE_ACTIVE
            .with_label_values(&[self.name.as_str()])
            .set(active.len() as i64);
        QUEUE_PENDING
            .with_label_values(&[self.name.as_str()])
            .set(pending.len() as i64);

        if self.shutdown.is_cancelled() {
            return Ok(());
        }

        let mut running = self.running.lock().await;
        let active_keys: HashSet<&QueryKey> = active.iter().collect();
        let spawned_unclaimed = running
            .keys()
            .filter(|k| !active_keys.contains(k))
            .count();
        let free_slots = self
            .config
            .concurrency
            .saturating_sub(active.len() + spawned_unclaimed);

        let to_start: Vec<QueryKey> = pending
            .into_iter()
            .filter(|k| !running.contains_key(k))
            .take(free_slots)
            .collect();

        for key in to_start {
            let processing_id = self.next_processing_id();
            let token = self.shutdown.child_token();
            let finished = CancellationToken::new();
            running.insert(
                key.clone(),
                RunningQuery {
                    processing_id: processing_id.clone(),
                    token: token.clone(),
                    finished: finished.clone(),
                },
            );
            tokio::spawn(Arc::clone(self).process_query(key, processing_id, token, finished));
        }

        Ok(())
    }

    async fn resolve_stale(&self, query: &StaleQuery) -> Result<()> {
        let policy = &self.config.driver_retry;
        let driver = self.driver.as_ref();
        let key = &query.key;

        match query.reason {
            StaleReason::Stalled => {
                let Some(entry) =
                    retry_driver_call(policy, "get_query_def", move || driver.get_query_def(key))
                        .await?
                else {
                    return Ok(());
                };
                let still_stalled = entry.state == EntryState::Active
                    && entry.lease_expires_at.map_or(true, |at| at < now_ms());
                if !still_stalled {
                    return Ok(());
                }

                if entry.attempts < self.config.max_requeue_attempts {
                    let version = entry.version;
                    let requeued = retry_driver_call(policy, "optimistic_query_update", move || {
                        driver.optimistic_query_update(key, version, EntryUpdate::Requeue)
                    })
                    .await?;
                    if requeued {
                        QUEUE_RECONCILED_TOTAL
                            .with_label_values(&[self.name.as_str(), "requeued"])
                            .inc();
                        warn!(
                            queue = %self.name,
                            query_key = %key.short(),
                            processing_id = ?entry.processing_id,
                            attempts = entry.attempts + 1,
                            "Worker stopped heartbeating, requeued query"
                        );
                    }
                } else {
                    let outcome: ExecutionOutcome = Err(StoredError::new(
                        StoredErrorKind::Orphaned,
                        format!(
                            "worker stopped heartbeating after {} attempts",
                            entry.attempts + 1
                        ),
                    ));
                    retry_driver_call(policy, "remove_with_outcome", move || {
                        driver.remove_with_outcome(key, outcome.clone())
                    })
                    .await?;
                    QUEUE_RECONCILED_TOTAL
                        .with_label_values(&[self.name.as_str(), "stalled"])
                        .inc();
                    error!(
                        queue = %self.name,
                        query_key = %key.short(),
                        attempts = entry.attempts + 1,
                        "Query stalled too many times, giving up"
                    );
                }
                self.cancel_local(key).await;
            }
            StaleReason::ExecutionTimeout => {
                let outcome: ExecutionOutcome = Err(StoredError::new(
                    StoredErrorKind::Timeout,
                    format!(
                        "execution exceeded {}ms",
                        self.config.execution_timeout.as_millis()
                    ),
                ));
                let removed = retry_driver_call(policy, "remove_with_outcome", move || {
                    driver.remove_with_outcome(key, outcome.clone())
                })
                .await?;
                let Some(entry) = removed else {
                    return Ok(());
                };

                QUEUE_RECONCILED_TOTAL
                    .with_label_values(&[self.name.as_str(), "timeout"])
                    .inc();
                warn!(
                    queue = %self.name,
                    query_key = %key.short(),
                    processing_id = ?entry.processing_id,
                    "Query exceeded execution timeout"
                );

                // A local worker runs the cancel hook itself once its token trips.
                if !self.cancel_local(key).await {
                    if let Some(handler) = self.handlers.get(entry.handler) {
                        self.run_cancel_hook(handler.as_ref(), key, &entry.payload)
                            .await;
                    }
                }
            }
            StaleReason::Orphaned => {
                let outcome: ExecutionOutcome = Err(StoredError::new(
                    StoredErrorKind::Orphaned,
                    "no caller is waiting for the query",
                ));
                let removed = retry_driver_call(policy, "remove_with_outcome", move || {
                    driver.remove_with_outcome(key, outcome.clone())
                })
                .await?;
                if removed.is_some() {
                    QUEUE_RECONCILED_TOTAL
                        .with_label_values(&[self.name.as_str(), "orphaned"])
                        .inc();
                    info!(queue = %self.name, query_key = %key.short(), "Removed orphaned query");
                }
            }
        }

        Ok(())
    }

    /// Trip the token of a query this process runs. Returns true if it was running here.
    async fn cancel_local(&self, key: &QueryKey) -> bool {
        match self.running.lock().await.get(key) {
            Some(local) => {
                local.token.cancel();
                true
            }
            None => false,
        }
    }

    async fn run_cancel_hook(&self, handler: &dyn QueryHandler, key: &QueryKey, payload: &CompiledQuery) {
        if let Err(e) = handler.cancel(payload).await {
            warn!(queue = %self.name, query_key = %key.short(), error = %e, "Cancel hook failed");
        }
    }

    async fn process_query(
        self: Arc<Self>,
        key: QueryKey,
        processing_id: String,
        token: CancellationToken,
        finished: CancellationToken,
    ) {
        let ran = match self.run_claimed(&key, &processing_id, &token).await {
            Ok(ran) => ran,
            Err(e) => {
                error!(
                    queue = %self.name,
                    query_key = %key.short(),
                    processing_id = %processing_id,
                    error = %e,
                    "Query processing failed"
                );
                true
            }
        };

        self.running.lock().await.remove(&key);
        finished.cancel();

        // A failed claim means no slot freed up; the next tick retries.
        if ran {
            self.wake.notify_one();
        }
    }

    /// Claim, execute and publish one entry. Returns false if the claim failed.
    async fn run_claimed(
        &self,
        key: &QueryKey,
        processing_id: &str,
        token: &CancellationToken,
    ) -> Result<bool> {
        let policy = &self.config.driver_retry;
        let driver = self.driver.as_ref();
        let lease_duration = self.config.heartbeat_timeout;

        let Some(lease) = retry_driver_call(policy, "retrieve_for_processing", move || {
            driver.retrieve_for_processing(key, processing_id, lease_duration)
        })
        .await?
        else {
            debug!(queue = %self.name, query_key = %key.short(), "Query already claimed or no free slot");
            return Ok(false);
        };
        let entry = lease.entry;

        let Some(handler) = self.handlers.get(entry.handler) else {
            let outcome: ExecutionOutcome = Err(StoredError::new(
                StoredErrorKind::Handler,
                format!("No handler registered for {}", entry.handler),
            ));
            self.publish(key, processing_id, outcome).await?;
            return Ok(true);
        };

        let heartbeat = LeaseHeartbeat::new(
            Arc::clone(&self.driver),
            key.clone(),
            processing_id.to_string(),
            self.config.heartbeat_interval,
            lease_duration,
            token.clone(),
        )
        .spawn();

        let started_at = now_ms();
        let version = lease.version;
        let marked = retry_driver_call(policy, "optimistic_query_update", move || {
            driver.optimistic_query_update(key, version, EntryUpdate::MarkStarted { started_at })
        })
        .await;
        match marked {
            Ok(true) => {}
            Ok(false) => debug!(query_key = %key.short(), "Entry changed before start was recorded"),
            Err(e) => warn!(query_key = %key.short(), error = %e, "Failed to record start"),
        }

        info!(
            queue = %self.name,
            query_key = %key.short(),
            processing_id = %processing_id,
            handler = %entry.handler,
            priority = entry.priority,
            attempts = entry.attempts,
            wait_ms = started_at.saturating_sub(entry.added_at),
            "Executing query"
        );

        let started = Instant::now();
        let execution_timeout = self.config.execution_timeout;
        let outcome: Option<ExecutionOutcome> = tokio::select! {
            biased;

            _ = token.cancelled() => {
                self.run_cancel_hook(handler.as_ref(), key, &entry.payload).await;
                if self.shutdown.is_cancelled() {
                    None
                } else {
                    Some(Err(StoredError::new(StoredErrorKind::Cancelled, "query was cancelled")))
                }
            }
            result = tokio::time::timeout(
                execution_timeout,
                handler.handle(&entry.payload, token.clone()),
            ) => match result {
                Ok(Ok(value)) => Some(Ok(value)),
                Ok(Err(HandlerError::Cancelled)) if self.shutdown.is_cancelled() => None,
                Ok(Err(HandlerError::Cancelled)) => Some(Err(StoredError::new(
                    StoredErrorKind::Cancelled,
                    "query was cancelled",
                ))),
                Ok(Err(e)) => Some(Err(StoredError::new(StoredErrorKind::Handler, e.to_string()))),
                Err(_) => {
                    self.run_cancel_hook(handler.as_ref(), key, &entry.payload).await;
                    Some(Err(StoredError::new(
                        StoredErrorKind::Timeout,
                        format!("execution exceeded {}ms", execution_timeout.as_millis()),
                    )))
                }
            },
        };

        heartbeat.stop().await;
        let elapsed = started.elapsed();

        let Some(outcome) = outcome else {
            retry_driver_call(policy, "free_processing_lock", move || {
                driver.free_processing_lock(key, processing_id)
            })
            .await?;
            info!(
                queue = %self.name,
                query_key = %key.short(),
                processing_id = %processing_id,
                "Handed query back during shutdown"
            );
            return Ok(true);
        };

        QUERY_DURATION
            .with_label_values(&[self.name.as_str(), entry.handler.as_str()])
            .observe(elapsed.as_secs_f64());
        match &outcome {
            Ok(_) => info!(
                queue = %self.name,
                query_key = %key.short(),
                duration_ms = elapsed.as_millis() as u64,
                "Query completed"
            ),
            Err(e) => {
                QUERY_ERRORS_TOTAL
                    .with_label_values(&[
                        self.name.as_str(),
                        entry.handler.as_str(),
                        error_type(e.kind),
                    ])
                    .inc();
                warn!(
                    queue = %self.name,
                    query_key = %key.short(),
                    duration_ms = elapsed.as_millis() as u64,
                    error = %e,
                    "Query failed"
                );
            }
        }

        self.publish(key, processing_id, outcome).await?;
        Ok(true)
    }

    async fn publish(&self, key: &QueryKey, processing_id: &str, outcome: ExecutionOutcome) -> Result<()> {
        let driver = self.driver.as_ref();
        let published = retry_driver_call(
            &self.config.driver_retry,
            "set_result_and_remove_query",
            move || driver.set_result_and_remove_query(key, processing_id, outcome.clone()),
        )
        .await?;

        if !published {
            warn!(
                queue = %self.name,
                query_key = %key.short(),
                processing_id = %processing_id,
                "Lease lost before outcome could be published"
            );
        }
        Ok(())
    }
}

/// Releases the waiter slot if the caller stops waiting without an outcome.
struct WaiterGuard {
    inner: Arc<QueueInner>,
    key: QueryKey,
    armed: bool,
}

impl WaiterGuard {
    fn new(inner: Arc<QueueInner>, key: QueryKey) -> Self {
        Self {
            inner,
            key,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let driver = Arc::clone(&self.inner.driver);
        let key = self.key.clone();
        runtime.spawn(async move {
            if let Err(e) = driver.release_waiter(&key).await {
                debug!(query_key = %key.short(), error = %e, "Failed to release abandoned waiter");
            }
        });
    }
}

fn into_result(key: &QueryKey, outcome: ExecutionOutcome, timeout: Duration) -> Result<Value> {
    outcome.map_err(|e| QueueError::from_stored(key.as_str(), e, timeout))
}

fn error_type(kind: StoredErrorKind) -> &'static str {
    match kind {
        StoredErrorKind::Handler => "handler",
        StoredErrorKind::Timeout => "timeout",
        StoredErrorKind::Cancelled => "cancelled",
        StoredErrorKind::Orphaned => "orphaned",
    }
}

/// Pause between long-poll cycles so waiters do not hit the driver in lockstep.
fn continue_wait_jitter() -> Duration {
    Duration::from_millis(rand::random::<u64>() % 20)
}
