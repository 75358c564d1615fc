//! In-Process Queue Driver
//!
//! Keeps entries and outcomes in hash maps behind a `tokio::sync::Mutex`.
//! Every operation takes the lock once and never awaits while holding it, so
//! each call is atomic with respect to the others.
//!
//! Waiters blocked in `get_result_blocking` subscribe to a per-key
//! `watch` channel; publishing an outcome wakes all of them at once.
//!
//! Cloning a `MemoryQueueDriver` shares its state, which lets several
//! `QueryQueue`s in one process coordinate exactly like processes sharing a
//! SQLite file.

use crate::error::Result;
use crate::types::*;
use crate::QueueDriver;
use async_trait::async_trait;
use queryhouse_core::time::now_ms;
use queryhouse_core::QueryKey;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};

struct StoredResult {
    outcome: ExecutionOutcome,
    expires_at: i64,
}

#[derive(Default)]
struct MemoryState {
    entries: HashMap<QueryKey, QueueEntry>,
    results: HashMap<QueryKey, StoredResult>,
    watchers: HashMap<QueryKey, watch::Sender<Option<ExecutionOutcome>>>,
    next_seq: u64,
}

impl MemoryState {
    fn active_count(&self) -> usize {
        self.entries
            .values()
            .filter(|e| e.state == EntryState::Active)
            .count()
    }

    fn publish(&mut self, key: &QueryKey, outcome: ExecutionOutcome, retention_ms: i64, now: i64) {
        if let Some(sender) = self.watchers.remove(key) {
            sender.send_replace(Some(outcome.clone()));
        }
        self.results.insert(
            key.clone(),
            StoredResult {
                outcome,
                expires_at: now.saturating_add(retention_ms),
            },
        );
    }

    fn live_result(&self, key: &QueryKey, now: i64) -> Option<ExecutionOutcome> {
        self.results
            .get(key)
            .filter(|r| r.expires_at >= now)
            .map(|r| r.outcome.clone())
    }
}

/// In-process [`QueueDriver`].
#[derive(Clone)]
pub struct MemoryQueueDriver {
    options: Arc<QueueDriverOptions>,
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryQueueDriver {
    pub fn new(options: QueueDriverOptions) -> Self {
        Self {
            options: Arc::new(options),
            state: Arc::new(Mutex::new(MemoryState::default())),
        }
    }

    pub fn options(&self) -> &QueueDriverOptions {
        &self.options
    }
}

#[async_trait]
impl QueueDriver for MemoryQueueDriver {
    fn queue_name(&self) -> &str {
        &self.options.queue
    }

    async fn add_to_queue(&self, new: NewQueueEntry) -> Result<AddToQueueResponse> {
        let now = now_ms();
        let orphaned_timeout_ms = duration_ms(new.orphaned_timeout);
        let mut state = self.state.lock().await;

        if let Some(entry) = state.entries.get_mut(&new.key) {
            entry.waiter_count += 1;
            entry.orphaned_at = entry.orphaned_at.max(now.saturating_add(orphaned_timeout_ms));
            entry.version += 1;
            let added_at = entry.added_at;
            return Ok(AddToQueueResponse {
                added: false,
                queue_size: state.entries.len(),
                added_at,
            });
        }

        state.next_seq += 1;
        let seq = state.next_seq;
        state.results.remove(&new.key);
        state.entries.insert(
            new.key.clone(),
            QueueEntry {
                key: new.key,
                handler: new.handler,
                payload: new.payload,
                priority: new.priority,
                added_at: now,
                seq,
                state: EntryState::Pending,
                waiter_count: 1,
                version: 1,
                processing_id: None,
                lease_expires_at: None,
                heartbeat_at: None,
                activated_at: None,
                started_at: None,
                orphaned_at: now.saturating_add(orphaned_timeout_ms),
                orphaned_timeout_ms,
                attempts: 0,
                cancel_requested: false,
                request_id: new.request_id,
            },
        );

        Ok(AddToQueueResponse {
            added: true,
            queue_size: state.entries.len(),
            added_at: now,
        })
    }

    async fn get_result(&self, key: &QueryKey) -> Result<Option<ExecutionOutcome>> {
        let state = self.state.lock().await;
        Ok(state.live_result(key, now_ms()))
    }

    async fn retrieve_for_processing(
        &self,
        key: &QueryKey,
        processing_id: &str,
        lease_duration: Duration,
    ) -> Result<Option<Lease>> {
        let now = now_ms();
        let mut state = self.state.lock().await;

        if state.active_count() >= self.options.concurrency {
            return Ok(None);
        }
        let Some(entry) = state.entries.get_mut(key) else {
            return Ok(None);
        };
        if entry.state != EntryState::Pending {
            return Ok(None);
        }

        let expires_at = now.saturating_add(duration_ms(lease_duration));
        entry.state = EntryState::Active;
        entry.processing_id = Some(processing_id.to_string());
        entry.lease_expires_at = Some(expires_at);
        entry.heartbeat_at = Some(now);
        entry.activated_at = Some(now);
        entry.started_at = None;
        entry.cancel_requested = false;
        entry.version += 1;

        Ok(Some(Lease {
            key: key.clone(),
            processing_id: processing_id.to_string(),
            version: entry.version,
            expires_at,
            entry: entry.clone(),
        }))
    }

    async fn update_heartbeat(
        &self,
        key: &QueryKey,
        processing_id: &str,
        lease_duration: Duration,
    ) -> Result<HeartbeatStatus> {
        let now = now_ms();
        let mut state = self.state.lock().await;

        match state.entries.get_mut(key) {
            Some(entry)
                if entry.state == EntryState::Active
                    && entry.processing_id.as_deref() == Some(processing_id) =>
            {
                entry.heartbeat_at = Some(now);
                entry.lease_expires_at = Some(now.saturating_add(duration_ms(lease_duration)));
                entry.version += 1;
                if entry.cancel_requested {
                    Ok(HeartbeatStatus::CancelRequested)
                } else {
                    Ok(HeartbeatStatus::Renewed)
                }
            }
            _ => Ok(HeartbeatStatus::LeaseLost),
        }
    }

    async fn free_processing_lock(&self, key: &QueryKey, processing_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;

        if let Some(entry) = state.entries.get_mut(key) {
            if entry.processing_id.as_deref() == Some(processing_id) {
                entry.state = EntryState::Pending;
                entry.processing_id = None;
                entry.lease_expires_at = None;
                entry.heartbeat_at = None;
                entry.activated_at = None;
                entry.started_at = None;
                entry.version += 1;
            }
        }
        Ok(())
    }

    async fn set_result_and_remove_query(
        &self,
        key: &QueryKey,
        processing_id: &str,
        outcome: ExecutionOutcome,
    ) -> Result<bool> {
        let now = now_ms();
        let mut state = self.state.lock().await;

        let owned = state.entries.get(key).map_or(false, |e| {
            e.state == EntryState::Active && e.processing_id.as_deref() == Some(processing_id)
        });
        if !owned {
            return Ok(false);
        }

        if let Some(entry) = state.entries.remove(key) {
            state.publish(key, outcome, entry.orphaned_timeout_ms, now);
        }
        Ok(true)
    }

    async fn remove_with_outcome(
        &self,
        key: &QueryKey,
        outcome: ExecutionOutcome,
    ) -> Result<Option<QueueEntry>> {
        let now = now_ms();
        let mut state = self.state.lock().await;

        let removed = state.entries.remove(key);
        if let Some(entry) = &removed {
            state.publish(key, outcome, entry.orphaned_timeout_ms, now);
        }
        Ok(removed)
    }

    async fn get_result_blocking(
        &self,
        key: &QueryKey,
        timeout: Duration,
    ) -> Result<Option<ExecutionOutcome>> {
        let mut receiver = {
            let mut state = self.state.lock().await;
            if let Some(outcome) = state.live_result(key, now_ms()) {
                return Ok(Some(outcome));
            }
            state
                .watchers
                .entry(key.clone())
                .or_insert_with(|| watch::channel(None).0)
                .subscribe()
        };

        let result = match tokio::time::timeout(timeout, receiver.wait_for(|v| v.is_some())).await {
            Ok(Ok(value)) => Ok(value.clone()),
            _ => Ok(None),
        };
        result
    }

    async fn get_active_and_to_process(&self) -> Result<(Vec<QueryKey>, Vec<QueryKey>)> {
        let state = self.state.lock().await;

        let mut active: Vec<&QueueEntry> = state
            .entries
            .values()
            .filter(|e| e.state == EntryState::Active)
            .collect();
        active.sort_by_key(|e| (e.activated_at, e.seq));

        let mut pending: Vec<&QueueEntry> = state
            .entries
            .values()
            .filter(|e| e.state == EntryState::Pending)
            .collect();
        pending.sort_by_key(|e| (std::cmp::Reverse(e.priority), e.added_at, e.seq));

        Ok((
            active.into_iter().map(|e| e.key.clone()).collect(),
            pending.into_iter().map(|e| e.key.clone()).collect(),
        ))
    }

    async fn get_queries_to_cancel(&self) -> Result<Vec<StaleQuery>> {
        let now = now_ms();
        let execution_timeout_ms = duration_ms(self.options.execution_timeout);
        let state = self.state.lock().await;

        let mut stale: Vec<StaleQuery> = state
            .entries
            .values()
            .filter_map(|e| {
                stale_reason(e, now, execution_timeout_ms).map(|reason| StaleQuery {
                    key: e.key.clone(),
                    version: e.version,
                    reason,
                })
            })
            .collect();
        stale.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(stale)
    }

    async fn optimistic_query_update(
        &self,
        key: &QueryKey,
        expected_version: u64,
        update: EntryUpdate,
    ) -> Result<bool> {
        let now = now_ms();
        let mut state = self.state.lock().await;

        let Some(entry) = state.entries.get_mut(key) else {
            return Ok(false);
        };
        if entry.version != expected_version {
            return Ok(false);
        }

        match update {
            EntryUpdate::MarkStarted { started_at } => {
                entry.started_at = Some(started_at);
            }
            EntryUpdate::Requeue => {
                entry.state = EntryState::Pending;
                entry.processing_id = None;
                entry.lease_expires_at = None;
                entry.heartbeat_at = None;
                entry.activated_at = None;
                entry.started_at = None;
                entry.cancel_requested = false;
                entry.attempts += 1;
                entry.orphaned_at = entry
                    .orphaned_at
                    .max(now.saturating_add(entry.orphaned_timeout_ms));
            }
        }
        entry.version += 1;
        Ok(true)
    }

    async fn request_cancel(&self, key: &QueryKey) -> Result<Option<QueueEntry>> {
        let mut state = self.state.lock().await;

        Ok(state.entries.get_mut(key).map(|entry| {
            if entry.state == EntryState::Active && !entry.cancel_requested {
                entry.cancel_requested = true;
                entry.version += 1;
            }
            entry.clone()
        }))
    }

    async fn release_waiter(&self, key: &QueryKey) -> Result<()> {
        let now = now_ms();
        let mut state = self.state.lock().await;

        if let Some(entry) = state.entries.get_mut(key) {
            entry.waiter_count = entry.waiter_count.saturating_sub(1);
            if entry.waiter_count == 0 && entry.state == EntryState::Pending {
                entry.orphaned_at = now;
            }
            entry.version += 1;
        }
        Ok(())
    }

    async fn refresh_orphan_deadline(&self, key: &QueryKey, orphaned_at: i64) -> Result<()> {
        let mut state = self.state.lock().await;

        if let Some(entry) = state.entries.get_mut(key) {
            if orphaned_at > entry.orphaned_at {
                entry.orphaned_at = orphaned_at;
                entry.version += 1;
            }
        }
        Ok(())
    }

    async fn get_query_def(&self, key: &QueryKey) -> Result<Option<QueueEntry>> {
        let state = self.state.lock().await;
        Ok(state.entries.get(key).cloned())
    }

    async fn list_entries(&self) -> Result<Vec<QueueEntry>> {
        let state = self.state.lock().await;
        let mut entries: Vec<QueueEntry> = state.entries.values().cloned().collect();
        entries.sort_by_key(|e| e.seq);
        Ok(entries)
    }

    async fn purge_expired_results(&self) -> Result<u64> {
        let now = now_ms();
        let mut state = self.state.lock().await;

        let before = state.results.len();
        state.results.retain(|_, r| r.expires_at >= now);
        state.watchers.retain(|_, sender| sender.receiver_count() > 0);
        Ok((before - state.results.len()) as u64)
    }
}
