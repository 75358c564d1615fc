//! SQLite Queue Driver
//!
//! Shared [`QueueDriver`] backed by a SQLite database file. Every process
//! that opens the same file takes part in the same queues; the database is
//! the only coordination channel.
//!
//! ## Usage
//!
//! ```ignore
//! use queryhouse_queue::{QueueDriverOptions, SqliteQueueDriver};
//!
//! // Creates queue.db (or opens it) and runs migrations
//! let driver = SqliteQueueDriver::new("queue.db", QueueDriverOptions::new("warehouse")).await?;
//! ```
//!
//! ## Implementation Details
//!
//! ### Atomicity
//! - Claims are one `UPDATE ... WHERE state = 'pending' AND (active count) < ?`
//!   statement, so two processes can never exceed the concurrency limit
//! - Publishing an outcome deletes the owned entry and writes the result in
//!   one transaction that starts with the write
//! - Optimistic updates compare the `version` column, which every mutation bumps
//!
//! ### Connections
//! - WAL journal so readers do not block the writer
//! - Busy timeout so concurrent writers queue up instead of failing
//!
//! ### Waiting
//! - SQLite has no notifications; `get_result_blocking` polls the result
//!   table every `poll_interval`

use crate::error::{QueueDriverError, Result};
use crate::types::*;
use crate::QueueDriver;
use async_trait::async_trait;
use queryhouse_core::time::now_ms;
use queryhouse_core::QueryKey;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

const ENTRY_COLUMNS: &str = "query_key, handler, payload, priority, added_at, seq, state, \
    waiter_count, version, processing_id, lease_expires_at, heartbeat_at, activated_at, \
    started_at, orphaned_at, orphaned_timeout_ms, attempts, cancel_requested, request_id";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite-based queue driver
pub struct SqliteQueueDriver {
    pool: SqlitePool,
    options: QueueDriverOptions,
}

impl SqliteQueueDriver {
    /// Open (or create) the queue database at `path`
    pub async fn new<P: AsRef<Path>>(path: P, options: QueueDriverOptions) -> Result<Self> {
        let connect =
            SqliteConnectOptions::from_str(&format!("sqlite://{}", path.as_ref().display()))?
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
                .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(connect)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool, options })
    }

    /// Create in-memory database (for testing)
    ///
    /// Every in-memory connection is a separate database, so the pool holds
    /// exactly one.
    pub async fn new_in_memory(options: QueueDriverOptions) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool, options })
    }

    pub fn options(&self) -> &QueueDriverOptions {
        &self.options
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn store_outcome<'c, E>(
        &self,
        executor: E,
        key: &QueryKey,
        outcome: &ExecutionOutcome,
        retention_ms: i64,
        now: i64,
    ) -> Result<()>
    where
        E: sqlx::Executor<'c, Database = sqlx::Sqlite>,
    {
        sqlx::query(
            r#"
            INSERT INTO queue_results (queue, query_key, outcome, created_at, expires_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(queue, query_key) DO UPDATE SET
                outcome = excluded.outcome,
                created_at = excluded.created_at,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(&self.options.queue)
        .bind(key.as_str())
        .bind(serde_json::to_string(outcome)?)
        .bind(now)
        .bind(now.saturating_add(retention_ms))
        .execute(executor)
        .await?;
        Ok(())
    }
}

fn entry_from_row(row: &SqliteRow) -> Result<QueueEntry> {
    let handler: String = row.try_get("handler")?;
    let payload: String = row.try_get("payload")?;
    let state: String = row.try_get("state")?;

    Ok(QueueEntry {
        key: QueryKey::from_hash(row.try_get::<String, _>("query_key")?),
        handler: handler.parse()?,
        payload: serde_json::from_str(&payload)?,
        priority: row.try_get("priority")?,
        added_at: row.try_get("added_at")?,
        seq: row.try_get::<i64, _>("seq")? as u64,
        state: state.parse().map_err(QueueDriverError::InvalidData)?,
        waiter_count: row.try_get("waiter_count")?,
        version: row.try_get::<i64, _>("version")? as u64,
        processing_id: row.try_get("processing_id")?,
        lease_expires_at: row.try_get("lease_expires_at")?,
        heartbeat_at: row.try_get("heartbeat_at")?,
        activated_at: row.try_get("activated_at")?,
        started_at: row.try_get("started_at")?,
        orphaned_at: row.try_get("orphaned_at")?,
        orphaned_timeout_ms: row.try_get("orphaned_timeout_ms")?,
        attempts: row.try_get("attempts")?,
        cancel_requested: row.try_get::<i64, _>("cancel_requested")? != 0,
        request_id: row.try_get("request_id")?,
    })
}

fn outcome_from_row(row: &SqliteRow) -> Result<ExecutionOutcome> {
    let outcome: String = row.try_get("outcome")?;
    Ok(serde_json::from_str(&outcome)?)
}

fn stale_reason_from_str(s: &str) -> Result<StaleReason> {
    match s {
        "stalled" => Ok(StaleReason::Stalled),
        "execution_timeout" => Ok(StaleReason::ExecutionTimeout),
        "orphaned" => Ok(StaleReason::Orphaned),
        other => Err(QueueDriverError::InvalidData(format!(
            "unknown stale reason: {}",
            other
        ))),
    }
}

#[async_trait]
impl QueueDriver for SqliteQueueDriver {
    fn queue_name(&self) -> &str {
        &self.options.queue
    }

    async fn add_to_queue(&self, new: NewQueueEntry) -> Result<AddToQueueResponse> {
        let now = now_ms();
        let orphaned_timeout_ms = duration_ms(new.orphaned_timeout);
        let payload = serde_json::to_string(&new.payload)?;

        // Insert-or-join in one statement. A fresh row has version 1; a joined
        // row always comes back with a higher version.
        let row = sqlx::query(
            r#"
            INSERT INTO queue_entries (
                queue, query_key, handler, payload, priority, added_at, seq, state,
                waiter_count, version, orphaned_at, orphaned_timeout_ms, attempts,
                cancel_requested, request_id
            )
            VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6,
                (SELECT COALESCE(MAX(seq), 0) + 1 FROM queue_entries WHERE queue = ?1),
                'pending', 1, 1, ?7, ?8, 0, 0, ?9
            )
            ON CONFLICT(queue, query_key) DO UPDATE SET
                waiter_count = waiter_count + 1,
                orphaned_at = MAX(orphaned_at, excluded.orphaned_at),
                version = version + 1
            RETURNING version, added_at
            "#,
        )
        .bind(&self.options.queue)
        .bind(new.key.as_str())
        .bind(new.handler.as_str())
        .bind(payload)
        .bind(new.priority)
        .bind(now)
        .bind(now.saturating_add(orphaned_timeout_ms))
        .bind(orphaned_timeout_ms)
        .bind(new.request_id)
        .fetch_one(&self.pool)
        .await?;

        let added = row.try_get::<i64, _>("version")? == 1;
        let added_at: i64 = row.try_get("added_at")?;

        if added {
            sqlx::query(
                "DELETE FROM queue_results WHERE queue = ? AND query_key = ? AND created_at < ?",
            )
            .bind(&self.options.queue)
            .bind(new.key.as_str())
            .bind(added_at)
            .execute(&self.pool)
            .await?;
        }

        let queue_size: i64 = sqlx::query("SELECT COUNT(*) FROM queue_entries WHERE queue = ?")
            .bind(&self.options.queue)
            .fetch_one(&self.pool)
            .await?
            .try_get(0)?;

        Ok(AddToQueueResponse {
            added,
            queue_size: queue_size as usize,
            added_at,
        })
    }

    async fn get_result(&self, key: &QueryKey) -> Result<Option<ExecutionOutcome>> {
        let row = sqlx::query(
            "SELECT outcome FROM queue_results WHERE queue = ? AND query_key = ? AND expires_at >= ?",
        )
        .bind(&self.options.queue)
        .bind(key.as_str())
        .bind(now_ms())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(outcome_from_row).transpose()
    }

    async fn retrieve_for_processing(
        &self,
        key: &QueryKey,
        processing_id: &str,
        lease_duration: Duration,
    ) -> Result<Option<Lease>> {
        let now = now_ms();
        let expires_at = now.saturating_add(duration_ms(lease_duration));

        let sql = format!(
            r#"
            UPDATE queue_entries SET
                state = 'active',
                processing_id = ?3,
                lease_expires_at = ?4,
                heartbeat_at = ?5,
                activated_at = ?5,
                started_at = NULL,
                cancel_requested = 0,
                version = version + 1
            WHERE queue = ?1 AND query_key = ?2 AND state = 'pending'
              AND (SELECT COUNT(*) FROM queue_entries WHERE queue = ?1 AND state = 'active') < ?6
            RETURNING {}
            "#,
            ENTRY_COLUMNS
        );

        let row = sqlx::query(&sql)
            .bind(&self.options.queue)
            .bind(key.as_str())
            .bind(processing_id)
            .bind(expires_at)
            .bind(now)
            .bind(self.options.concurrency as i64)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let entry = entry_from_row(&row)?;

        debug!(
            queue = %self.options.queue,
            query_key = %key.short(),
            processing_id = %processing_id,
            "Claimed queue entry"
        );

        Ok(Some(Lease {
            key: key.clone(),
            processing_id: processing_id.to_string(),
            version: entry.version,
            expires_at,
            entry,
        }))
    }

    async fn update_heartbeat(
        &self,
        key: &QueryKey,
        processing_id: &str,
        lease_duration: Duration,
    ) -> Result<HeartbeatStatus> {
        let now = now_ms();

        let row = sqlx::query(
            r#"
            UPDATE queue_entries SET
                heartbeat_at = ?4,
                lease_expires_at = ?5,
                version = version + 1
            WHERE queue = ?1 AND query_key = ?2 AND state = 'active' AND processing_id = ?3
            RETURNING cancel_requested
            "#,
        )
        .bind(&self.options.queue)
        .bind(key.as_str())
        .bind(processing_id)
        .bind(now)
        .bind(now.saturating_add(duration_ms(lease_duration)))
        .fetch_optional(&self.pool)
        .await?;

        match row {
            None => Ok(HeartbeatStatus::LeaseLost),
            Some(row) if row.try_get::<i64, _>("cancel_requested")? != 0 => {
                Ok(HeartbeatStatus::CancelRequested)
            }
            Some(_) => Ok(HeartbeatStatus::Renewed),
        }
    }

    async fn free_processing_lock(&self, key: &QueryKey, processing_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE queue_entries SET
                state = 'pending',
                processing_id = NULL,
                lease_expires_at = NULL,
                heartbeat_at = NULL,
                activated_at = NULL,
                started_at = NULL,
                version = version + 1
            WHERE queue = ?1 AND query_key = ?2 AND processing_id = ?3
            "#,
        )
        .bind(&self.options.queue)
        .bind(key.as_str())
        .bind(processing_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_result_and_remove_query(
        &self,
        key: &QueryKey,
        processing_id: &str,
        outcome: ExecutionOutcome,
    ) -> Result<bool> {
        let now = now_ms();
        let mut tx = self.pool.begin().await?;

        let removed = sqlx::query(
            r#"
            DELETE FROM queue_entries
            WHERE queue = ?1 AND query_key = ?2 AND state = 'active' AND processing_id = ?3
            RETURNING orphaned_timeout_ms
            "#,
        )
        .bind(&self.options.queue)
        .bind(key.as_str())
        .bind(processing_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = removed else {
            tx.rollback().await?;
            return Ok(false);
        };
        let retention_ms: i64 = row.try_get("orphaned_timeout_ms")?;

        self.store_outcome(&mut *tx, key, &outcome, retention_ms, now)
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn remove_with_outcome(
        &self,
        key: &QueryKey,
        outcome: ExecutionOutcome,
    ) -> Result<Option<QueueEntry>> {
        let now = now_ms();
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            "DELETE FROM queue_entries WHERE queue = ?1 AND query_key = ?2 RETURNING {}",
            ENTRY_COLUMNS
        );
        let removed = sqlx::query(&sql)
            .bind(&self.options.queue)
            .bind(key.as_str())
            .fetch_optional(&mut *tx)
            .await?;

        let Some(row) = removed else {
            tx.rollback().await?;
            return Ok(None);
        };
        let entry = entry_from_row(&row)?;

        self.store_outcome(&mut *tx, key, &outcome, entry.orphaned_timeout_ms, now)
            .await?;
        tx.commit().await?;
        Ok(Some(entry))
    }

    async fn get_result_blocking(
        &self,
        key: &QueryKey,
        timeout: Duration,
    ) -> Result<Option<ExecutionOutcome>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(outcome) = self.get_result(key).await? {
                return Ok(Some(outcome));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.options.poll_interval.min(deadline - now)).await;
        }
    }

    async fn get_active_and_to_process(&self) -> Result<(Vec<QueryKey>, Vec<QueryKey>)> {
        let active = sqlx::query(
            r#"
            SELECT query_key FROM queue_entries
            WHERE queue = ? AND state = 'active'
            ORDER BY activated_at, seq
            "#,
        )
        .bind(&self.options.queue)
        .fetch_all(&self.pool)
        .await?;

        let pending = sqlx::query(
            r#"
            SELECT query_key FROM queue_entries
            WHERE queue = ? AND state = 'pending'
            ORDER BY priority DESC, added_at, seq
            "#,
        )
        .bind(&self.options.queue)
        .fetch_all(&self.pool)
        .await?;

        let keys = |rows: Vec<SqliteRow>| -> Result<Vec<QueryKey>> {
            rows.iter()
                .map(|r| Ok(QueryKey::from_hash(r.try_get::<String, _>("query_key")?)))
                .collect()
        };

        Ok((keys(active)?, keys(pending)?))
    }

    async fn get_queries_to_cancel(&self) -> Result<Vec<StaleQuery>> {
        let rows = sqlx::query(
            r#"
            SELECT query_key, version, reason FROM (
                SELECT query_key, version,
                    CASE
                        WHEN state = 'active'
                             AND (lease_expires_at IS NULL OR lease_expires_at < ?2)
                            THEN 'stalled'
                        WHEN state = 'active' AND activated_at + ?3 < ?2
                            THEN 'execution_timeout'
                        WHEN state = 'pending' AND orphaned_at < ?2
                            THEN 'orphaned'
                    END AS reason
                FROM queue_entries
                WHERE queue = ?1
            )
            WHERE reason IS NOT NULL
            ORDER BY query_key
            "#,
        )
        .bind(&self.options.queue)
        .bind(now_ms())
        .bind(duration_ms(self.options.execution_timeout))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let reason: String = row.try_get("reason")?;
                Ok(StaleQuery {
                    key: QueryKey::from_hash(row.try_get::<String, _>("query_key")?),
                    version: row.try_get::<i64, _>("version")? as u64,
                    reason: stale_reason_from_str(&reason)?,
                })
            })
            .collect()
    }

    async fn optimistic_query_update(
        &self,
        key: &QueryKey,
        expected_version: u64,
        update: EntryUpdate,
    ) -> Result<bool> {
        let result = match update {
            EntryUpdate::MarkStarted { started_at } => {
                sqlx::query(
                    r#"
                    UPDATE queue_entries SET started_at = ?4, version = version + 1
                    WHERE queue = ?1 AND query_key = ?2 AND version = ?3
                    "#,
                )
                .bind(&self.options.queue)
                .bind(key.as_str())
                .bind(expected_version as i64)
                .bind(started_at)
                .execute(&self.pool)
                .await?
            }
            EntryUpdate::Requeue => {
                sqlx::query(
                    r#"
                    UPDATE queue_entries SET
                        state = 'pending',
                        processing_id = NULL,
                        lease_expires_at = NULL,
                        heartbeat_at = NULL,
                        activated_at = NULL,
                        started_at = NULL,
                        cancel_requested = 0,
                        attempts = attempts + 1,
                        orphaned_at = MAX(orphaned_at, ?4 + orphaned_timeout_ms),
                        version = version + 1
                    WHERE queue = ?1 AND query_key = ?2 AND version = ?3
                    "#,
                )
                .bind(&self.options.queue)
                .bind(key.as_str())
                .bind(expected_version as i64)
                .bind(now_ms())
                .execute(&self.pool)
                .await?
            }
        };

        Ok(result.rows_affected() == 1)
    }

    async fn request_cancel(&self, key: &QueryKey) -> Result<Option<QueueEntry>> {
        let sql = format!(
            r#"
            UPDATE queue_entries SET cancel_requested = 1, version = version + 1
            WHERE queue = ?1 AND query_key = ?2 AND state = 'active' AND cancel_requested = 0
            RETURNING {}
            "#,
            ENTRY_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(&self.options.queue)
            .bind(key.as_str())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(entry_from_row(&row)?)),
            None => self.get_query_def(key).await,
        }
    }

    async fn release_waiter(&self, key: &QueryKey) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE queue_entries SET
                waiter_count = MAX(waiter_count - 1, 0),
                orphaned_at = CASE
                    WHEN state = 'pending' AND waiter_count <= 1 THEN ?3
                    ELSE orphaned_at
                END,
                version = version + 1
            WHERE queue = ?1 AND query_key = ?2
            "#,
        )
        .bind(&self.options.queue)
        .bind(key.as_str())
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn refresh_orphan_deadline(&self, key: &QueryKey, orphaned_at: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE queue_entries SET orphaned_at = ?3, version = version + 1
            WHERE queue = ?1 AND query_key = ?2 AND orphaned_at < ?3
            "#,
        )
        .bind(&self.options.queue)
        .bind(key.as_str())
        .bind(orphaned_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_query_def(&self, key: &QueryKey) -> Result<Option<QueueEntry>> {
        let sql = format!(
            "SELECT {} FROM queue_entries WHERE queue = ? AND query_key = ?",
            ENTRY_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(&self.options.queue)
            .bind(key.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(entry_from_row).transpose()
    }

    async fn list_entries(&self) -> Result<Vec<QueueEntry>> {
        let sql = format!(
            "SELECT {} FROM queue_entries WHERE queue = ? ORDER BY seq",
            ENTRY_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(&self.options.queue)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(entry_from_row).collect()
    }

    async fn purge_expired_results(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM queue_results WHERE queue = ? AND expires_at < ?")
            .bind(&self.options.queue)
            .bind(now_ms())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
