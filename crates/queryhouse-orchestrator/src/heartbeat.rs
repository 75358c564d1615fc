//! Lease Heartbeat - Worker Liveness
//!
//! While a worker runs a query it keeps the entry's lease alive by calling
//! `update_heartbeat` every `heartbeat_interval`. Other processes treat an
//! active entry whose lease expired as stalled and requeue it.
//!
//! ## How It Works
//!
//! 1. Every interval, renew the lease for `lease_duration`
//! 2. `CancelRequested`: someone called `cancel_query` on another node;
//!    trip the query's cancellation token
//! 3. `LeaseLost`: the entry was requeued or removed under us; trip the token
//!    and stop, the outcome would be discarded anyway
//! 4. Driver errors are logged and retried on the next tick; the lease
//!    duration is several intervals long
//!
//! ## Example
//!
//! ```ignore
//! let heartbeat = LeaseHeartbeat::new(driver, key, processing_id, interval, lease, token.clone());
//! let handle = heartbeat.spawn();
//!
//! let outcome = run_query(token).await;
//!
//! handle.stop().await;
//! ```

use queryhouse_core::QueryKey;
use queryhouse_queue::{HeartbeatStatus, QueueDriver};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Background task renewing one processing lease
pub struct LeaseHeartbeat {
    driver: Arc<dyn QueueDriver>,
    key: QueryKey,
    processing_id: String,
    interval: Duration,
    lease_duration: Duration,
    query_token: CancellationToken,
}

/// Running heartbeat; stop it once the query finished
pub struct HeartbeatHandle {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl HeartbeatHandle {
    pub async fn stop(self) {
        self.stop.cancel();
        let _ = self.task.await;
    }
}

impl LeaseHeartbeat {
    pub fn new(
        driver: Arc<dyn QueueDriver>,
        key: QueryKey,
        processing_id: String,
        interval: Duration,
        lease_duration: Duration,
        query_token: CancellationToken,
    ) -> Self {
        Self {
            driver,
            key,
            processing_id,
            interval,
            lease_duration,
            query_token,
        }
    }

    pub fn spawn(self) -> HeartbeatHandle {
        let stop = CancellationToken::new();
        let task = tokio::spawn(self.run(stop.clone()));
        HeartbeatHandle { stop, task }
    }

    /// Run the heartbeat loop until `stop` trips or the lease is lost
    async fn run(self, stop: CancellationToken) {
        let mut heartbeat_count: u64 = 0;
        let mut failure_count: u64 = 0;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = stop.cancelled() => break,
            }

            match self
                .driver
                .update_heartbeat(&self.key, &self.processing_id, self.lease_duration)
                .await
            {
                Ok(HeartbeatStatus::Renewed) => {
                    heartbeat_count += 1;
                    failure_count = 0;
                    debug!(
                        query_key = %self.key.short(),
                        processing_id = %self.processing_id,
                        count = heartbeat_count,
                        "Lease renewed"
                    );
                }
                Ok(HeartbeatStatus::CancelRequested) => {
                    info!(
                        query_key = %self.key.short(),
                        processing_id = %self.processing_id,
                        "Cancellation requested, stopping query"
                    );
                    self.query_token.cancel();
                }
                Ok(HeartbeatStatus::LeaseLost) => {
                    warn!(
                        query_key = %self.key.short(),
                        processing_id = %self.processing_id,
                        "Lease lost, abandoning query"
                    );
                    self.query_token.cancel();
                    break;
                }
                Err(e) => {
                    failure_count += 1;
                    error!(
                        query_key = %self.key.short(),
                        processing_id = %self.processing_id,
                        error = %e,
                        failure_count,
                        "Heartbeat failed"
                    );

                    if failure_count >= 3 {
                        warn!(
                            query_key = %self.key.short(),
                            failure_count,
                            "Multiple consecutive heartbeat failures - query may be requeued elsewhere"
                        );
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use queryhouse_core::{CompiledQuery, HandlerKind};
    use queryhouse_queue::{MemoryQueueDriver, NewQueueEntry, QueueDriverOptions};

    async fn claimed_entry(driver: &Arc<dyn QueueDriver>, lease: Duration) -> QueryKey {
        let payload = CompiledQuery::new("main", "SELECT 1", vec![]);
        let key = payload.query_key().unwrap();
        driver
            .add_to_queue(NewQueueEntry {
                key: key.clone(),
                handler: HandlerKind::Query,
                payload,
                priority: 0,
                request_id: None,
                orphaned_timeout: Duration::from_secs(60),
            })
            .await
            .unwrap();
        driver
            .retrieve_for_processing(&key, "worker", lease)
            .await
            .unwrap()
            .unwrap();
        key
    }

    #[tokio::test]
    async fn test_heartbeat_keeps_lease_alive() {
        let driver: Arc<dyn QueueDriver> =
            Arc::new(MemoryQueueDriver::new(QueueDriverOptions::new("main")));
        let key = claimed_entry(&driver, Duration::from_millis(50)).await;

        let token = CancellationToken::new();
        let handle = LeaseHeartbeat::new(
            Arc::clone(&driver),
            key.clone(),
            "worker".to_string(),
            Duration::from_millis(10),
            Duration::from_millis(50),
            token.clone(),
        )
        .spawn();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(driver.get_queries_to_cancel().await.unwrap().is_empty());
        assert!(!token.is_cancelled());

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_cancel_request_trips_token() {
        let driver: Arc<dyn QueueDriver> =
            Arc::new(MemoryQueueDriver::new(QueueDriverOptions::new("main")));
        let key = claimed_entry(&driver, Duration::from_secs(5)).await;

        let token = CancellationToken::new();
        let handle = LeaseHeartbeat::new(
            Arc::clone(&driver),
            key.clone(),
            "worker".to_string(),
            Duration::from_millis(10),
            Duration::from_secs(5),
            token.clone(),
        )
        .spawn();

        driver.request_cancel(&key).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), token.cancelled())
            .await
            .expect("token should trip");

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_lease_loss_trips_token_and_stops() {
        let driver: Arc<dyn QueueDriver> =
            Arc::new(MemoryQueueDriver::new(QueueDriverOptions::new("main")));
        let key = claimed_entry(&driver, Duration::from_secs(5)).await;
        driver.free_processing_lock(&key, "worker").await.unwrap();

        let token = CancellationToken::new();
        let handle = LeaseHeartbeat::new(
            Arc::clone(&driver),
            key,
            "worker".to_string(),
            Duration::from_millis(10),
            Duration::from_secs(5),
            token.clone(),
        )
        .spawn();

        tokio::time::timeout(Duration::from_secs(1), token.cancelled())
            .await
            .expect("token should trip");
        tokio::time::timeout(Duration::from_secs(1), handle.task)
            .await
            .expect("task should stop")
            .unwrap();
    }
}
