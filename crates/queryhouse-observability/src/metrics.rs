//! Prometheus metrics for the query queue and the rollup orchestrator.
//!
//! Every metric lives in the global [`REGISTRY`]; [`init`] registers them
//! once per process. Recording into a metric that was never registered is
//! harmless, it just does not show up on `/metrics`.

use lazy_static::lazy_static;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry};
use std::sync::Once;

static INIT: Once = Once::new();

lazy_static! {
    /// Global Prometheus metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // ============================================================================
    // Queue Metrics
    // ============================================================================

    /// Entries created by `execute_in_queue`
    pub static ref QUEUE_ENQUEUED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("queryhouse_queue_enqueued_total", "Total queue entries created"),
        &["queue", "handler"]
    ).expect("metric can be created");

    /// Calls that joined an entry already in the queue
    pub static ref QUEUE_DEDUPLICATED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("queryhouse_queue_deduplicated_total", "Total calls joining an existing entry"),
        &["queue"]
    ).expect("metric can be created");

    /// Calls answered from a stored outcome without queueing
    pub static ref QUEUE_RESULT_HITS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("queryhouse_queue_result_hits_total", "Total calls served from stored results"),
        &["queue"]
    ).expect("metric can be created");

    /// Active entries seen by the last reconcile pass
    pub static ref QUEUE_ACTIVE: IntGaugeVec = IntGaugeVec::new(
        Opts::new("queryhouse_queue_active", "Active queue entries"),
        &["queue"]
    ).expect("metric can be created");

    /// Pending entries seen by the last reconcile pass
    pub static ref QUEUE_PENDING: IntGaugeVec = IntGaugeVec::new(
        Opts::new("queryhouse_queue_pending", "Pending queue entries"),
        &["queue"]
    ).expect("metric can be created");

    /// Handler execution time
    pub static ref QUERY_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new("queryhouse_query_duration_seconds", "Handler execution time in seconds")
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 600.0]),
        &["queue", "handler"]
    ).expect("metric can be created");

    /// Failed executions by outcome kind
    pub static ref QUERY_ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("queryhouse_query_errors_total", "Total failed executions"),
        &["queue", "handler", "error_type"] // handler, timeout, cancelled, orphaned
    ).expect("metric can be created");

    /// Entries fixed up by reconciliation
    pub static ref QUEUE_RECONCILED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("queryhouse_queue_reconciled_total", "Total entries handled by reconciliation"),
        &["queue", "action"] // requeued, stalled, timeout, orphaned
    ).expect("metric can be created");

    /// Driver calls retried after a transient failure
    pub static ref QUEUE_DRIVER_RETRIES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("queryhouse_queue_driver_retries_total", "Total retried queue driver calls"),
        &["operation"]
    ).expect("metric can be created");

    // ============================================================================
    // Rollup Metrics
    // ============================================================================

    /// Partition builds by result
    pub static ref PARTITION_BUILDS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("queryhouse_partition_builds_total", "Total partition builds"),
        &["table", "status"] // built, fresh, failed
    ).expect("metric can be created");

    /// Rows returned by lambda queries per side of the boundary
    pub static ref LAMBDA_ROWS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("queryhouse_lambda_rows_total", "Total rows returned by lambda queries"),
        &["rollup", "source"] // historical, live
    ).expect("metric can be created");
}

/// Register all metrics with [`REGISTRY`]. Safe to call more than once.
pub fn init() {
    INIT.call_once(|| {
        REGISTRY
            .register(Box::new(QUEUE_ENQUEUED_TOTAL.clone()))
            .expect("queue_enqueued_total can be registered");
        REGISTRY
            .register(Box::new(QUEUE_DEDUPLICATED_TOTAL.clone()))
            .expect("queue_deduplicated_total can be registered");
        REGISTRY
            .register(Box::new(QUEUE_RESULT_HITS_TOTAL.clone()))
            .expect("queue_result_hits_total can be registered");
        REGISTRY
            .register(Box::new(QUEUE_ACTIVE.clone()))
            .expect("queue_active can be registered");
        REGISTRY
            .register(Box::new(QUEUE_PENDING.clone()))
            .expect("queue_pending can be registered");
        REGISTRY
            .register(Box::new(QUERY_DURATION.clone()))
            .expect("query_duration can be registered");
        REGISTRY
            .register(Box::new(QUERY_ERRORS_TOTAL.clone()))
            .expect("query_errors_total can be registered");
        REGISTRY
            .register(Box::new(QUEUE_RECONCILED_TOTAL.clone()))
            .expect("queue_reconciled_total can be registered");
        REGISTRY
            .register(Box::new(QUEUE_DRIVER_RETRIES_TOTAL.clone()))
            .expect("queue_driver_retries_total can be registered");

        REGISTRY
            .register(Box::new(PARTITION_BUILDS_TOTAL.clone()))
            .expect("partition_builds_total can be registered");
        REGISTRY
            .register(Box::new(LAMBDA_ROWS_TOTAL.clone()))
            .expect("lambda_rows_total can be registered");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init();
        init();
    }

    #[test]
    fn test_registered_metrics_are_gathered() {
        init();
        QUEUE_ENQUEUED_TOTAL
            .with_label_values(&["metrics_test", "query"])
            .inc();

        let families = REGISTRY.gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "queryhouse_queue_enqueued_total"));
    }
}
