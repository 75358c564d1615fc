//! QueryHouse Observability
//!
//! Metrics and logging shared by every QueryHouse crate.
//!
//! # Features
//!
//! - Prometheus metrics for queues, handlers, partitions and lambda queries
//! - `/metrics` router; the crates expose no server of their own, so the
//!   embedding binary mounts it next to its routes
//! - `tracing` subscriber setup driven by `RUST_LOG`
//!
//! # Usage
//!
//! ```no_run
//! use queryhouse_observability::{exporter, init};
//!
//! // Logging + metrics registration
//! init();
//!
//! // Merged into the embedding service's axum router
//! let metrics_router = exporter::create_metrics_router();
//! ```

pub mod exporter;
pub mod metrics;

pub use metrics::{init as init_metrics, REGISTRY};

/// Install the global `tracing` subscriber.
///
/// Filters come from `RUST_LOG`, defaulting to `info`. Does nothing if a
/// subscriber is already installed (e.g. by a test harness).
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}

/// Initialize all observability components
pub fn init() {
    init_tracing();
    metrics::init();
}
