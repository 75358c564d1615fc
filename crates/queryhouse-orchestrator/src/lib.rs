//! QueryHouse Query Orchestrator
//!
//! Deduplicating, concurrency-bounded query execution on top of a
//! [`QueueDriver`](queryhouse_queue::QueueDriver).
//!
//! ## Purpose
//!
//! Analytical queries are expensive and dashboards ask the same question many
//! times at once. The orchestrator makes sure that:
//! - Concurrent requests for the same [`QueryKey`](queryhouse_core::QueryKey)
//!   share one execution and all receive its outcome
//! - No more than `concurrency` queries run against a data source at a time,
//!   across every process sharing the driver
//! - Callers that stop waiting, workers that die, and queries that run too
//!   long are cleaned up by reconciliation
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────┐
//! │ QueryOrchestrator  │  one queue per data source
//! └─────────┬──────────┘
//!           ▼
//! ┌────────────────────┐      ┌───────────────────┐
//! │     QueryQueue     │─────►│  HandlerRegistry  │  HandlerKind → QueryHandler
//! │ waiters, workers,  │      └───────────────────┘
//! │ reconciler         │
//! └─────────┬──────────┘
//!           ▼
//! ┌────────────────────┐
//! │    QueueDriver     │  memory or shared SQLite
//! └────────────────────┘
//! ```
//!
//! ## Usage Example
//!
//! ```ignore
//! use queryhouse_orchestrator::{ExecuteOptions, HandlerRegistry, QueryQueue, QueueConfig};
//! use queryhouse_core::HandlerKind;
//!
//! let queue = QueryQueue::builder("warehouse")
//!     .config(QueueConfig::from_env())
//!     .handlers(HandlerRegistry::for_driver(warehouse_driver))
//!     .build()
//!     .await?;
//!
//! let key = query.query_key()?;
//! let rows = queue
//!     .execute_in_queue(HandlerKind::Query, key, query, 0, ExecuteOptions::default())
//!     .await?;
//!
//! queue.shutdown().await;
//! ```

pub mod config;
pub mod error;
pub mod handler;
pub mod heartbeat;
pub mod orchestrator;
pub mod queue;
pub mod retry;

pub use config::{QueueConfig, QueueDriverKind, MAX_PRIORITY, MIN_PRIORITY};
pub use error::{HandlerError, QueueError, Result};
pub use handler::{DriverQueryHandler, HandlerRegistry, QueryHandler};
pub use heartbeat::{HeartbeatHandle, LeaseHeartbeat};
pub use orchestrator::{queue_driver_factory, HandlerFactory, QueryOrchestrator};
pub use queue::{
    ExecuteOptions, QueryQueue, QueryQueueBuilder, QueryStage, QueueState, QueuedQuery,
};
pub use retry::{retry_driver_call, RetryPolicy};
