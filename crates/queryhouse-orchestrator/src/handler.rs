//! Query Handlers
//!
//! A queue does not know how to run anything itself. Each [`HandlerKind`] it
//! accepts is mapped to a [`QueryHandler`] in a [`HandlerRegistry`] that is
//! fixed when the queue is built:
//!
//! ```text
//! HandlerKind::Query                ─→ DriverQueryHandler (SQL through the Driver)
//! HandlerKind::PreAggregationBuild  ─→ partition build handler
//! HandlerKind::RefreshKey           ─→ refresh key handler
//! HandlerKind::BuildRange           ─→ build range handler
//! ```
//!
//! Handlers receive a [`CancellationToken`] that trips when the query is
//! cancelled, times out, or its lease is lost. The queue also drops the
//! handler future in those cases, so honouring the token is only needed to
//! release backend resources early.

use crate::error::HandlerError;
use async_trait::async_trait;
use queryhouse_core::{CompiledQuery, Driver, HandlerKind};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait QueryHandler: Send + Sync {
    /// Execute the payload and produce the value every waiter receives.
    async fn handle(
        &self,
        payload: &CompiledQuery,
        cancel: CancellationToken,
    ) -> Result<Value, HandlerError>;

    /// Hook invoked after a timeout or forced cancellation, e.g. to kill the
    /// backend query.
    async fn cancel(&self, _payload: &CompiledQuery) -> Result<(), HandlerError> {
        Ok(())
    }
}

/// Fixed mapping from handler kind to handler.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<HandlerKind, Arc<dyn QueryHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with only the plain query handler for `driver`.
    pub fn for_driver(driver: Arc<dyn Driver>) -> Self {
        Self::new().with(HandlerKind::Query, Arc::new(DriverQueryHandler::new(driver)))
    }

    pub fn with(mut self, kind: HandlerKind, handler: Arc<dyn QueryHandler>) -> Self {
        self.handlers.insert(kind, handler);
        self
    }

    pub fn get(&self, kind: HandlerKind) -> Option<Arc<dyn QueryHandler>> {
        self.handlers.get(&kind).cloned()
    }

    pub fn contains(&self, kind: HandlerKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<&str> = self.handlers.keys().map(|k| k.as_str()).collect();
        kinds.sort_unstable();
        f.debug_struct("HandlerRegistry").field("kinds", &kinds).finish()
    }
}

/// Runs the payload SQL through the data source's [`Driver`] and returns
/// the rows as a JSON array.
pub struct DriverQueryHandler {
    driver: Arc<dyn Driver>,
}

impl DriverQueryHandler {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self { driver }
    }
}

#[async_trait]
impl QueryHandler for DriverQueryHandler {
    async fn handle(
        &self,
        payload: &CompiledQuery,
        cancel: CancellationToken,
    ) -> Result<Value, HandlerError> {
        tokio::select! {
            rows = self.driver.execute(&payload.sql, &payload.params) => {
                Ok(serde_json::to_value(rows?)?)
            }
            _ = cancel.cancelled() => Err(HandlerError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use queryhouse_core::{DriverError, Rows};
    use serde_json::json;
    use std::time::Duration;

    struct SlowDriver;

    #[async_trait]
    impl Driver for SlowDriver {
        async fn execute(&self, sql: &str, _params: &[Value]) -> Result<Rows, DriverError> {
            if sql.contains("sleep") {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            if sql.contains("missing") {
                return Err(DriverError::Query("relation \"missing\" does not exist".into()));
            }
            let mut row = serde_json::Map::new();
            row.insert("count".to_string(), json!(3));
            Ok(vec![row])
        }

        async fn test_connection(&self) -> Result<(), DriverError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_driver_handler_returns_rows() {
        let handler = DriverQueryHandler::new(Arc::new(SlowDriver));
        let payload = CompiledQuery::new("main", "SELECT count(*) AS count FROM t", vec![]);

        let value = handler.handle(&payload, CancellationToken::new()).await.unwrap();
        assert_eq!(value, json!([{"count": 3}]));
    }

    #[tokio::test]
    async fn test_driver_errors_surface() {
        let handler = DriverQueryHandler::new(Arc::new(SlowDriver));
        let payload = CompiledQuery::new("main", "SELECT * FROM missing", vec![]);

        let err = handler.handle(&payload, CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, HandlerError::Driver(DriverError::Query(_))));
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_driver() {
        let handler = DriverQueryHandler::new(Arc::new(SlowDriver));
        let payload = CompiledQuery::new("main", "SELECT pg_sleep(60)", vec![]);
        let token = CancellationToken::new();

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let err = handler.handle(&payload, token).await.unwrap_err();
        assert!(matches!(err, HandlerError::Cancelled));
    }

    #[test]
    fn test_registry_lookup() {
        let registry = HandlerRegistry::for_driver(Arc::new(SlowDriver));
        assert!(registry.contains(HandlerKind::Query));
        assert!(registry.get(HandlerKind::RefreshKey).is_none());
        assert_eq!(format!("{:?}", registry), "HandlerRegistry { kinds: [\"query\"] }");
    }
}
