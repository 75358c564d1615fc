//! Per-data-source queue management.
//!
//! Every data source gets its own [`QueryQueue`], created on first use with a
//! driver from [`queue_driver_factory`] and handlers from the orchestrator's
//! handler factory. Queues of different data sources never share capacity.

use crate::config::{QueueConfig, QueueDriverKind};
use crate::error::{QueueError, Result};
use crate::handler::HandlerRegistry;
use crate::queue::{ExecuteOptions, QueryQueue, QueueState};
use queryhouse_core::{CompiledQuery, HandlerKind, QueryKey};
use queryhouse_queue::{MemoryQueueDriver, QueueDriver, QueueDriverOptions, SqliteQueueDriver};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// Open the queue driver `config.driver` selects, namespaced to `data_source`.
///
/// SQLite drivers opened on the same file share entries across processes;
/// memory drivers are private to the returned instance.
pub async fn queue_driver_factory(
    config: &QueueConfig,
    data_source: &str,
) -> Result<Arc<dyn QueueDriver>> {
    let options = QueueDriverOptions {
        queue: data_source.to_string(),
        concurrency: config.concurrency,
        execution_timeout: config.execution_timeout,
        poll_interval: config.result_poll_interval,
    };

    let driver: Arc<dyn QueueDriver> = match &config.driver {
        QueueDriverKind::Memory => Arc::new(MemoryQueueDriver::new(options)),
        QueueDriverKind::Sqlite { path } => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    QueueError::InvalidConfig(format!(
                        "cannot create queue directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
            Arc::new(SqliteQueueDriver::new(path, options).await?)
        }
    };

    info!(data_source, driver = %config.driver, "Opened queue driver");
    Ok(driver)
}

/// Builds the handler set of a data source's queue.
pub type HandlerFactory = Arc<dyn Fn(&str) -> HandlerRegistry + Send + Sync>;

/// Entry point of the API layer: routes work to the queue of its data source.
pub struct QueryOrchestrator {
    config: QueueConfig,
    handler_factory: HandlerFactory,
    queues: RwLock<HashMap<String, Arc<QueryQueue>>>,
}

impl QueryOrchestrator {
    pub fn new(config: QueueConfig, handler_factory: HandlerFactory) -> Self {
        Self {
            config,
            handler_factory,
            queues: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Queue of `data_source`, created on first use.
    pub async fn queue(&self, data_source: &str) -> Result<Arc<QueryQueue>> {
        if let Some(queue) = self.queues.read().await.get(data_source) {
            return Ok(Arc::clone(queue));
        }

        let mut queues = self.queues.write().await;
        if let Some(queue) = queues.get(data_source) {
            return Ok(Arc::clone(queue));
        }

        let queue = Arc::new(
            QueryQueue::builder(data_source)
                .config(self.config.clone())
                .handlers((self.handler_factory)(data_source))
                .build()
                .await?,
        );
        queues.insert(data_source.to_string(), Arc::clone(&queue));
        Ok(queue)
    }

    /// Execute `payload` in the queue of its data source, keyed by its fingerprint.
    pub async fn execute(
        &self,
        kind: HandlerKind,
        payload: CompiledQuery,
        priority: i32,
        options: ExecuteOptions,
    ) -> Result<Value> {
        let key = payload.query_key()?;
        self.execute_with_key(kind, key, payload, priority, options)
            .await
    }

    /// Like [`execute`](Self::execute), deduplicating on a caller-derived key.
    pub async fn execute_with_key(
        &self,
        kind: HandlerKind,
        key: QueryKey,
        payload: CompiledQuery,
        priority: i32,
        options: ExecuteOptions,
    ) -> Result<Value> {
        let queue = self.queue(&payload.data_source).await?;
        queue
            .execute_in_queue(kind, key, payload, priority, options)
            .await
    }

    pub async fn cancel_query(&self, data_source: &str, key: &QueryKey) -> Result<bool> {
        match self.existing(data_source).await {
            Some(queue) => queue.cancel_query(key).await,
            None => Ok(false),
        }
    }

    pub async fn queue_state(&self, data_source: &str) -> Result<QueueState> {
        match self.existing(data_source).await {
            Some(queue) => queue.get_queue_state().await,
            None => Ok(QueueState::default()),
        }
    }

    /// Shut down every queue created so far.
    pub async fn shutdown(&self) {
        let queues: Vec<Arc<QueryQueue>> = self.queues.write().await.drain().map(|(_, q)| q).collect();
        for queue in queues {
            queue.shutdown().await;
        }
    }

    async fn existing(&self, data_source: &str) -> Option<Arc<QueryQueue>> {
        self.queues.read().await.get(data_source).cloned()
    }
}
