//! Queue adapters
//!
//! A [`QueueAdapter`] connects the pool to a work queue: it hands out jobs
//! as bound [`Task`]s and receives the pool's decision for each one.

mod memory;

pub use memory::{InMemoryQueue, QueueEvent, QueueStats, DEFAULT_LEASE};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::task::{HandlerRegistry, Task, TaskHandler};

/// Error type for adapter operations
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    /// The job is not reserved by this consumer (lease expired or unknown id)
    #[error("job not reserved: {0}")]
    NotReserved(String),

    /// Broker or client failure
    #[error("queue backend error: {0}")]
    Backend(String),
}

/// Work queue as seen by the pool
///
/// Every decision method receives a task previously returned by
/// [`QueueAdapter::listen`] on the same adapter.
#[async_trait]
pub trait QueueAdapter: Send + Sync + 'static {
    /// Watch a topic and bind its handler
    async fn register(&self, topic: &str, handler: Arc<dyn TaskHandler>)
        -> Result<(), AdapterError>;

    /// Stop watching a topic and drop its handler
    async fn unregister(&self, topic: &str) -> Result<(), AdapterError>;

    /// Reserve the next job, waiting at most `timeout`
    ///
    /// Returns `None` on timeout, or when the reserved job's topic has no
    /// handler (logged as a warning).
    async fn listen(&self, timeout: Duration) -> Result<Option<Task>, AdapterError>;

    /// Acknowledge successful processing
    async fn complete(&self, task: &Task) -> Result<(), AdapterError>;

    /// Release the job for redelivery
    async fn retry(&self, task: &Task) -> Result<(), AdapterError>;

    /// Extend the job's lease
    async fn touch(&self, task: &Task) -> Result<(), AdapterError>;

    /// Remove the job without marking it successful
    async fn delete(&self, task: &Task) -> Result<(), AdapterError>;

    /// Snapshot of the current topic bindings, handed to new workers
    fn handlers(&self) -> HandlerRegistry;
}
