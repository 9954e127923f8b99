//! # Job Pool
//!
//! Pulls jobs from a work queue and runs them on a bounded set of isolated
//! workers, reporting each outcome back to the queue.
//!
//! ## Features
//!
//! - **Isolated workers**: each worker is a dedicated OS thread with its own runtime; a hung or panicking handler never blocks the pool
//! - **Framed channel**: length-prefixed messages over a Unix socket pair or an in-memory pipe; neither side ever waits on the other
//! - **Least-loaded submission**: round-robin start with a least-outstanding scan
//! - **Idle reclamation**: workers with nothing outstanding are stopped and joined when the queue goes quiet
//! - **Lease keeping**: queued and finished jobs are touched, acknowledged, retried or deleted
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      QueueAdapter                            │
//! │  (listen / complete / retry / touch / delete)               │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Pool                                 │
//! │  (submit, collect, reclaim, shutdown; single control loop)  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │  Channel + control signal
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Worker (one OS thread each)                 │
//! │  (FIFO queue, runs Task handlers, returns results)          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use jobpool::prelude::*;
//!
//! let queue = Arc::new(InMemoryQueue::new());
//! queue
//!     .register("echo", handler_fn(|id, payload| async move {
//!         tracing::info!(%id, bytes = payload.len(), "echo");
//!         Ok(())
//!     }))
//!     .await?;
//!
//! let mut pool = Pool::new(PoolConfig::from_env(), queue)?;
//! pool.run().await?;
//! ```

pub mod adapter;
pub mod channel;
pub mod config;
pub mod pool;
pub mod task;
pub mod telemetry;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::adapter::{AdapterError, InMemoryQueue, QueueAdapter};
    pub use crate::channel::{Channel, Message, TransportError, TransportKind};
    pub use crate::config::{PoolConfig, WorkerConfig};
    pub use crate::pool::{select_slot, Pool, PoolError, PoolStats, PoolStatus};
    pub use crate::task::{
        handler_fn, HandlerError, HandlerRegistry, HandlerResult, Task, TaskHandler, TaskState,
    };
    pub use crate::worker::{ControlSignal, Worker, WorkerStatus};
}

pub use adapter::{AdapterError, InMemoryQueue, QueueAdapter};
pub use config::{PoolConfig, WorkerConfig};
pub use pool::{Pool, PoolError, PoolStats, PoolStatus};
pub use task::{handler_fn, HandlerError, Task, TaskHandler};
