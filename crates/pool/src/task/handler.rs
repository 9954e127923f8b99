//! Task handlers and the topic registry

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Error returned by a handler when a task cannot be processed
///
/// A handler error never escapes the worker loop; it only moves the task to
/// the terminated state and ends up as a retry at the queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HandlerError {
    /// Error message
    pub message: String,

    /// Error type/code for programmatic handling
    pub error_type: Option<String>,
}

impl HandlerError {
    /// Create a new handler error
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
        }
    }

    /// Set the error type
    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error_type {
            Some(error_type) => write!(f, "{}: {}", error_type, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for HandlerError {}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(err.to_string())
    }
}

impl From<std::io::Error> for HandlerError {
    fn from(err: std::io::Error) -> Self {
        Self::new(err.to_string()).with_type("io")
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(err.to_string()).with_type("decode")
    }
}

/// Handler result
pub type HandlerResult = Result<(), HandlerError>;

/// Executable bound to a queue topic
///
/// Handlers run inside a worker's execution context, one task at a time.
/// A handler must bound its own blocking: the worker never preempts it
/// except on a terminate-now signal, and only at an await point.
///
/// # Example
///
/// ```ignore
/// struct ResizeImage;
///
/// #[async_trait]
/// impl TaskHandler for ResizeImage {
///     async fn handle(&self, id: &str, payload: &[u8]) -> HandlerResult {
///         let request: ResizeRequest = serde_json::from_slice(payload)?;
///         // ...
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    /// Process one job
    async fn handle(&self, id: &str, payload: &[u8]) -> HandlerResult;
}

/// Handler backed by a closure, see [`handler_fn`]
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(String, Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, id: &str, payload: &[u8]) -> HandlerResult {
        (self.f)(id.to_string(), payload.to_vec()).await
    }
}

/// Wrap an async closure as a shared handler
///
/// ```ignore
/// let echo = handler_fn(|id, payload| async move {
///     tracing::info!(%id, bytes = payload.len(), "echo");
///     Ok(())
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn TaskHandler>
where
    F: Fn(String, Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

/// Topic to handler map
///
/// Handlers are resolved once at registration. Each worker receives its own
/// snapshot of the registry when it starts and re-binds incoming tasks by
/// topic; the snapshot is never mutated afterwards.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a handler to a topic, replacing any previous binding
    pub fn register(&mut self, topic: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(topic.into(), handler);
    }

    /// Drop the binding for a topic
    pub fn unregister(&mut self, topic: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.remove(topic)
    }

    /// Look up the handler for a topic
    pub fn resolve(&self, topic: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(topic).cloned()
    }

    /// Check if a topic has a handler
    pub fn contains(&self, topic: &str) -> bool {
        self.handlers.contains_key(topic)
    }

    /// Registered topics
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.handlers.keys().cloned().collect();
        topics.sort();
        topics
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("topics", &self.topics())
            .finish()
    }
}
