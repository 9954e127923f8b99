//! Task lifecycle
//!
//! A [`Task`] is one queued job plus its execution outcome. It is created by
//! the queue adapter, bound to the handler registered for its topic, and
//! crosses the pool/worker boundary as a [`TaskRecord`].

mod handler;

pub use handler::{handler_fn, FnHandler, HandlerError, HandlerRegistry, HandlerResult, TaskHandler};

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde::{Deserialize, Serialize};

/// Task state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting to be executed
    Pending,
    /// Handler is executing
    Running,
    /// Handler returned normally
    Complete,
    /// Handler faulted, or the task was canceled before it ran
    Terminated,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Terminated)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Complete => write!(f, "complete"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

/// One unit of queued work
pub struct Task {
    id: String,
    topic: String,
    payload: Vec<u8>,
    deliveries: u32,
    state: TaskState,
    diagnostic: Option<String>,
    canceled: bool,
    handler: Option<Arc<dyn TaskHandler>>,
}

impl Task {
    /// Create a pending task bound to a handler
    pub fn new(
        id: impl Into<String>,
        topic: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        handler: Arc<dyn TaskHandler>,
    ) -> Self {
        Self {
            handler: Some(handler),
            ..Self::unbound(id, topic, payload)
        }
    }

    /// Create a pending task with no handler
    ///
    /// Running an unbound task terminates it.
    pub fn unbound(
        id: impl Into<String>,
        topic: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            id: id.into(),
            topic: topic.into(),
            payload: payload.into(),
            deliveries: 1,
            state: TaskState::Pending,
            diagnostic: None,
            canceled: false,
            handler: None,
        }
    }

    /// Set how many times the queue has delivered this job
    pub fn with_deliveries(mut self, deliveries: u32) -> Self {
        self.deliveries = deliveries.max(1);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn deliveries(&self) -> u32 {
        self.deliveries
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Fault description recorded when the task terminated
    pub fn diagnostic(&self) -> Option<&str> {
        self.diagnostic.as_deref()
    }

    pub fn is_bound(&self) -> bool {
        self.handler.is_some()
    }

    pub fn is_complete(&self) -> bool {
        self.state == TaskState::Complete
    }

    pub fn is_terminated(&self) -> bool {
        self.state == TaskState::Terminated
    }

    /// Terminated without a handler verdict: canceled, unstacked or aborted
    pub fn is_canceled(&self) -> bool {
        self.canceled
    }

    /// Bind the handler used by [`Task::run`]
    pub fn bind(&mut self, handler: Arc<dyn TaskHandler>) {
        self.handler = Some(handler);
    }

    /// Execute the bound handler
    ///
    /// Faults (an error or a panic) are captured here and never re-raised.
    /// A task that already reached a terminal state is left untouched.
    pub async fn run(&mut self) {
        if self.state.is_terminal() {
            return;
        }

        let Some(handler) = self.handler.clone() else {
            self.terminate(format!("no handler bound for topic '{}'", self.topic));
            return;
        };

        self.state = TaskState::Running;

        let outcome = AssertUnwindSafe(handler.handle(&self.id, &self.payload))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(())) => self.complete(),
            Ok(Err(error)) => self.terminate(error.to_string()),
            Err(panic) => self.terminate(format!("handler panicked: {}", panic_message(&*panic))),
        }
    }

    /// Mark the task terminated as faulted
    ///
    /// Has no effect once the task is terminal.
    pub fn terminate(&mut self, diagnostic: impl Into<String>) {
        if self.state.is_terminal() {
            return;
        }
        self.state = TaskState::Terminated;
        self.diagnostic = Some(diagnostic.into());
    }

    /// Mark the task terminated before its handler could finish
    ///
    /// A canceled task is not a fault of the job and never counts towards a
    /// delivery limit. Has no effect once the task is terminal.
    pub fn cancel(&mut self, diagnostic: impl Into<String>) {
        if self.state.is_terminal() {
            return;
        }
        self.terminate(diagnostic);
        self.canceled = true;
    }

    fn complete(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.state = TaskState::Complete;
    }

    /// Serializable projection of this task
    pub fn to_record(&self) -> TaskRecord {
        TaskRecord {
            id: self.id.clone(),
            topic: self.topic.clone(),
            payload: self.payload.clone(),
            deliveries: self.deliveries,
            state: self.state,
            diagnostic: self.diagnostic.clone(),
            canceled: self.canceled,
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("payload_len", &self.payload.len())
            .field("deliveries", &self.deliveries)
            .field("state", &self.state)
            .field("diagnostic", &self.diagnostic)
            .field("canceled", &self.canceled)
            .field("bound", &self.handler.is_some())
            .finish()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Wire form of a task
///
/// The handler is not part of the record; the receiving side re-binds it
/// from its own registry by topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub topic: String,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
    pub deliveries: u32,
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub canceled: bool,
}

impl TaskRecord {
    /// Rebuild an unbound task from its record
    pub fn into_task(self) -> Task {
        Task {
            id: self.id,
            topic: self.topic,
            payload: self.payload,
            deliveries: self.deliveries,
            state: self.state,
            diagnostic: self.diagnostic,
            canceled: self.canceled,
            handler: None,
        }
    }
}

/// Serde support for byte payloads as base64 strings
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
