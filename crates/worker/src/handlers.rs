//! Built-in demo handlers

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jobpool::task::{HandlerResult, TaskHandler};
use jobpool::{AdapterError, HandlerError, QueueAdapter};
use serde::Deserialize;
use tracing::info;

/// Logs the payload and succeeds
pub struct EchoHandler;

#[async_trait]
impl TaskHandler for EchoHandler {
    async fn handle(&self, id: &str, payload: &[u8]) -> HandlerResult {
        info!(
            task_id = %id,
            payload = %String::from_utf8_lossy(payload),
            "echo"
        );
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct SleepRequest {
    #[serde(default = "default_sleep_ms")]
    ms: u64,
}

fn default_sleep_ms() -> u64 {
    1000
}

/// Sleeps for the requested time
///
/// Payload is `{"ms": 250}`, a bare number of milliseconds, or empty for
/// one second.
pub struct SleepHandler;

impl SleepHandler {
    fn duration(payload: &[u8]) -> Result<Duration, HandlerError> {
        if payload.iter().all(u8::is_ascii_whitespace) {
            return Ok(Duration::from_millis(default_sleep_ms()));
        }
        if let Ok(ms) = serde_json::from_slice::<u64>(payload) {
            return Ok(Duration::from_millis(ms));
        }
        let request: SleepRequest = serde_json::from_slice(payload)?;
        Ok(Duration::from_millis(request.ms))
    }
}

#[async_trait]
impl TaskHandler for SleepHandler {
    async fn handle(&self, id: &str, payload: &[u8]) -> HandlerResult {
        let duration = Self::duration(payload)?;
        tokio::time::sleep(duration).await;
        info!(task_id = %id, slept_ms = duration.as_millis() as u64, "sleep");
        Ok(())
    }
}

/// Always fails, with the payload as the message
pub struct FailHandler;

#[async_trait]
impl TaskHandler for FailHandler {
    async fn handle(&self, _id: &str, payload: &[u8]) -> HandlerResult {
        let message = if payload.is_empty() {
            "Intentional failure".to_string()
        } else {
            String::from_utf8_lossy(payload).into_owned()
        };
        Err(HandlerError::new(message).with_type("intentional"))
    }
}

/// Register echo, sleep and fail on a queue
pub async fn register_builtin(queue: &dyn QueueAdapter) -> Result<(), AdapterError> {
    queue.register("echo", Arc::new(EchoHandler)).await?;
    queue.register("sleep", Arc::new(SleepHandler)).await?;
    queue.register("fail", Arc::new(FailHandler)).await?;
    Ok(())
}
