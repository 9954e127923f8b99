//! In-memory queue with lease semantics
//!
//! Behaves like a small tube-based broker: jobs are put on a topic, a
//! reservation holds a job for a lease period, and a job whose lease runs
//! out goes back to the ready queue.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{AdapterError, QueueAdapter};
use crate::task::{HandlerRegistry, Task, TaskHandler};

/// Default reservation lease
pub const DEFAULT_LEASE: Duration = Duration::from_secs(60);

struct Job {
    id: u64,
    topic: String,
    payload: Vec<u8>,
    deliveries: u32,
}

struct Reservation {
    job: Job,
    deadline: Instant,
}

/// Queue operation, recorded in order
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "id", rename_all = "snake_case")]
pub enum QueueEvent {
    Put(u64),
    Reserved(u64),
    Completed(u64),
    Retried(u64),
    Touched(u64),
    Deleted(u64),
    Expired(u64),
}

/// Queue counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub ready: usize,
    pub reserved: usize,
    pub completed: u64,
    pub retried: u64,
    pub touched: u64,
    pub deleted: u64,
    pub expired: u64,
}

#[derive(Default)]
struct QueueState {
    next_id: u64,
    ready: VecDeque<Job>,
    reserved: HashMap<u64, Reservation>,
    watched: HashSet<String>,
    events: Vec<QueueEvent>,
    stats: QueueStats,
}

impl QueueState {
    fn reclaim_expired(&mut self, now: Instant) {
        let expired: Vec<u64> = self
            .reserved
            .iter()
            .filter(|(_, reservation)| reservation.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            if let Some(reservation) = self.reserved.remove(&id) {
                debug!(job_id = id, "Lease expired, job back on the ready queue");
                self.ready.push_back(reservation.job);
                self.events.push(QueueEvent::Expired(id));
                self.stats.expired += 1;
            }
        }
    }

    /// Reserve the first ready job on a watched topic
    fn reserve(&mut self, lease: Duration, now: Instant) -> Option<(u64, String, Vec<u8>, u32)> {
        let position = self
            .ready
            .iter()
            .position(|job| self.watched.contains(&job.topic))?;
        let mut job = self.ready.remove(position)?;
        job.deliveries += 1;

        let reserved = (job.id, job.topic.clone(), job.payload.clone(), job.deliveries);
        self.events.push(QueueEvent::Reserved(job.id));
        self.reserved.insert(
            job.id,
            Reservation {
                job,
                deadline: now + lease,
            },
        );
        Some(reserved)
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.reserved.values().map(|r| r.deadline).min()
    }

    fn take_reservation(&mut self, task: &Task) -> Result<Reservation, AdapterError> {
        let id = parse_id(task)?;
        self.reserved
            .remove(&id)
            .ok_or_else(|| AdapterError::NotReserved(task.id().to_string()))
    }
}

fn parse_id(task: &Task) -> Result<u64, AdapterError> {
    task.id()
        .parse()
        .map_err(|_| AdapterError::NotReserved(task.id().to_string()))
}

/// In-memory [`QueueAdapter`]
///
/// # Example
///
/// ```ignore
/// let queue = Arc::new(InMemoryQueue::new());
/// queue.register("email", handler_fn(|_, _| async { Ok(()) })).await?;
/// queue.put("email", b"hello".to_vec());
/// ```
pub struct InMemoryQueue {
    state: Mutex<QueueState>,
    handlers: RwLock<HandlerRegistry>,
    notify: Notify,
    lease: Duration,
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryQueue {
    /// Create a queue with the default lease
    pub fn new() -> Self {
        Self::with_lease(DEFAULT_LEASE)
    }

    /// Create a queue with a custom lease
    pub fn with_lease(lease: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState {
                next_id: 1,
                ..Default::default()
            }),
            handlers: RwLock::new(HandlerRegistry::new()),
            notify: Notify::new(),
            lease,
        }
    }

    /// Add a job; returns its id
    pub fn put(&self, topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> u64 {
        let id = {
            let mut state = self.state.lock();
            let id = state.next_id;
            state.next_id += 1;
            state.ready.push_back(Job {
                id,
                topic: topic.into(),
                payload: payload.into(),
                deliveries: 0,
            });
            state.events.push(QueueEvent::Put(id));
            id
        };
        self.notify.notify_one();
        id
    }

    /// Watch a topic without binding a handler
    ///
    /// Jobs on the topic are reserved by `listen` but never handed out.
    pub fn watch(&self, topic: impl Into<String>) {
        self.state.lock().watched.insert(topic.into());
    }

    /// Current counters
    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        QueueStats {
            ready: state.ready.len(),
            reserved: state.reserved.len(),
            ..state.stats.clone()
        }
    }

    /// Operations recorded so far
    pub fn events(&self) -> Vec<QueueEvent> {
        self.state.lock().events.clone()
    }

    /// Whether no job is ready or reserved
    pub fn is_drained(&self) -> bool {
        let state = self.state.lock();
        state.ready.is_empty() && state.reserved.is_empty()
    }

    fn poll(&self) -> Poll {
        let now = Instant::now();
        let reserved = {
            let mut state = self.state.lock();
            state.reclaim_expired(now);
            match state.reserve(self.lease, now) {
                Some(reserved) => reserved,
                None => {
                    let wake_at = state.next_deadline().unwrap_or(now + self.lease);
                    return Poll::Empty(wake_at);
                }
            }
        };

        let (id, topic, payload, deliveries) = reserved;
        match self.handlers.read().resolve(&topic) {
            Some(handler) => Poll::Task(
                Task::new(id.to_string(), topic, payload, handler).with_deliveries(deliveries),
            ),
            None => {
                warn!(job_id = id, topic = %topic, "No handler registered for topic");
                Poll::Unhandled
            }
        }
    }
}

enum Poll {
    Task(Task),
    /// Reserved a job whose topic has no handler
    Unhandled,
    /// Nothing ready; wake no later than the next lease expiry
    Empty(Instant),
}

#[async_trait]
impl QueueAdapter for InMemoryQueue {
    async fn register(
        &self,
        topic: &str,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<(), AdapterError> {
        self.handlers.write().register(topic, handler);
        self.state.lock().watched.insert(topic.to_string());
        // Wake a listener that was waiting on an unwatched topic
        self.notify.notify_one();
        Ok(())
    }

    async fn unregister(&self, topic: &str) -> Result<(), AdapterError> {
        self.state.lock().watched.remove(topic);
        self.handlers.write().unregister(topic);
        Ok(())
    }

    async fn listen(&self, timeout: Duration) -> Result<Option<Task>, AdapterError> {
        let deadline = Instant::now() + timeout;

        loop {
            let next_expiry = match self.poll() {
                Poll::Task(task) => return Ok(Some(task)),
                Poll::Unhandled => return Ok(None),
                Poll::Empty(next_expiry) => next_expiry,
            };

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            let wake_at = deadline.min(next_expiry);
            // Either a put/retry notification or the next lease expiry
            let _ = tokio::time::timeout_at(wake_at, self.notify.notified()).await;
        }
    }

    async fn complete(&self, task: &Task) -> Result<(), AdapterError> {
        let mut state = self.state.lock();
        let reservation = state.take_reservation(task)?;
        state.events.push(QueueEvent::Completed(reservation.job.id));
        state.stats.completed += 1;
        Ok(())
    }

    async fn retry(&self, task: &Task) -> Result<(), AdapterError> {
        {
            let mut state = self.state.lock();
            let reservation = state.take_reservation(task)?;
            let id = reservation.job.id;
            state.ready.push_back(reservation.job);
            state.events.push(QueueEvent::Retried(id));
            state.stats.retried += 1;
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn touch(&self, task: &Task) -> Result<(), AdapterError> {
        let id = parse_id(task)?;
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let deadline = Instant::now() + self.lease;
        match state.reserved.get_mut(&id) {
            Some(reservation) => {
                reservation.deadline = deadline;
                state.events.push(QueueEvent::Touched(id));
                state.stats.touched += 1;
                Ok(())
            }
            None => Err(AdapterError::NotReserved(task.id().to_string())),
        }
    }

    async fn delete(&self, task: &Task) -> Result<(), AdapterError> {
        let mut state = self.state.lock();
        let reservation = state.take_reservation(task)?;
        state.events.push(QueueEvent::Deleted(reservation.job.id));
        state.stats.deleted += 1;
        Ok(())
    }

    fn handlers(&self) -> HandlerRegistry {
        self.handlers.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::handler_fn;

    fn ok_handler() -> Arc<dyn TaskHandler> {
        handler_fn(|_, _| async { Ok(()) })
    }

    #[tokio::test]
    async fn test_listen_returns_bound_task() {
        let queue = InMemoryQueue::new();
        queue.register("email", ok_handler()).await.unwrap();
        let id = queue.put("email", "hello");

        let task = queue.listen(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(task.id(), id.to_string());
        assert_eq!(task.topic(), "email");
        assert_eq!(task.payload(), b"hello");
        assert_eq!(task.deliveries(), 1);
        assert!(task.is_bound());

        let stats = queue.stats();
        assert_eq!(stats.ready, 0);
        assert_eq!(stats.reserved, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_listen_times_out_when_empty() {
        let queue = InMemoryQueue::new();
        queue.register("email", ok_handler()).await.unwrap();

        let started = Instant::now();
        let task = queue.listen(Duration::from_secs(5)).await.unwrap();
        assert!(task.is_none());
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_unwatched_topic_is_not_reserved() {
        let queue = InMemoryQueue::new();
        queue.register("email", ok_handler()).await.unwrap();
        queue.put("resize", "img");
        let id = queue.put("email", "hello");

        let task = queue.listen(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(task.id(), id.to_string());
        assert_eq!(queue.stats().ready, 1);
    }

    #[tokio::test]
    async fn test_watched_topic_without_handler_yields_none() {
        let queue = InMemoryQueue::new();
        queue.watch("resize");
        let id = queue.put("resize", "img");

        assert!(queue.listen(Duration::from_millis(10)).await.unwrap().is_none());
        assert_eq!(queue.events(), vec![QueueEvent::Put(id), QueueEvent::Reserved(id)]);
        assert_eq!(queue.stats().reserved, 1);
    }

    #[tokio::test]
    async fn test_unregister_stops_delivery() {
        let queue = InMemoryQueue::new();
        queue.register("email", ok_handler()).await.unwrap();
        queue.unregister("email").await.unwrap();
        queue.put("email", "hello");

        assert!(queue.listen(Duration::from_millis(10)).await.unwrap().is_none());
        assert!(queue.handlers().is_empty());
        assert_eq!(queue.stats().ready, 1);
    }

    #[tokio::test]
    async fn test_complete_retry_delete() {
        let queue = InMemoryQueue::new();
        queue.register("email", ok_handler()).await.unwrap();
        queue.put("email", "a");
        queue.put("email", "b");
        queue.put("email", "c");

        let a = queue.listen(Duration::ZERO).await.unwrap().unwrap();
        let b = queue.listen(Duration::ZERO).await.unwrap().unwrap();
        let c = queue.listen(Duration::ZERO).await.unwrap().unwrap();

        queue.complete(&a).await.unwrap();
        queue.retry(&b).await.unwrap();
        queue.delete(&c).await.unwrap();

        let stats = queue.stats();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.retried, 1);
        assert_eq!(stats.deleted, 1);
        assert_eq!(stats.ready, 1);
        assert_eq!(stats.reserved, 0);

        let again = queue.listen(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(again.id(), b.id());
        assert_eq!(again.deliveries(), 2);

        assert!(matches!(
            queue.complete(&a).await,
            Err(AdapterError::NotReserved(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lease_is_redelivered() {
        let queue = InMemoryQueue::with_lease(Duration::from_secs(1));
        queue.register("email", ok_handler()).await.unwrap();
        let id = queue.put("email", "hello");

        let first = queue.listen(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(first.deliveries(), 1);

        let second = queue.listen(Duration::from_secs(5)).await.unwrap().unwrap();
        assert_eq!(second.id(), id.to_string());
        assert_eq!(second.deliveries(), 2);
        assert!(queue.events().contains(&QueueEvent::Expired(id)));
        assert!(matches!(
            queue.touch(&Task::unbound("999", "email", "")).await,
            Err(AdapterError::NotReserved(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch_extends_lease() {
        let queue = InMemoryQueue::with_lease(Duration::from_secs(2));
        queue.register("email", ok_handler()).await.unwrap();
        queue.put("email", "hello");

        let task = queue.listen(Duration::ZERO).await.unwrap().unwrap();
        tokio::time::advance(Duration::from_millis(1500)).await;
        queue.touch(&task).await.unwrap();
        tokio::time::advance(Duration::from_millis(1500)).await;

        assert!(queue.listen(Duration::ZERO).await.unwrap().is_none());
        assert_eq!(queue.stats().touched, 1);
        assert_eq!(queue.stats().expired, 0);
    }

    #[tokio::test]
    async fn test_put_wakes_listener() {
        let queue = Arc::new(InMemoryQueue::new());
        queue.register("email", ok_handler()).await.unwrap();

        let listener = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.listen(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.put("email", "late");

        let task = listener.await.unwrap().unwrap().unwrap();
        assert_eq!(task.payload(), b"late");
    }
}
