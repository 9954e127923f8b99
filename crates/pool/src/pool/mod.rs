//! Worker pool
//!
//! Owns a bounded, sparse set of [`Worker`]s keyed by slot and drives them
//! from a single control loop against a [`QueueAdapter`].

mod stats;

pub use stats::{PoolStats, PoolStatus};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::adapter::{AdapterError, QueueAdapter};
use crate::channel::TransportError;
use crate::config::PoolConfig;
use crate::task::Task;
use crate::worker::Worker;
use stats::Counters;

/// Poll interval while waiting for a worker context to exit
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Worker pool errors
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// No worker can take the task in this slot
    #[error("no worker available in slot {slot}")]
    Submission { slot: usize },

    /// Execution context could not be created
    #[error("failed to start worker in slot {slot}: {source}")]
    WorkerSpawn {
        slot: usize,
        #[source]
        source: std::io::Error,
    },

    /// Channel failure
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A control signal could not reach the worker
    #[error("failed to deliver signal to worker in slot {slot}")]
    SignalDelivery { slot: usize },

    /// Queue adapter failure
    #[error("queue adapter error: {0}")]
    Adapter(#[from] AdapterError),

    /// Workers still running after the shutdown timeout
    #[error("{0} worker(s) did not stop within the shutdown timeout")]
    ShutdownTimeout(usize),

    /// Configuration rejected by validation
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Choose the slot for the next submission
///
/// Starts from the slot after `last`. If that slot is free it wins.
/// Otherwise the occupied slots are scanned in ascending order and the
/// choice moves to any slot with a strictly smaller load, so the smallest
/// load wins and ties keep the earlier choice. `loads` lists occupied slots
/// below `size` with their outstanding counts.
pub fn select_slot(size: usize, last: usize, loads: &[(usize, usize)]) -> usize {
    let candidate = (last + 1) % size;
    let Some(&(_, candidate_load)) = loads.iter().find(|(slot, _)| *slot == candidate) else {
        return candidate;
    };

    let mut best = candidate;
    let mut best_load = candidate_load;
    for &(slot, load) in loads {
        if load < best_load {
            best = slot;
            best_load = load;
        }
    }
    best
}

/// Pool of isolated workers fed by a queue adapter
///
/// # Example
///
/// ```ignore
/// let queue = Arc::new(InMemoryQueue::new());
/// queue.register("email", send_email).await?;
///
/// let mut pool = Pool::new(PoolConfig::new(4), queue)?;
/// let stop = pool.stop_token();
/// tokio::spawn(async move {
///     tokio::signal::ctrl_c().await.ok();
///     stop.cancel();
/// });
///
/// pool.run().await?;
/// ```
pub struct Pool {
    config: PoolConfig,
    adapter: Arc<dyn QueueAdapter>,
    workers: BTreeMap<usize, Worker>,
    last: usize,
    status: PoolStatus,
    stop: CancellationToken,
    counters: Counters,
    started_at: chrono::DateTime<Utc>,
}

impl Pool {
    /// Create a pool; no worker is started until the first submission
    pub fn new(config: PoolConfig, adapter: Arc<dyn QueueAdapter>) -> Result<Self, PoolError> {
        config.validate()?;
        let last = config.size - 1;

        Ok(Self {
            config,
            adapter,
            workers: BTreeMap::new(),
            last,
            status: PoolStatus::Starting,
            stop: CancellationToken::new(),
            counters: Counters::default(),
            started_at: Utc::now(),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn status(&self) -> PoolStatus {
        self.status
    }

    /// Token that ends [`Pool::run`] when cancelled
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Ask [`Pool::run`] to exit after its current iteration
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Slot used by the most recent submission
    pub fn last_slot(&self) -> usize {
        self.last
    }

    /// Number of live workers
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Occupied slots in ascending order
    pub fn slots(&self) -> Vec<usize> {
        self.workers.keys().copied().collect()
    }

    pub fn worker(&self, slot: usize) -> Option<&Worker> {
        self.workers.get(&slot)
    }

    /// Tasks handed to workers and not yet finished, across the pool
    pub fn outstanding(&self) -> usize {
        self.workers.values().map(Worker::outstanding).sum()
    }

    /// Snapshot of pool counters
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            pool_id: self.config.pool_id.clone(),
            status: self.status,
            size: self.config.size,
            workers: self.workers.len(),
            outstanding: self.outstanding(),
            submitted: self.counters.submitted,
            completed: self.counters.completed,
            retried: self.counters.retried,
            touched: self.counters.touched,
            deleted: self.counters.deleted,
            dropped: self.counters.dropped,
            workers_started: self.counters.workers_started,
            workers_reclaimed: self.counters.workers_reclaimed,
            started_at: self.started_at,
            uptime_secs: (Utc::now() - self.started_at).num_seconds(),
        }
    }

    /// Submit a task to the least-loaded slot, starting a worker if needed
    ///
    /// Returns the slot the task went to.
    pub fn submit(&mut self, task: Task) -> Result<usize, PoolError> {
        let size = self.config.size;
        let loads: Vec<(usize, usize)> = self
            .workers
            .range(..size)
            .map(|(slot, worker)| {
                let load = if worker.is_stopping() {
                    usize::MAX
                } else {
                    worker.outstanding()
                };
                (*slot, load)
            })
            .collect();

        let slot = select_slot(size, self.last, &loads);
        if !self.workers.contains_key(&slot) {
            self.start_worker(slot)?;
        }

        self.submit_to(slot, task)?;
        Ok(slot)
    }

    /// Submit a task to a specific slot
    ///
    /// Fails if the slot has no worker or the worker is shutting down.
    /// Returns the worker's new outstanding count.
    pub fn submit_to(&mut self, slot: usize, task: Task) -> Result<usize, PoolError> {
        let worker = match self.workers.get_mut(&slot) {
            Some(worker) if !worker.is_stopping() => worker,
            _ => return Err(PoolError::Submission { slot }),
        };

        let task_id = task.id().to_string();
        let outstanding = worker.stack(task)?;
        self.last = slot;
        self.counters.submitted += 1;
        debug!(slot, %task_id, outstanding, "Task submitted");
        Ok(outstanding)
    }

    fn start_worker(&mut self, slot: usize) -> Result<(), PoolError> {
        let worker = Worker::start(slot, &self.config.worker, self.adapter.handlers())?;
        self.workers.insert(slot, worker);
        self.counters.workers_started += 1;
        Ok(())
    }

    /// Drain results from every worker and report them to the queue
    ///
    /// Completed tasks are acknowledged, terminated tasks retried and
    /// non-terminal tasks touched. A faulted task whose delivery count has
    /// reached `max_deliveries` is deleted instead; canceled tasks are always
    /// retried. Returns the pool-wide outstanding count.
    pub async fn collect(&mut self) -> usize {
        let mut results = Vec::new();
        let outstanding = self.collect_with(|task| {
            let finished = task.state().is_terminal();
            results.push(task);
            finished
        });

        for task in results {
            self.relay(task).await;
        }
        outstanding
    }

    /// Drain results from every worker through a custom collector
    ///
    /// A collector returning `true` marks the task as finished.
    pub fn collect_with<F>(&mut self, mut collector: F) -> usize
    where
        F: FnMut(Task) -> bool,
    {
        self.workers
            .values_mut()
            .map(|worker| worker.collect(&mut collector))
            .sum()
    }

    /// Report one task's outcome to the queue
    async fn relay(&mut self, task: Task) {
        let adapter = Arc::clone(&self.adapter);

        let result = if task.is_complete() {
            self.counters.completed += 1;
            adapter.complete(&task).await
        } else if task.is_terminated() {
            let exhausted = !task.is_canceled()
                && self
                    .config
                    .max_deliveries
                    .is_some_and(|max| task.deliveries() >= max);
            if task.is_canceled() {
                debug!(
                    task_id = %task.id(),
                    diagnostic = task.diagnostic().unwrap_or_default(),
                    "Task returned unfinished"
                );
            } else {
                warn!(
                    task_id = %task.id(),
                    topic = %task.topic(),
                    deliveries = task.deliveries(),
                    diagnostic = task.diagnostic().unwrap_or_default(),
                    exhausted,
                    "Task terminated"
                );
            }
            if exhausted {
                self.counters.deleted += 1;
                adapter.delete(&task).await
            } else {
                self.counters.retried += 1;
                adapter.retry(&task).await
            }
        } else {
            self.counters.touched += 1;
            adapter.touch(&task).await
        };

        if let Err(e) = result {
            warn!(task_id = %task.id(), error = %e, "Failed to report task outcome to queue");
        }
    }

    /// Run until the stop token is cancelled, then shut down
    ///
    /// Per-job and per-worker failures are logged and never end the loop.
    /// Only a failure to start the very first worker is returned.
    #[instrument(skip(self), fields(pool_id = %self.config.pool_id))]
    pub async fn run(&mut self) -> Result<(), PoolError> {
        self.status = PoolStatus::Running;
        info!(
            size = self.config.size,
            buffer_factor = self.config.buffer_factor,
            transport = %self.config.worker.transport,
            "Pool running"
        );

        let stop = self.stop.clone();
        let adapter = Arc::clone(&self.adapter);

        while !stop.is_cancelled() {
            if self.config.capacity() > self.outstanding() {
                let listened = tokio::select! {
                    result = adapter.listen(self.config.listen_timeout) => Some(result),
                    _ = stop.cancelled() => None,
                };

                match listened {
                    None => break,
                    Some(Ok(Some(task))) => {
                        let task_id = task.id().to_string();
                        if let Err(e) = self.submit(task) {
                            if matches!(e, PoolError::WorkerSpawn { .. })
                                && self.counters.workers_started == 0
                            {
                                error!(error = %e, "Failed to start the first worker");
                                self.shutdown().await.ok();
                                return Err(e);
                            }
                            warn!(%task_id, error = %e, "Submission failed, job left for lease redelivery");
                        }
                    }
                    Some(Ok(None)) => {
                        if !self.workers.is_empty() {
                            self.reclaim().await;
                        }
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "Queue listen failed");
                        self.backoff(&stop).await;
                    }
                }
            } else {
                self.reap_exited().await;
                self.backoff(&stop).await;
            }

            self.collect().await;
        }

        if let Err(e) = self.shutdown().await {
            error!(error = %e, "Pool shutdown incomplete");
        }
        Ok(())
    }

    async fn backoff(&self, stop: &CancellationToken) {
        tokio::select! {
            _ = tokio::time::sleep(self.config.capacity_backoff) => {}
            _ = stop.cancelled() => {}
        }
    }

    /// Shut down idle workers and reap exited ones
    async fn reclaim(&mut self) {
        let idle: Vec<usize> = self
            .workers
            .iter()
            .filter(|(_, worker)| worker.outstanding() == 0 && !worker.is_stopping())
            .map(|(slot, _)| *slot)
            .collect();

        for slot in idle {
            if let Err(e) = self.shutdown_worker(slot) {
                error!(slot, error = %e, "Idle worker kept for next cycle");
                continue;
            }

            match self.wait_for_exit(slot, self.config.shutdown_timeout).await {
                Some(_) => {
                    debug!(slot, "Idle worker reclaimed");
                    self.retire(slot).await;
                }
                None => warn!(slot, "Idle worker did not exit in time, kept for next cycle"),
            }
        }

        self.reap_exited().await;
    }

    /// Remove workers whose context has exited
    async fn reap_exited(&mut self) {
        let exited: Vec<usize> = self
            .workers
            .iter()
            .filter(|(_, worker)| worker.is_shutdown())
            .map(|(slot, _)| *slot)
            .collect();

        for slot in exited {
            if let Some(worker) = self.workers.get_mut(&slot) {
                if !worker.is_stopping() {
                    error!(slot, outstanding = worker.outstanding(), "Worker exited unexpectedly");
                }
                worker.join();
            }
            self.retire(slot).await;
        }
    }

    /// Deliver stop-and-drain to one worker
    pub fn shutdown_worker(&mut self, slot: usize) -> Result<(), PoolError> {
        let worker = self
            .workers
            .get_mut(&slot)
            .ok_or(PoolError::Submission { slot })?;
        if worker.shutdown() {
            Ok(())
        } else {
            Err(PoolError::SignalDelivery { slot })
        }
    }

    /// Wait for a stopping worker's context to exit, relaying its results
    ///
    /// Returns `None` if it is still running at the deadline, otherwise
    /// whether it exited cleanly.
    async fn wait_for_exit(&mut self, slot: usize, timeout: Duration) -> Option<bool> {
        let deadline = Instant::now() + timeout;

        loop {
            let worker = self.workers.get_mut(&slot)?;
            let exited = worker.is_shutdown();

            let mut results = Vec::new();
            worker.collect(|task| {
                let finished = task.state().is_terminal();
                results.push(task);
                finished
            });
            let clean = exited.then(|| worker.join());

            for task in results {
                self.relay(task).await;
            }

            if clean.is_some() {
                return clean;
            }
            if Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }
    }

    /// Remove a worker, relaying any last results and logging dropped tasks
    async fn retire(&mut self, slot: usize) {
        let Some(mut worker) = self.workers.remove(&slot) else {
            return;
        };

        let mut results = Vec::new();
        let outstanding = worker.collect(|task| {
            let finished = task.state().is_terminal();
            results.push(task);
            finished
        });
        for task in results {
            self.relay(task).await;
        }

        if outstanding > 0 {
            warn!(slot, dropped = outstanding, "Worker removed with outstanding tasks");
            self.counters.dropped += outstanding as u64;
        }
        self.counters.workers_reclaimed += 1;
    }

    /// Change the maximum number of workers
    ///
    /// Workers in slots at or above the new size are asked to stop and are
    /// removed once their context exits.
    pub fn resize(&mut self, size: usize) -> Result<(), PoolError> {
        if size == 0 {
            return Err(PoolError::InvalidConfig("size must be at least 1".into()));
        }

        info!(from = self.config.size, to = size, "Resizing pool");
        self.config.size = size;

        let excess: Vec<usize> = self.workers.range(size..).map(|(slot, _)| *slot).collect();
        for slot in excess {
            if let Err(e) = self.shutdown_worker(slot) {
                warn!(slot, error = %e, "Failed to stop worker beyond new size");
            }
        }
        Ok(())
    }

    /// Stop and join every worker
    ///
    /// Workers get `shutdown_timeout` to drain; one that is still running
    /// is sent terminate-now and given the same timeout again. Tasks still
    /// outstanding afterwards are logged as dropped.
    #[instrument(skip(self), fields(pool_id = %self.config.pool_id))]
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if self.status == PoolStatus::Stopped {
            return Ok(());
        }

        self.status = PoolStatus::Draining;
        info!(workers = self.workers.len(), outstanding = self.outstanding(), "Shutting down pool");

        for worker in self.workers.values_mut() {
            worker.shutdown();
        }
        self.collect().await;

        let timeout = self.config.shutdown_timeout;
        let mut stuck = 0;
        for slot in self.slots() {
            if self.wait_for_exit(slot, timeout).await.is_some() {
                self.counters.workers_reclaimed += 1;
                continue;
            }

            warn!(slot, "Worker did not stop in time, terminating");
            if let Some(worker) = self.workers.get_mut(&slot) {
                worker.terminate();
            }
            match self.wait_for_exit(slot, timeout).await {
                Some(_) => self.counters.workers_reclaimed += 1,
                None => {
                    error!(slot, "Worker did not exit after terminate, detaching");
                    stuck += 1;
                }
            }
        }

        self.collect().await;

        for (slot, worker) in &self.workers {
            if worker.outstanding() > 0 {
                warn!(slot, dropped = worker.outstanding(), "Tasks dropped at shutdown");
                self.counters.dropped += worker.outstanding() as u64;
            }
        }
        self.workers.clear();
        self.status = PoolStatus::Stopped;

        let stats = self.stats();
        info!(
            submitted = stats.submitted,
            completed = stats.completed,
            retried = stats.retried,
            dropped = stats.dropped,
            "Pool stopped"
        );

        if stuck > 0 {
            return Err(PoolError::ShutdownTimeout(stuck));
        }
        Ok(())
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            warn!(workers = self.workers.len(), "Pool dropped without shutdown");
        }
    }
}

#[cfg(test)]
mod tests;
