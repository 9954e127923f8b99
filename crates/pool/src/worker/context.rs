//! Worker-side execution loop
//!
//! Runs on the worker's own OS thread inside a current-thread runtime. The
//! only links to the pool are the channel endpoint and the control-signal
//! receiver.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::signal::ControlSignal;
use crate::channel::{Channel, Message};
use crate::task::{HandlerRegistry, Task};

/// Clean exit after stop-and-drain
pub const EXIT_CLEAN: i32 = 0;
/// The runtime could not be built
pub const EXIT_RUNTIME_FAILURE: i32 = 1;
/// Exited on terminate-now
pub const EXIT_TERMINATED: i32 = 2;
/// The pool endpoint or signal sender went away
pub const EXIT_ORPHANED: i32 = 3;

/// Diagnostic for tasks canceled by stop-and-drain
pub const CANCELED: &str = "canceled";
/// Diagnostic for tasks returned by an unstack request
pub const UNSTACKED: &str = "unstacked";
/// Diagnostic for a running task aborted by terminate-now
pub const ABORTED: &str = "aborted by terminate signal";

pub(crate) struct ExecutionContext {
    slot: usize,
    channel: Channel,
    signals: watch::Receiver<ControlSignal>,
    handlers: HandlerRegistry,
    idle_backoff: Duration,
    queue: VecDeque<Task>,
    exit_code: Option<i32>,
}

impl ExecutionContext {
    pub(crate) fn new(
        slot: usize,
        channel: Channel,
        signals: watch::Receiver<ControlSignal>,
        handlers: HandlerRegistry,
        idle_backoff: Duration,
    ) -> Self {
        Self {
            slot,
            channel,
            signals,
            handlers,
            idle_backoff,
            queue: VecDeque::new(),
            exit_code: None,
        }
    }

    /// Thread entry point; returns the exit code
    pub(crate) fn main(self) -> i32 {
        let slot = self.slot;
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                error!(slot, error = %e, "Failed to build worker runtime");
                return EXIT_RUNTIME_FAILURE;
            }
        };

        runtime.block_on(self.run().instrument(info_span!("worker", slot)))
    }

    async fn run(mut self) -> i32 {
        info!(
            topics = ?self.handlers.topics(),
            "Worker context started"
        );

        loop {
            self.drain_inbound();
            self.apply_signal();
            if let Some(code) = self.exit_code {
                self.flush_remaining().await;
                info!(exit_code = code, "Worker context exiting");
                return code;
            }

            match self.queue.pop_front() {
                Some(task) => {
                    let task = self.execute(task).await;
                    self.send_back(&task);
                    self.touch_queued();
                }
                None => tokio::time::sleep(self.idle_backoff).await,
            }
        }
    }

    /// Move every available inbound message into the local queue
    fn drain_inbound(&mut self) {
        if self.channel.pending_output() > 0 && self.channel.flush().is_err() {
            debug!("Deferred results not delivered");
        }

        while let Some(message) = self.channel.try_recv() {
            match message {
                Message::Task(mut task) => {
                    match self.handlers.resolve(task.topic()) {
                        Some(handler) => task.bind(handler),
                        None => warn!(
                            task_id = %task.id(),
                            topic = %task.topic(),
                            "No handler for topic in worker registry"
                        ),
                    }
                    debug!(task_id = %task.id(), queued = self.queue.len() + 1, "Task stacked");
                    self.queue.push_back(task);
                }
                Message::Unstack => match self.queue.pop_front() {
                    Some(mut task) => {
                        task.cancel(UNSTACKED);
                        debug!(task_id = %task.id(), "Task unstacked");
                        self.send_back(&task);
                    }
                    None => debug!("Unstack requested with an empty queue"),
                },
            }
        }

        if self.channel.is_closed() && self.exit_code.is_none() {
            warn!(dropped = self.queue.len(), "Pool endpoint closed");
            self.queue.clear();
            self.exit_code = Some(EXIT_ORPHANED);
        }
    }

    fn apply_signal(&mut self) {
        if self.exit_code.is_some() {
            return;
        }

        let signal = *self.signals.borrow_and_update();
        match signal {
            ControlSignal::Run => {
                if self.signals.has_changed().is_err() {
                    warn!(dropped = self.queue.len(), "Signal sender dropped");
                    self.queue.clear();
                    self.exit_code = Some(EXIT_ORPHANED);
                }
            }
            ControlSignal::StopAndDrain => {
                let canceled = self.queue.len();
                while let Some(mut task) = self.queue.pop_front() {
                    task.cancel(CANCELED);
                    self.send_back(&task);
                }
                info!(canceled, "Stop requested, queue drained");
                self.exit_code = Some(EXIT_CLEAN);
            }
            ControlSignal::TerminateNow => {
                for task in self.queue.drain(..) {
                    warn!(task_id = %task.id(), topic = %task.topic(), "Dropping queued task on terminate");
                }
                self.exit_code = Some(EXIT_TERMINATED);
            }
        }
    }

    /// Run one task; terminate-now aborts it at its next await point
    async fn execute(&mut self, mut task: Task) -> Task {
        let mut signals = self.signals.clone();

        let aborted = {
            let run = task.run();
            tokio::pin!(run);
            tokio::select! {
                _ = &mut run => false,
                _ = terminate_requested(&mut signals) => true,
            }
        };

        if aborted {
            warn!(task_id = %task.id(), "Running task aborted");
            task.cancel(ABORTED);
        } else if task.is_terminated() {
            warn!(
                task_id = %task.id(),
                diagnostic = task.diagnostic().unwrap_or_default(),
                "Task faulted"
            );
        } else {
            debug!(task_id = %task.id(), "Task complete");
        }

        task
    }

    /// Write out deferred results before exiting
    ///
    /// Ends early if the pool endpoint goes away.
    async fn flush_remaining(&mut self) {
        while self.channel.pending_output() > 0 {
            if self.channel.flush().is_err() {
                warn!("Pool endpoint closed with results still pending");
                return;
            }
            if self.channel.pending_output() > 0 {
                tokio::time::sleep(self.idle_backoff).await;
            }
        }
    }

    fn send_back(&mut self, task: &Task) {
        if self.channel.send_task(task).is_err() {
            // Already logged by the channel
            debug!(task_id = %task.id(), "Result not delivered");
        }
    }

    /// Report every still-queued task so the pool can extend its lease
    fn touch_queued(&mut self) {
        for task in &self.queue {
            if self.channel.send_task(task).is_err() {
                break;
            }
        }
    }
}

async fn terminate_requested(signals: &mut watch::Receiver<ControlSignal>) {
    let requested = signals
        .wait_for(|signal| *signal == ControlSignal::TerminateNow)
        .await
        .is_ok();
    if !requested {
        std::future::pending::<()>().await;
    }
}
