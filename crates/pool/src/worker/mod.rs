//! Isolated workers
//!
//! A [`Worker`] is the pool-side handle of one execution context: a
//! dedicated OS thread running its own single-threaded runtime. The two
//! sides share no mutable state. Tasks travel over a framed [`Channel`] and
//! lifecycle requests over a one-way control-signal watch channel.
//!
//! ```text
//!  pool side                         worker thread
//! ┌──────────────┐   Channel     ┌──────────────────────┐
//! │ Worker       │──── task ────▶│ ExecutionContext     │
//! │  outstanding │◀── result ────│  FIFO queue          │
//! │  signals ────┼── watch ─────▶│  run loop            │
//! └──────────────┘               └──────────────────────┘
//! ```

mod context;
mod signal;

pub use context::{
    ABORTED, CANCELED, EXIT_CLEAN, EXIT_ORPHANED, EXIT_RUNTIME_FAILURE, EXIT_TERMINATED, UNSTACKED,
};
pub use signal::ControlSignal;

use std::thread::JoinHandle;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::channel::{Channel, Message, TransportError};
use crate::config::WorkerConfig;
use crate::pool::PoolError;
use crate::task::{HandlerRegistry, Task};
use context::ExecutionContext;
use signal::SignalSender;

/// Worker lifecycle as seen from the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    /// Context is being spawned
    Starting,
    /// Has outstanding tasks
    Running,
    /// Nothing outstanding
    Idle,
    /// Stop requested, waiting for the context to exit
    ShuttingDown,
    /// Context joined
    Terminated,
}

/// Pool-side handle of one execution context
pub struct Worker {
    slot: usize,
    channel: Channel,
    signals: SignalSender,
    handle: Option<JoinHandle<i32>>,
    exit_code: Option<i32>,
    outstanding: usize,
    status: WorkerStatus,
    started_at: DateTime<Utc>,
}

impl Worker {
    /// Spawn the execution context for `slot`
    ///
    /// The context receives its own snapshot of `handlers`. Returns once the
    /// thread is spawned, without waiting for it to run.
    pub fn start(
        slot: usize,
        config: &WorkerConfig,
        handlers: HandlerRegistry,
    ) -> Result<Self, PoolError> {
        let (channel, remote) = Channel::pair(config.transport).map_err(|e| match e {
            TransportError::Io(source) => PoolError::WorkerSpawn { slot, source },
            other => PoolError::Transport(other),
        })?;
        let (signals, receiver) = SignalSender::channel();

        let context =
            ExecutionContext::new(slot, remote, receiver, handlers, config.idle_backoff);
        let handle = std::thread::Builder::new()
            .name(format!("{}-{}", config.thread_name, slot))
            .spawn(move || context.main())
            .map_err(|source| PoolError::WorkerSpawn { slot, source })?;

        info!(slot, transport = %config.transport, "Worker started");

        Ok(Self {
            slot,
            channel,
            signals,
            handle: Some(handle),
            exit_code: None,
            outstanding: 0,
            status: WorkerStatus::Idle,
            started_at: Utc::now(),
        })
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Tasks sent minus terminal results received
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    pub fn status(&self) -> WorkerStatus {
        self.status
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Exit code of the context, once joined
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Bytes sent to the context but still waiting for transport space
    pub fn pending_output(&self) -> usize {
        self.channel.pending_output()
    }

    /// Hand a task to the context; returns the new outstanding count
    ///
    /// Never waits for the context. Bytes the transport cannot take yet are
    /// written by later [`Worker::collect`] calls. On failure the counter is
    /// unchanged and the task is lost to this worker.
    pub fn stack(&mut self, task: Task) -> Result<usize, PoolError> {
        self.channel.send_task(&task)?;
        self.outstanding += 1;
        if self.status == WorkerStatus::Idle {
            self.status = WorkerStatus::Running;
        }
        debug!(slot = self.slot, task_id = %task.id(), outstanding = self.outstanding, "Task sent to worker");
        Ok(self.outstanding)
    }

    /// Ask the context to return its front queued task unexecuted
    ///
    /// The task comes back through [`Worker::collect`] as terminated.
    pub fn unstack(&mut self) -> Result<(), PoolError> {
        self.channel.send(&Message::Unstack)?;
        Ok(())
    }

    /// Drain available results, applying `collector` to each task
    ///
    /// A collector returning `true` marks the task as finished with this
    /// worker. Returns the remaining outstanding count.
    pub fn collect<F>(&mut self, mut collector: F) -> usize
    where
        F: FnMut(Task) -> bool,
    {
        if self.channel.pending_output() > 0 {
            if let Err(e) = self.channel.flush() {
                warn!(slot = self.slot, error = %e, "Failed to flush deferred tasks");
            }
        }

        while let Some(message) = self.channel.try_recv() {
            match message {
                Message::Task(task) => {
                    if collector(task) {
                        self.outstanding = self.outstanding.saturating_sub(1);
                    }
                }
                Message::Unstack => {
                    warn!(slot = self.slot, "Ignoring unstack message from worker");
                }
            }
        }

        if self.outstanding == 0 && self.status == WorkerStatus::Running {
            self.status = WorkerStatus::Idle;
        }
        self.outstanding
    }

    /// Deliver stop-and-drain; returns whether the signal was delivered
    pub fn shutdown(&mut self) -> bool {
        let delivered = self.signals.raise(ControlSignal::StopAndDrain);
        if delivered {
            if self.status != WorkerStatus::Terminated {
                self.status = WorkerStatus::ShuttingDown;
            }
            debug!(slot = self.slot, "Stop signal delivered");
        } else {
            error!(slot = self.slot, "Failed to deliver stop signal, worker context is gone");
        }
        delivered
    }

    /// Deliver terminate-now; returns whether the signal was delivered
    pub fn terminate(&mut self) -> bool {
        let delivered = self.signals.raise(ControlSignal::TerminateNow);
        if delivered {
            if self.status != WorkerStatus::Terminated {
                self.status = WorkerStatus::ShuttingDown;
            }
            warn!(slot = self.slot, "Terminate signal delivered");
        } else {
            error!(slot = self.slot, "Failed to deliver terminate signal, worker context is gone");
        }
        delivered
    }

    /// Most recent signal raised for this worker
    pub fn signal(&self) -> ControlSignal {
        self.signals.current()
    }

    /// Whether a stop or terminate has been requested
    pub fn is_stopping(&self) -> bool {
        self.status == WorkerStatus::ShuttingDown || self.signal() != ControlSignal::Run
    }

    /// Whether the execution context is no longer alive
    pub fn is_shutdown(&self) -> bool {
        self.handle
            .as_ref()
            .map(|handle| handle.is_finished())
            .unwrap_or(true)
    }

    /// Block until the context exits; true iff it exited cleanly
    pub fn join(&mut self) -> bool {
        if let Some(handle) = self.handle.take() {
            let code = match handle.join() {
                Ok(code) => code,
                Err(_) => {
                    error!(slot = self.slot, "Worker thread panicked");
                    EXIT_RUNTIME_FAILURE
                }
            };
            if code != EXIT_CLEAN {
                warn!(slot = self.slot, exit_code = code, "Worker exited uncleanly");
            } else {
                debug!(slot = self.slot, "Worker joined");
            }
            self.exit_code = Some(code);
            self.status = WorkerStatus::Terminated;
        }
        self.exit_code == Some(EXIT_CLEAN)
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if self.handle.is_some() {
            // Detached: the context exits on its own once it sees the stop
            self.signals.raise(ControlSignal::StopAndDrain);
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("slot", &self.slot)
            .field("outstanding", &self.outstanding)
            .field("status", &self.status)
            .field("exit_code", &self.exit_code)
            .finish()
    }
}
