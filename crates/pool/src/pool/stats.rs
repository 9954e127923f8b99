//! Pool status and counters

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Pool status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolStatus {
    /// Created, run loop not entered yet
    Starting,
    /// Listening and dispatching
    Running,
    /// Stopping workers and flushing results
    Draining,
    /// Every worker joined
    Stopped,
}

impl std::fmt::Display for PoolStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Draining => write!(f, "draining"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

#[derive(Debug, Default)]
pub(super) struct Counters {
    pub submitted: u64,
    pub completed: u64,
    pub retried: u64,
    pub touched: u64,
    pub deleted: u64,
    pub dropped: u64,
    pub workers_started: u64,
    pub workers_reclaimed: u64,
}

/// Snapshot of pool state
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub pool_id: String,
    pub status: PoolStatus,
    pub size: usize,
    /// Live workers
    pub workers: usize,
    pub outstanding: usize,
    pub submitted: u64,
    pub completed: u64,
    pub retried: u64,
    pub touched: u64,
    pub deleted: u64,
    /// Tasks lost to worker exits or shutdown; left for lease redelivery
    pub dropped: u64,
    pub workers_started: u64,
    /// Workers stopped and joined, by reclamation, reaping or shutdown
    pub workers_reclaimed: u64,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,
}
