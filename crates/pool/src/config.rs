//! Pool and worker configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::channel::TransportKind;
use crate::pool::PoolError;

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Pool ID used in logs (generated if not provided)
    pub pool_id: String,

    /// Maximum number of live workers
    pub size: usize,

    /// Tasks buffered per worker before the pool stops listening
    pub buffer_factor: usize,

    /// How long a single `listen` call may wait for a job
    #[serde(with = "duration_millis")]
    pub listen_timeout: Duration,

    /// Sleep between iterations while every slot is saturated
    #[serde(with = "duration_millis")]
    pub capacity_backoff: Duration,

    /// How long shutdown waits for each worker before terminating it
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,

    /// Delete instead of retry once a faulted job has been delivered this
    /// many times
    #[serde(default)]
    pub max_deliveries: Option<u32>,

    /// Settings applied to every worker the pool starts
    #[serde(default)]
    pub worker: WorkerConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_id: format!("pool-{}", Uuid::now_v7()),
            size: 4,
            buffer_factor: 1,
            listen_timeout: Duration::from_secs(5),
            capacity_backoff: Duration::from_millis(50),
            shutdown_timeout: Duration::from_secs(30),
            max_deliveries: None,
            worker: WorkerConfig::default(),
        }
    }
}

impl PoolConfig {
    /// Create a configuration with the given pool size
    pub fn new(size: usize) -> Self {
        Self {
            size,
            ..Default::default()
        }
    }

    /// Create configuration from environment variables
    ///
    /// Unset or unparsable variables keep their defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(size) = env_parse("POOL_SIZE") {
            config.size = size;
        }
        if let Some(factor) = env_parse("POOL_BUFFER_FACTOR") {
            config.buffer_factor = factor;
        }
        if let Some(secs) = env_parse::<u64>("POOL_LISTEN_TIMEOUT_SECS") {
            config.listen_timeout = Duration::from_secs(secs);
        }
        if let Some(max) = env_parse("POOL_MAX_DELIVERIES") {
            config.max_deliveries = Some(max);
        }
        if let Some(transport) = env_parse("WORKER_TRANSPORT") {
            config.worker.transport = transport;
        }

        config
    }

    /// Set the pool ID
    pub fn with_pool_id(mut self, id: impl Into<String>) -> Self {
        self.pool_id = id.into();
        self
    }

    /// Set the maximum number of workers
    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    /// Set the per-worker buffer factor
    pub fn with_buffer_factor(mut self, factor: usize) -> Self {
        self.buffer_factor = factor;
        self
    }

    /// Set the listen timeout
    pub fn with_listen_timeout(mut self, timeout: Duration) -> Self {
        self.listen_timeout = timeout;
        self
    }

    /// Set the at-capacity backoff
    pub fn with_capacity_backoff(mut self, backoff: Duration) -> Self {
        self.capacity_backoff = backoff;
        self
    }

    /// Set shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Set the delivery limit after which faulted jobs are deleted
    pub fn with_max_deliveries(mut self, max: u32) -> Self {
        self.max_deliveries = Some(max);
        self
    }

    /// Set worker configuration
    pub fn with_worker(mut self, worker: WorkerConfig) -> Self {
        self.worker = worker;
        self
    }

    /// Set the transport used by new workers
    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.worker.transport = transport;
        self
    }

    /// Jobs the pool may hold across all workers before it stops listening
    pub fn capacity(&self) -> usize {
        self.size.saturating_mul(self.buffer_factor)
    }

    /// Check the configuration before a pool is built from it
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.size == 0 {
            return Err(PoolError::InvalidConfig("size must be at least 1".into()));
        }
        if self.buffer_factor == 0 {
            return Err(PoolError::InvalidConfig(
                "buffer_factor must be at least 1".into(),
            ));
        }
        if self.max_deliveries == Some(0) {
            return Err(PoolError::InvalidConfig(
                "max_deliveries must be at least 1".into(),
            ));
        }
        if self.worker.thread_name.is_empty() {
            return Err(PoolError::InvalidConfig(
                "worker thread_name must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// Per-worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Byte transport under the worker's channel
    pub transport: TransportKind,

    /// Sleep when the worker has nothing queued
    #[serde(with = "duration_millis")]
    pub idle_backoff: Duration,

    /// Thread name prefix; the slot index is appended
    pub thread_name: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::default(),
            idle_backoff: Duration::from_millis(10),
            thread_name: "jobpool-worker".to_string(),
        }
    }
}

impl WorkerConfig {
    /// Set the transport
    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }

    /// Set the idle backoff
    pub fn with_idle_backoff(mut self, backoff: Duration) -> Self {
        self.idle_backoff = backoff;
        self
    }

    /// Set the thread name prefix
    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
