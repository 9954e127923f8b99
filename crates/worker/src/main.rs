//! jobpool worker daemon
//!
//! Runs a pool against an in-memory queue seeded from the command line.

mod handlers;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use jobpool::channel::TransportKind;
use jobpool::telemetry::{init_telemetry, TelemetryConfig};
use jobpool::{InMemoryQueue, Pool, PoolConfig};
use tracing::{info, warn};

/// Job pool worker - runs queued jobs on isolated worker threads
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Maximum number of workers
    #[arg(short = 'n', long, env = "POOL_SIZE")]
    size: Option<usize>,

    /// Jobs buffered per worker
    #[arg(long, env = "POOL_BUFFER_FACTOR")]
    buffer_factor: Option<usize>,

    /// Worker transport: socket or memory
    #[arg(long, env = "WORKER_TRANSPORT")]
    transport: Option<TransportKind>,

    /// Number of jobs to seed
    #[arg(short, long, default_value_t = 0)]
    jobs: usize,

    /// Topic for seeded jobs (echo, sleep, fail)
    #[arg(short, long, default_value = "echo")]
    topic: String,

    /// Payload for seeded jobs
    #[arg(short, long, default_value = "")]
    payload: String,

    /// Reservation lease in seconds
    #[arg(long, default_value_t = 60)]
    lease_secs: u64,

    /// Stop once every job has been completed or deleted
    #[arg(long)]
    exit_when_idle: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    // Configure via environment variables:
    // - RUST_LOG or LOG_LEVEL: Log filter (default: "jobpool=info,jobpool_worker=info")
    let mut telemetry_config = TelemetryConfig::from_env();
    telemetry_config.service_name = "jobpool-worker".to_string();
    if telemetry_config.log_filter.is_none() {
        telemetry_config.log_filter = Some("jobpool=info,jobpool_worker=info".to_string());
    }
    init_telemetry(telemetry_config);

    let mut config = PoolConfig::from_env();
    if let Some(size) = args.size {
        config.size = size;
    }
    if let Some(factor) = args.buffer_factor {
        config.buffer_factor = factor;
    }
    if let Some(transport) = args.transport {
        config.worker.transport = transport;
    }
    config.validate().context("Invalid pool configuration")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pool_id = %config.pool_id,
        size = config.size,
        buffer_factor = config.buffer_factor,
        transport = %config.worker.transport,
        "Starting jobpool worker"
    );

    let queue = Arc::new(InMemoryQueue::with_lease(Duration::from_secs(args.lease_secs)));
    handlers::register_builtin(queue.as_ref())
        .await
        .context("Failed to register handlers")?;
    info!("Registered built-in handlers: echo, sleep, fail");

    for _ in 0..args.jobs {
        queue.put(args.topic.as_str(), args.payload.as_bytes());
    }
    if args.jobs > 0 {
        info!(jobs = args.jobs, topic = %args.topic, "Seeded queue");
    }

    let mut pool = Pool::new(config, queue.clone()).context("Failed to create pool")?;
    let stop = pool.stop_token();

    {
        let stop = stop.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received shutdown signal");
                    stop.cancel();
                }
                Err(e) => warn!(error = %e, "Failed to listen for shutdown signal"),
            }
        });
    }

    if args.exit_when_idle {
        let stop = stop.clone();
        let queue = Arc::clone(&queue);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(100));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if queue.is_drained() {
                            info!("Queue drained, stopping");
                            stop.cancel();
                            break;
                        }
                    }
                    _ = stop.cancelled() => break,
                }
            }
        });
    }

    pool.run().await.context("Pool failed")?;

    let stats = pool.stats();
    info!(
        submitted = stats.submitted,
        completed = stats.completed,
        retried = stats.retried,
        deleted = stats.deleted,
        dropped = stats.dropped,
        uptime_secs = stats.uptime_secs,
        "Worker shutdown complete"
    );
    Ok(())
}
