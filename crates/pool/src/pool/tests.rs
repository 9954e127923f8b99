use super::*;
use crate::adapter::InMemoryQueue;
use crate::channel::TransportKind;
use crate::config::WorkerConfig;
use crate::task::{handler_fn, HandlerError};

fn config(size: usize) -> PoolConfig {
    PoolConfig::new(size)
        .with_listen_timeout(Duration::from_millis(50))
        .with_capacity_backoff(Duration::from_millis(5))
        .with_shutdown_timeout(Duration::from_secs(5))
        .with_worker(
            WorkerConfig::default()
                .with_transport(TransportKind::Memory)
                .with_idle_backoff(Duration::from_millis(1)),
        )
}

async fn queue() -> Arc<InMemoryQueue> {
    let queue = Arc::new(InMemoryQueue::new());
    queue
        .register("ok", handler_fn(|_, _| async { Ok(()) }))
        .await
        .unwrap();
    queue
        .register(
            "fail",
            handler_fn(|_, _| async { Err(HandlerError::new("refused")) }),
        )
        .await
        .unwrap();
    queue
        .register(
            "slow",
            handler_fn(|_, _| async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(())
            }),
        )
        .await
        .unwrap();
    queue
        .register(
            "hang",
            handler_fn(|_, _| async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }),
        )
        .await
        .unwrap();
    queue
}

async fn reserve(queue: &InMemoryQueue, topic: &str) -> Task {
    queue.put(topic, "payload");
    queue
        .listen(Duration::from_millis(100))
        .await
        .unwrap()
        .expect("job should be reserved")
}

/// Collect until nothing is outstanding
async fn settle(pool: &mut Pool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while pool.collect().await > 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[test]
fn test_select_slot_prefers_free_candidate() {
    assert_eq!(select_slot(3, 2, &[]), 0);
    assert_eq!(select_slot(3, 0, &[(0, 4)]), 1);
}

#[test]
fn test_select_slot_least_loaded() {
    // Candidate is slot 1 with load 0; nothing is strictly smaller
    assert_eq!(select_slot(3, 0, &[(0, 2), (1, 0), (2, 1)]), 1);
    // Candidate slot 2 is busier than slot 0
    assert_eq!(select_slot(3, 1, &[(0, 1), (1, 3), (2, 2)]), 0);
}

#[test]
fn test_select_slot_ties_keep_earlier_choice() {
    assert_eq!(select_slot(3, 0, &[(0, 1), (1, 1), (2, 1)]), 1);
    assert_eq!(select_slot(3, 1, &[(0, 0), (1, 0), (2, 5)]), 0);
}

#[test]
fn test_select_slot_skips_stopping_workers() {
    assert_eq!(select_slot(2, 1, &[(0, usize::MAX), (1, 3)]), 1);
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let queue = queue().await;
    let result = Pool::new(PoolConfig::new(0), queue);
    assert!(matches!(result, Err(PoolError::InvalidConfig(_))));
}

#[test_log::test(tokio::test)]
async fn test_submit_starts_workers_lazily() {
    let queue = queue().await;
    let mut pool = Pool::new(config(3), queue.clone()).unwrap();
    assert_eq!(pool.worker_count(), 0);
    assert_eq!(pool.status(), PoolStatus::Starting);

    let mut slots = Vec::new();
    for _ in 0..4 {
        let task = reserve(&queue, "slow").await;
        slots.push(pool.submit(task).unwrap());
    }

    assert_eq!(slots, vec![0, 1, 2, 0]);
    assert_eq!(pool.worker_count(), 3);
    assert_eq!(pool.outstanding(), 4);
    assert_eq!(pool.last_slot(), 0);
    assert_eq!(pool.stats().workers_started, 3);

    settle(&mut pool).await;
    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_live_workers_never_exceed_size() {
    let queue = queue().await;
    let mut pool = Pool::new(config(2), queue.clone()).unwrap();

    for _ in 0..10 {
        let task = reserve(&queue, "slow").await;
        pool.submit(task).unwrap();
        assert!(pool.worker_count() <= 2);
    }

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_submit_to_missing_slot_fails() {
    let queue = queue().await;
    let mut pool = Pool::new(config(3), queue.clone()).unwrap();
    let task = reserve(&queue, "ok").await;

    let result = pool.submit_to(2, task);
    assert!(matches!(result, Err(PoolError::Submission { slot: 2 })));
    assert_eq!(pool.stats().submitted, 0);
}

#[tokio::test]
async fn test_collect_reports_outcomes_to_queue() {
    let queue = queue().await;
    let mut pool = Pool::new(config(2), queue.clone()).unwrap();

    pool.submit(reserve(&queue, "ok").await).unwrap();
    pool.submit(reserve(&queue, "fail").await).unwrap();
    settle(&mut pool).await;

    let stats = pool.stats();
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.retried, 1);
    assert_eq!(stats.outstanding, 0);

    let queue_stats = queue.stats();
    assert_eq!(queue_stats.completed, 1);
    assert_eq!(queue_stats.retried, 1);
    assert_eq!(queue_stats.ready, 1);

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_max_deliveries_deletes_failed_job() {
    let queue = queue().await;
    let mut pool = Pool::new(config(1).with_max_deliveries(1), queue.clone()).unwrap();

    pool.submit(reserve(&queue, "fail").await).unwrap();
    settle(&mut pool).await;

    assert_eq!(pool.stats().deleted, 1);
    assert_eq!(pool.stats().retried, 0);
    assert_eq!(queue.stats().deleted, 1);
    assert!(queue.is_drained());

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_custom_collector() {
    let queue = queue().await;
    let mut pool = Pool::new(config(1), queue.clone()).unwrap();
    pool.submit(reserve(&queue, "ok").await).unwrap();

    let mut seen = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(5);
    while seen.is_empty() && Instant::now() < deadline {
        pool.collect_with(|task| {
            seen.push(task.id().to_string());
            true
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(seen.len(), 1);
    assert_eq!(pool.outstanding(), 0);
    // Nothing was relayed by the custom collector
    assert_eq!(queue.stats().completed, 0);

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_idle_workers_are_reclaimed() {
    let queue = queue().await;
    let mut pool = Pool::new(config(2), queue.clone()).unwrap();

    pool.submit(reserve(&queue, "ok").await).unwrap();
    pool.submit(reserve(&queue, "ok").await).unwrap();
    assert_eq!(pool.worker_count(), 2);
    settle(&mut pool).await;

    pool.reclaim().await;

    assert_eq!(pool.worker_count(), 0);
    assert_eq!(pool.stats().workers_reclaimed, 2);
    assert_eq!(pool.stats().dropped, 0);

    // A new submission starts a fresh worker
    pool.submit(reserve(&queue, "ok").await).unwrap();
    assert_eq!(pool.worker_count(), 1);
    settle(&mut pool).await;
    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_busy_workers_are_not_reclaimed() {
    let queue = queue().await;
    let mut pool = Pool::new(config(1), queue.clone()).unwrap();

    pool.submit(reserve(&queue, "slow").await).unwrap();
    pool.reclaim().await;
    assert_eq!(pool.worker_count(), 1);

    settle(&mut pool).await;
    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_drains_and_joins() {
    let queue = queue().await;
    let mut pool = Pool::new(config(3), queue.clone()).unwrap();

    let mut slots = Vec::new();
    for _ in 0..6 {
        slots.push(pool.submit(reserve(&queue, "slow").await).unwrap());
    }
    assert_eq!(slots, vec![0, 1, 2, 0, 1, 2]);
    assert_eq!(pool.worker_count(), 3);

    pool.shutdown().await.unwrap();

    let stats = pool.stats();
    assert_eq!(pool.status(), PoolStatus::Stopped);
    assert_eq!(stats.workers, 0);
    assert_eq!(stats.workers_started, 3);
    assert_eq!(stats.workers_reclaimed, 3);
    assert_eq!(stats.completed + stats.retried, 6);
    assert_eq!(stats.dropped, 0);
    assert_eq!(queue.stats().reserved, 0);

    // A second shutdown is a no-op
    pool.shutdown().await.unwrap();
    assert_eq!(pool.stats().workers_reclaimed, 3);
}

#[tokio::test]
async fn test_canceled_tasks_are_retried_despite_delivery_limit() {
    let queue = queue().await;
    let mut pool = Pool::new(config(1).with_max_deliveries(1), queue.clone()).unwrap();

    pool.submit(reserve(&queue, "slow").await).unwrap();
    // Let the worker pick up the slow task so the next one stays queued
    tokio::time::sleep(Duration::from_millis(50)).await;
    pool.submit(reserve(&queue, "ok").await).unwrap();
    pool.shutdown().await.unwrap();

    let stats = pool.stats();
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.retried, 1);
    assert_eq!(stats.deleted, 0);

    let queue_stats = queue.stats();
    assert_eq!(queue_stats.deleted, 0);
    assert_eq!(queue_stats.retried, 1);
    assert_eq!(queue_stats.ready, 1);
}

#[tokio::test]
async fn test_shutdown_terminates_stuck_worker() {
    let queue = queue().await;
    let mut pool = Pool::new(
        config(1).with_shutdown_timeout(Duration::from_millis(100)),
        queue.clone(),
    )
    .unwrap();

    pool.submit(reserve(&queue, "hang").await).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    pool.shutdown().await.unwrap();

    let stats = pool.stats();
    assert_eq!(stats.retried, 1);
    assert_eq!(stats.workers, 0);
    assert_eq!(queue.stats().ready, 1);
}

#[tokio::test]
async fn test_resize_stops_excess_workers() {
    let queue = queue().await;
    let mut pool = Pool::new(config(3), queue.clone()).unwrap();
    for _ in 0..3 {
        pool.submit(reserve(&queue, "ok").await).unwrap();
    }
    settle(&mut pool).await;

    pool.resize(1).unwrap();
    assert!(pool.worker(1).unwrap().is_stopping());
    assert!(pool.worker(2).unwrap().is_stopping());

    let deadline = Instant::now() + Duration::from_secs(5);
    while pool.worker_count() > 1 && Instant::now() < deadline {
        pool.reap_exited().await;
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(pool.slots(), vec![0]);

    // New submissions stay within the new size
    let slot = pool.submit(reserve(&queue, "ok").await).unwrap();
    assert_eq!(slot, 0);
    assert!(pool.resize(0).is_err());

    settle(&mut pool).await;
    pool.shutdown().await.unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn test_socket_pair_transport() {
    let queue = queue().await;
    let mut pool = Pool::new(config(2).with_transport(TransportKind::SocketPair), queue.clone())
        .unwrap();

    for topic in ["ok", "fail", "ok"] {
        pool.submit(reserve(&queue, topic).await).unwrap();
    }
    settle(&mut pool).await;

    assert_eq!(pool.stats().completed, 2);
    assert_eq!(pool.stats().retried, 1);
    pool.shutdown().await.unwrap();
}
