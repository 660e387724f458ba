/*!
 * Tests for the worker connection pool
 */

use std::sync::Arc;
use std::time::Duration;

use ebook_translator::app_config::{PoolConfig, WorkerAuth, WorkerDescriptor};
use ebook_translator::distributed::WorkerPool;
use ebook_translator::errors::TranslationError;
use ebook_translator::events::{EventBus, EventType};

use crate::common::EventRecorder;
use crate::common::fake_workers::FakeConnector;

fn worker(id: &str) -> WorkerDescriptor {
    let mut worker = WorkerDescriptor::new(id, "10.0.0.5", "translator");
    worker.auth = WorkerAuth {
        private_key: None,
        password: Some("secret".to_string()),
    };
    worker
}

fn pool_config(max_per_worker: usize) -> PoolConfig {
    PoolConfig {
        max_connections_per_worker: max_per_worker,
        ..PoolConfig::default()
    }
}

fn pool(connector: &Arc<FakeConnector>, config: PoolConfig, events: EventBus) -> WorkerPool {
    WorkerPool::new(connector.clone(), config, events)
}

#[tokio::test]
async fn test_get_withoutAuth_shouldFailWithoutDialing() {
    let connector = FakeConnector::new();
    let pool = pool(&connector, pool_config(2), EventBus::new());
    let bare = WorkerDescriptor::new("w1", "10.0.0.5", "translator");

    let result = pool.get("w1", &bare).await;
    assert!(matches!(result, Err(TranslationError::NoAuth(id)) if id == "w1"));
    assert_eq!(connector.dials(), 0);
}

#[tokio::test]
async fn test_get_afterRelease_shouldReuseConnection() {
    let connector = FakeConnector::new();
    let events = EventBus::new();
    let recorder = EventRecorder::attach(&events);
    let pool = pool(&connector, pool_config(2), events);
    let w1 = worker("w1");

    let lease = pool.get("w1", &w1).await.unwrap();
    assert_eq!(lease.worker_id(), "w1");
    pool.release(lease);
    let again = pool.get("w1", &w1).await.unwrap();
    pool.release(again);

    assert_eq!(connector.dials(), 1);
    let stats = pool.stats();
    assert_eq!(stats.total_connections, 1);
    assert_eq!(stats.idle_connections, 1);
    assert_eq!(stats.workers, 1);
    let opened = recorder.wait_for(EventType::ConnectionOpened, 1, Duration::from_secs(1)).await;
    assert_eq!(opened[0].data_str("worker_id"), Some("w1"));
}

#[tokio::test]
async fn test_get_atCapacity_shouldReportLimit() {
    let connector = FakeConnector::new();
    let pool = pool(&connector, pool_config(2), EventBus::new());
    let w1 = worker("w1");

    let first = pool.get("w1", &w1).await.unwrap();
    let second = pool.get("w1", &w1).await.unwrap();
    let third = pool.get("w1", &w1).await;
    match third {
        Err(TranslationError::Connection(message)) => assert!(message.contains("connection limit of 2")),
        other => panic!("expected a capacity error, got {:?}", other),
    }

    // Other workers have their own budget
    let other = pool.get("w2", &worker("w2")).await.unwrap();
    assert_eq!(pool.stats().active_connections, 3);

    pool.release(first);
    pool.release(second);
    pool.release(other);
    assert_eq!(pool.stats().active_connections, 0);
}

#[tokio::test]
async fn test_get_withDialFailure_shouldFreeReservation() {
    let connector = FakeConnector::new();
    let pool = pool(&connector, pool_config(1), EventBus::new());
    let w1 = worker("w1");

    connector.refuse_connections(true);
    assert!(matches!(pool.get("w1", &w1).await, Err(TranslationError::Connection(_))));

    connector.refuse_connections(false);
    let lease = pool.get("w1", &w1).await.unwrap();
    pool.release(lease);
    assert_eq!(connector.dials(), 2);
}

#[tokio::test]
async fn test_get_withDeadIdleConnection_shouldDialFresh() {
    let connector = FakeConnector::new();
    let pool = pool(&connector, pool_config(2), EventBus::new());
    let w1 = worker("w1");

    let lease = pool.get("w1", &w1).await.unwrap();
    pool.release(lease);
    connector.opened()[0].kill();

    let lease = pool.get("w1", &w1).await.unwrap();
    assert_eq!(connector.dials(), 2);
    assert!(connector.opened()[0].is_closed());
    assert_eq!(pool.stats().total_connections, 1);
    pool.release(lease);
}

#[tokio::test]
async fn test_sweep_withIdleTimeoutElapsed_shouldEvictIdleOnly() {
    let connector = FakeConnector::new();
    let events = EventBus::new();
    let recorder = EventRecorder::attach(&events);
    let config = PoolConfig {
        connection_idle_timeout_secs: 0,
        ..pool_config(2)
    };
    let pool = pool(&connector, config, events);
    let w1 = worker("w1");

    let busy = pool.get("w1", &w1).await.unwrap();
    let idle = pool.get("w1", &w1).await.unwrap();
    pool.release(idle);

    assert_eq!(pool.sweep(), 1);
    assert_eq!(pool.stats().total_connections, 1);
    assert_eq!(pool.stats().active_connections, 1);
    let evicted = recorder.wait_for(EventType::ConnectionEvicted, 1, Duration::from_secs(1)).await;
    assert_eq!(evicted[0].data_str("reason"), Some("idle"));
    pool.release(busy);
}

#[tokio::test]
async fn test_remove_withBorrowedConnection_shouldCloseOnRelease() {
    let connector = FakeConnector::new();
    let pool = pool(&connector, pool_config(2), EventBus::new());
    let w1 = worker("w1");

    let busy = pool.get("w1", &w1).await.unwrap();
    let idle = pool.get("w1", &w1).await.unwrap();
    pool.release(idle);

    pool.remove("w1");
    let opened = connector.opened();
    let closed: Vec<bool> = opened.iter().map(|c| c.is_closed()).collect();
    assert_eq!(closed.iter().filter(|c| **c).count(), 1);
    assert_eq!(pool.stats().total_connections, 1);

    pool.release(busy);
    assert!(opened.iter().all(|c| c.is_closed()));
    assert_eq!(pool.stats().total_connections, 0);

    // A fresh lease does not reuse the retired slot
    let lease = pool.get("w1", &w1).await.unwrap();
    assert_eq!(connector.dials(), 3);
    pool.release(lease);
}

#[tokio::test]
async fn test_close_shouldCloseEverythingAndRefuseNewLeases() {
    let connector = FakeConnector::new();
    let pool = pool(&connector, pool_config(2), EventBus::new());
    let lease = pool.get("w1", &worker("w1")).await.unwrap();
    pool.release(lease);

    pool.close();
    assert!(connector.opened().iter().all(|c| c.is_closed()));
    assert_eq!(pool.stats().total_connections, 0);
    assert_eq!(pool.stats().workers, 0);
    match pool.get("w1", &worker("w1")).await {
        Err(TranslationError::Connection(message)) => assert!(message.contains("closed")),
        other => panic!("expected a closed-pool error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_spawnSweeper_afterDrop_shouldStop() {
    let connector = FakeConnector::new();
    let config = PoolConfig {
        cleanup_interval_secs: 1,
        ..pool_config(1)
    };
    let pool = Arc::new(pool(&connector, config, EventBus::new()));
    let handle = pool.spawn_sweeper();
    drop(pool);
    tokio::time::timeout(Duration::from_secs(3), handle)
        .await
        .expect("sweeper should exit once the pool is gone")
        .unwrap();
}

#[tokio::test]
async fn test_get_whenDialIsAbandoned_shouldReleaseReservation() {
    let connector = FakeConnector::new();
    let pool = pool(&connector, pool_config(1), EventBus::new());
    let w1 = worker("w1");

    connector.hang_connections(true);
    let abandoned = tokio::time::timeout(Duration::from_millis(20), pool.get("w1", &w1)).await;
    assert!(abandoned.is_err());
    assert_eq!(connector.dials(), 1);

    connector.hang_connections(false);
    let lease = tokio::time::timeout(Duration::from_millis(500), pool.get("w1", &w1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(connector.dials(), 2);
    assert_eq!(pool.stats().active_connections, 1);
    pool.release(lease);
}
