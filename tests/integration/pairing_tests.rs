/*!
 * Tests for worker discovery and pairing against mock worker services
 */

use std::sync::Arc;
use std::time::Duration;

use mockito::Server;
use tokio_util::sync::CancellationToken;

use ebook_translator::app_config::{PoolConfig, WorkerDescriptor};
use ebook_translator::distributed::{PairingManager, RemoteService, ServiceStatus, WorkerPool};
use ebook_translator::errors::TranslationError;
use ebook_translator::events::{EventBus, EventType};

use crate::common::fake_workers::FakeConnector;
use crate::common::{EventRecorder, health_body, http_worker, providers_body};

fn manager(connector: &Arc<FakeConnector>, workers: Vec<WorkerDescriptor>, events: EventBus) -> PairingManager {
    let pool = Arc::new(WorkerPool::new(connector.clone(), PoolConfig::default(), events.clone()));
    PairingManager::new(pool, workers, Duration::from_secs(2), events)
}

async fn healthy_worker(server: &mut Server) -> (mockito::Mock, mockito::Mock) {
    let providers = server
        .mock("GET", "/api/v1/providers")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(providers_body())
        .create_async()
        .await;
    let health = server
        .mock("GET", "/health")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(health_body())
        .create_async()
        .await;
    (providers, health)
}

#[tokio::test]
async fn test_discoverService_withHealthyWorker_shouldRecordCapabilities() {
    let mut server = Server::new_async().await;
    let (providers, health) = healthy_worker(&mut server).await;
    let connector = FakeConnector::new();
    let events = EventBus::new();
    let recorder = EventRecorder::attach(&events);
    let worker = http_worker("w1", &server.host_with_port());
    let pairing = manager(&connector, vec![worker], events);

    let service = pairing.discover_service("w1", &CancellationToken::new()).await.unwrap();

    assert_eq!(service.status, ServiceStatus::Discovered);
    assert_eq!(service.capabilities.providers, vec!["anthropic", "openai"]);
    assert_eq!(service.capabilities.models["openai"], vec!["gpt-4"]);
    assert_eq!(service.uptime_secs, Some(120));
    assert_eq!(service.base_url(), server.url());
    assert_eq!(pairing.get_service("w1"), Some(service));
    providers.assert_async().await;
    health.assert_async().await;

    // The channel was borrowed and handed back
    assert_eq!(connector.dials(), 1);
    assert_eq!(pairing.pool().stats().idle_connections, 1);
    let discovered = recorder.wait_for(EventType::ServiceDiscovered, 1, Duration::from_secs(1)).await;
    assert_eq!(discovered[0].data_str("worker_id"), Some("w1"));
}

#[tokio::test]
async fn test_pairService_shouldMarkServicePaired() {
    let mut server = Server::new_async().await;
    let _mocks = healthy_worker(&mut server).await;
    let connector = FakeConnector::new();
    let events = EventBus::new();
    let recorder = EventRecorder::attach(&events);
    let pairing = manager(&connector, vec![http_worker("w1", &server.host_with_port())], events);

    let service = pairing.pair_service("w1", &CancellationToken::new()).await.unwrap();
    assert_eq!(service.status, ServiceStatus::Paired);
    assert_eq!(pairing.get_service("w1").map(|s| s.status), Some(ServiceStatus::Paired));
    let paired = recorder.wait_for(EventType::ServicePaired, 1, Duration::from_secs(1)).await;
    assert_eq!(paired.len(), 1);
}

#[tokio::test]
async fn test_discoverService_withFailingHealthCheck_shouldReportUnreachable() {
    let mut server = Server::new_async().await;
    let _providers = server
        .mock("GET", "/api/v1/providers")
        .with_status(200)
        .with_body(providers_body())
        .create_async()
        .await;
    let _health = server.mock("GET", "/health").with_status(503).create_async().await;
    let connector = FakeConnector::new();
    let events = EventBus::new();
    let recorder = EventRecorder::attach(&events);
    let pairing = manager(&connector, vec![http_worker("w1", &server.host_with_port())], events);

    let result = pairing.discover_service("w1", &CancellationToken::new()).await;
    match result {
        Err(TranslationError::Connection(message)) => assert!(message.contains("failed to check service status")),
        other => panic!("expected a connection error, got {:?}", other),
    }
    assert_eq!(pairing.get_service("w1"), None);
    // The borrowed channel is released even on failure
    assert_eq!(pairing.pool().stats().active_connections, 0);
    let unreachable = recorder.wait_for(EventType::ServiceUnreachable, 1, Duration::from_secs(1)).await;
    assert_eq!(unreachable.len(), 1);
}

#[tokio::test]
async fn test_discoverService_withRefusedChannel_shouldNotQueryService() {
    let mut server = Server::new_async().await;
    let providers = server
        .mock("GET", "/api/v1/providers")
        .with_status(200)
        .with_body(providers_body())
        .expect(0)
        .create_async()
        .await;
    let connector = FakeConnector::new();
    connector.refuse_connections(true);
    let pairing = manager(&connector, vec![http_worker("w1", &server.host_with_port())], EventBus::new());

    let result = pairing.discover_service("w1", &CancellationToken::new()).await;
    match result {
        Err(TranslationError::Connection(message)) => assert!(message.contains("failed to get SSH connection")),
        other => panic!("expected a connection error, got {:?}", other),
    }
    providers.assert_async().await;
}

#[tokio::test]
async fn test_discoverService_withoutCredentials_shouldFailWithNoAuth() {
    let connector = FakeConnector::new();
    let bare = WorkerDescriptor::new("w1", "127.0.0.1", "translator");
    let pairing = manager(&connector, vec![bare], EventBus::new());

    let result = pairing.discover_service("w1", &CancellationToken::new()).await;
    assert!(matches!(result, Err(TranslationError::NoAuth(_))));
    assert_eq!(connector.dials(), 0);
}

#[tokio::test]
async fn test_discoverService_withUnknownWorker_shouldFailWithServiceNotFound() {
    let connector = FakeConnector::new();
    let pairing = manager(&connector, Vec::new(), EventBus::new());
    let result = pairing.discover_service("ghost", &CancellationToken::new()).await;
    assert!(matches!(result, Err(TranslationError::ServiceNotFound(id)) if id == "ghost"));
}

#[tokio::test]
async fn test_discoverAll_shouldSkipUnreachableAndDisabledWorkers() {
    let mut healthy = Server::new_async().await;
    let _mocks = healthy_worker(&mut healthy).await;
    let mut broken = Server::new_async().await;
    let _broken = broken.mock("GET", "/api/v1/providers").with_status(500).create_async().await;
    let _broken_health = broken.mock("GET", "/health").with_status(500).create_async().await;

    let mut disabled = http_worker("w3", &healthy.host_with_port());
    disabled.enabled = false;
    let connector = FakeConnector::new();
    let pairing = manager(
        &connector,
        vec![
            http_worker("w1", &healthy.host_with_port()),
            http_worker("w2", &broken.host_with_port()),
            disabled,
        ],
        EventBus::new(),
    );

    let found = pairing.discover_all(&CancellationToken::new()).await;
    let ids: Vec<&str> = found.iter().map(|s| s.worker_id.as_str()).collect();
    assert_eq!(ids, vec!["w1"]);
    assert_eq!(pairing.list_services().len(), 1);

    assert!(pairing.remove_service("w1").is_some());
    assert!(pairing.list_services().is_empty());
}

#[tokio::test]
async fn test_discoverService_whenKnownWorkerStopsAnswering_shouldMarkUnreachable() {
    let mut healthy = Server::new_async().await;
    let _mocks = healthy_worker(&mut healthy).await;
    let connector = FakeConnector::new();
    let worker = http_worker("w1", &healthy.host_with_port());
    let pairing = manager(&connector, vec![worker.clone()], EventBus::new());
    let cancel = CancellationToken::new();

    let service = pairing.discover_service("w1", &cancel).await.unwrap();
    assert_eq!(service.status, ServiceStatus::Discovered);
    assert_eq!(RemoteService::new(&worker).status, ServiceStatus::Unknown);

    let mut down = Server::new_async().await;
    let _providers = down.mock("GET", "/api/v1/providers").with_status(502).create_async().await;
    let _health = down.mock("GET", "/health").with_status(502).create_async().await;
    pairing.add_worker(http_worker("w1", &down.host_with_port()));

    assert!(pairing.discover_service("w1", &cancel).await.is_err());
    assert_eq!(pairing.get_service("w1").map(|s| s.status), Some(ServiceStatus::Unreachable));
}
