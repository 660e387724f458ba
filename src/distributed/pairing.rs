/*!
 * Service discovery and pairing with remote workers.
 *
 * Discovery borrows a pooled channel to the worker (proving it is reachable
 * and that we can authenticate), then asks the worker's HTTP API for its
 * providers and health. The resulting `RemoteService` records are the
 * registry the distributed coordinator and the version manager work from.
 */

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use parking_lot::RwLock;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::app_config::{ServiceProtocol, WorkerDescriptor};
use crate::distributed::version_manager::VersionInfo;
use crate::distributed::worker_pool::WorkerPool;
use crate::errors::TranslationError;
use crate::events::{Event, EventBus, EventType};

pub const PROVIDERS_PATH: &str = "/api/v1/providers";
pub const HEALTH_PATH: &str = "/health";

/// Lifecycle of a worker service.
///
/// `Discovered` on first contact, `Paired` once its capabilities are known,
/// `Updating` while an update runs, then back to `Paired` or to
/// `Outdated`/`Unreachable` when the worker lags or stops answering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Unknown,
    Discovered,
    Paired,
    Updating,
    Outdated,
    Unreachable,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Discovered => "discovered",
            Self::Paired => "paired",
            Self::Updating => "updating",
            Self::Outdated => "outdated",
            Self::Unreachable => "unreachable",
        }
    }
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a worker can do
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    pub providers: Vec<String>,
    pub max_concurrent: usize,
    pub supports_batch: bool,
    /// Models per provider, when the worker lists them
    #[serde(default)]
    pub models: BTreeMap<String, Vec<String>>,
}

/// A worker's translation API as seen from here
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteService {
    pub worker_id: String,
    pub host: String,
    pub port: u16,
    pub protocol: ServiceProtocol,
    pub status: ServiceStatus,
    pub capabilities: Capabilities,
    #[serde(default)]
    pub version: Option<VersionInfo>,
    #[serde(default)]
    pub uptime_secs: Option<u64>,
    pub last_seen: DateTime<Utc>,
}

impl RemoteService {
    pub fn new(worker: &WorkerDescriptor) -> Self {
        Self {
            worker_id: worker.id.clone(),
            host: worker.host.clone(),
            port: worker.service_port,
            protocol: worker.service_protocol,
            status: ServiceStatus::Unknown,
            capabilities: Capabilities {
                max_concurrent: worker.max_capacity,
                supports_batch: true,
                ..Capabilities::default()
            },
            version: None,
            uptime_secs: None,
            last_seen: Utc::now(),
        }
    }

    /// `{protocol}://{host}:{port}`
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.host, self.port)
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url(), path)
    }

    pub fn codebase_version(&self) -> Option<&str> {
        self.version.as_ref().map(|v| v.codebase_version.as_str())
    }
}

#[derive(Debug, Deserialize)]
struct HealthResponse {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    uptime: Option<u64>,
}

/// Provider names and models from either `{providers: {name: {models}}}`
/// or `{providers: [name]}`
pub fn parse_providers(body: &Value) -> Result<(Vec<String>, BTreeMap<String, Vec<String>>), TranslationError> {
    let mut names = Vec::new();
    let mut models = BTreeMap::new();
    match body.get("providers") {
        Some(Value::Object(map)) => {
            for (name, info) in map {
                names.push(name.clone());
                let list: Vec<String> = info
                    .get("models")
                    .and_then(Value::as_array)
                    .map(|a| a.iter().filter_map(Value::as_str).map(str::to_string).collect())
                    .unwrap_or_default();
                models.insert(name.clone(), list);
            }
        }
        Some(Value::Array(list)) => {
            names.extend(list.iter().filter_map(Value::as_str).map(str::to_string));
        }
        _ => {
            return Err(TranslationError::InvalidResponse(
                "providers response has no providers field".to_string(),
            ));
        }
    }
    Ok((names, models))
}

pub struct PairingManager {
    pool: Arc<WorkerPool>,
    client: Client,
    events: EventBus,
    workers: RwLock<HashMap<String, WorkerDescriptor>>,
    services: RwLock<HashMap<String, RemoteService>>,
}

impl PairingManager {
    pub fn new(pool: Arc<WorkerPool>, workers: Vec<WorkerDescriptor>, timeout: Duration, events: EventBus) -> Self {
        Self {
            pool,
            client: Client::builder().timeout(timeout).build().unwrap_or_default(),
            events,
            workers: RwLock::new(workers.into_iter().map(|w| (w.id.clone(), w)).collect()),
            services: RwLock::new(HashMap::new()),
        }
    }

    pub fn add_worker(&self, worker: WorkerDescriptor) {
        self.workers.write().insert(worker.id.clone(), worker);
    }

    pub fn worker(&self, worker_id: &str) -> Option<WorkerDescriptor> {
        self.workers.read().get(worker_id).cloned()
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Reach the worker and record what its service offers
    pub async fn discover_service(
        &self,
        worker_id: &str,
        cancel: &CancellationToken,
    ) -> Result<RemoteService, TranslationError> {
        let worker = self
            .worker(worker_id)
            .ok_or_else(|| TranslationError::ServiceNotFound(worker_id.to_string()))?;
        if !worker.enabled {
            return Err(TranslationError::ServiceNotFound(format!("{} (disabled)", worker_id)));
        }

        let lease = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TranslationError::Cancelled),
            lease = self.pool.get(worker_id, &worker) => lease.map_err(|e| match e {
                TranslationError::NoAuth(_) | TranslationError::Cancelled => e,
                other => TranslationError::Connection(format!("failed to get SSH connection: {}", other)),
            })?,
        };

        let queried = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TranslationError::Cancelled),
            result = self.query_service_info(&worker) => result,
        };
        self.pool.release(lease);

        match queried {
            Ok(mut service) => {
                if let Some(previous) = self.get_service(worker_id) {
                    service.version = previous.version;
                }
                info!(
                    "Discovered worker {} at {} with providers {:?}",
                    worker_id,
                    service.base_url(),
                    service.capabilities.providers
                );
                self.services.write().insert(worker_id.to_string(), service.clone());
                self.events.publish(
                    Event::new(EventType::ServiceDiscovered, format!("Discovered service on {}", worker_id))
                        .with_data("worker_id", worker_id)
                        .with_data("url", service.base_url())
                        .with_data("providers", service.capabilities.providers.clone()),
                );
                Ok(service)
            }
            Err(e) if e.is_cancelled() => Err(e),
            Err(e) => {
                warn!("Service on worker {} is unreachable: {}", worker_id, e);
                if let Some(service) = self.services.write().get_mut(worker_id) {
                    service.status = ServiceStatus::Unreachable;
                }
                let error = TranslationError::Connection(format!("failed to check service status: {}", e));
                self.events.publish(
                    Event::new(EventType::ServiceUnreachable, format!("Worker {} unreachable", worker_id))
                        .with_data("worker_id", worker_id)
                        .with_error(&error),
                );
                Err(error)
            }
        }
    }

    /// Discover a worker and mark its service paired
    pub async fn pair_service(
        &self,
        worker_id: &str,
        cancel: &CancellationToken,
    ) -> Result<RemoteService, TranslationError> {
        let mut service = self.discover_service(worker_id, cancel).await?;
        service.status = ServiceStatus::Paired;
        self.services.write().insert(worker_id.to_string(), service.clone());
        self.events.publish(
            Event::new(EventType::ServicePaired, format!("Paired with {}", worker_id))
                .with_data("worker_id", worker_id)
                .with_data("url", service.base_url()),
        );
        Ok(service)
    }

    /// Discover every enabled worker, returning the ones that answered
    pub async fn discover_all(&self, cancel: &CancellationToken) -> Vec<RemoteService> {
        let ids: Vec<String> = self
            .workers
            .read()
            .values()
            .filter(|w| w.enabled)
            .map(|w| w.id.clone())
            .collect();
        let mut found = Vec::new();
        for id in ids {
            match self.discover_service(&id, cancel).await {
                Ok(service) => found.push(service),
                Err(e) => debug!("Skipping worker {}: {}", id, e),
            }
        }
        found
    }

    /// Query `/api/v1/providers` and `/health`; on failure returns the last error
    pub async fn query_service_info(&self, worker: &WorkerDescriptor) -> Result<RemoteService, TranslationError> {
        let mut service = RemoteService::new(worker);
        let mut last_error = None;

        match self.get_json(&service.url(PROVIDERS_PATH)).await.and_then(|body| parse_providers(&body)) {
            Ok((providers, models)) => {
                service.capabilities.providers = providers;
                service.capabilities.models = models;
            }
            Err(e) => last_error = Some(e),
        }

        match self.get_json(&service.url(HEALTH_PATH)).await {
            Ok(body) => match serde_json::from_value::<HealthResponse>(body) {
                Ok(health) => {
                    debug!("Worker {} health: {:?}", worker.id, health.status);
                    service.uptime_secs = health.uptime;
                }
                Err(e) => last_error = Some(TranslationError::InvalidResponse(e.to_string())),
            },
            Err(e) => last_error = Some(e),
        }

        if let Some(error) = last_error {
            return Err(error);
        }
        service.status = ServiceStatus::Discovered;
        service.last_seen = Utc::now();
        Ok(service)
    }

    async fn get_json(&self, url: &str) -> Result<Value, TranslationError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| TranslationError::Connection(format!("GET {} failed: {}", url, e)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(TranslationError::Connection(format!(
                "GET {} returned status {}",
                url,
                status.as_u16()
            )));
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| TranslationError::InvalidResponse(format!("{}: {}", url, e)))
    }

    pub fn get_service(&self, worker_id: &str) -> Option<RemoteService> {
        self.services.read().get(worker_id).cloned()
    }

    /// Store a service record, replacing any previous one for the worker
    pub fn update_service(&self, service: RemoteService) {
        self.services.write().insert(service.worker_id.clone(), service);
    }

    pub fn remove_service(&self, worker_id: &str) -> Option<RemoteService> {
        self.services.write().remove(worker_id)
    }

    pub fn list_services(&self) -> Vec<RemoteService> {
        let mut services: Vec<RemoteService> = self.services.read().values().cloned().collect();
        services.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        services
    }
}

impl std::fmt::Debug for PairingManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairingManager")
            .field("workers", &self.workers.read().len())
            .field("services", &self.services.read().len())
            .finish()
    }
}
