/*!
 * Distributed translation coordinator.
 *
 * Translates a book on remote workers. Each unit goes to the next available
 * remote instance in round-robin order after the worker passes the version
 * gate. When every instance has been tried the unit falls back to the local
 * coordinator and then to the dictionary.
 */

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::app_config::{CircuitBreakerConfig, Config, CoordinatorConfig, RemoteInstanceConfig};
use crate::book::{Book, TranslationUnit};
use crate::distributed::alerts::DriftAlert;
use crate::distributed::pairing::{PairingManager, RemoteService};
use crate::distributed::version_manager::VersionManager;
use crate::distributed::worker_pool::WorkerPool;
use crate::errors::TranslationError;
use crate::events::EventBus;
use crate::providers::Prompt;
use crate::providers::dictionary::Dictionary;
use crate::resilience::fallback::LOCAL_FALLBACK;
use crate::resilience::{CircuitBreaker, FallbackManager, FallbackStrategy};
use crate::translation::coordinator::{LocalCoordinator, UnitFallback};
use crate::translation::walker::{BookWalker, JobContext, TranslationReport, UnitOutcome, UnitSource, UnitTranslator};

pub const TRANSLATE_PATH: &str = "/api/v1/translate";

/// Fallback manager component id for the remote path
pub const REMOTE_COMPONENT: &str = "remote_instances";

/// A provider and model served by one worker
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemoteInstance {
    pub worker_id: String,
    pub provider: String,
    pub model: String,
    pub available: bool,
    pub last_used: Option<DateTime<Utc>>,
}

impl RemoteInstance {
    pub fn new(worker_id: &str, provider: &str, model: &str) -> Self {
        Self {
            worker_id: worker_id.to_string(),
            provider: provider.to_string(),
            model: model.to_string(),
            available: true,
            last_used: None,
        }
    }
}

impl From<&RemoteInstanceConfig> for RemoteInstance {
    fn from(config: &RemoteInstanceConfig) -> Self {
        Self::new(&config.worker_id, &config.provider, &config.model)
    }
}

#[derive(Debug, Serialize)]
struct RemoteTranslateRequest<'a> {
    text: &'a str,
    context_hint: &'a str,
    provider: &'a str,
    model: &'a str,
}

#[derive(Debug, Deserialize)]
struct RemoteTranslateResponse {
    #[serde(default)]
    translated_text: Option<String>,
}

/// Parse a worker's translate reply; a null or missing `translated_text` is invalid
pub fn parse_translate_response(body: &str) -> Result<String, TranslationError> {
    let response: RemoteTranslateResponse = serde_json::from_str(body)
        .map_err(|e| TranslationError::InvalidResponse(format!("malformed translate response: {}", e)))?;
    response
        .translated_text
        .ok_or_else(|| TranslationError::InvalidResponse("response has no translated_text".to_string()))
}

#[derive(Default)]
struct RoundRobin {
    instances: Vec<RemoteInstance>,
    cursor: usize,
}

pub struct DistributedCoordinator {
    pairing: Arc<PairingManager>,
    versions: Arc<VersionManager>,
    fallback: Arc<FallbackManager>,
    breaker_config: CircuitBreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    instances: Mutex<RoundRobin>,
    fallbacks: Vec<UnitFallback>,
    local: Option<Arc<LocalCoordinator>>,
    client: Client,
    events: EventBus,
    config: CoordinatorConfig,
}

impl DistributedCoordinator {
    pub fn new(
        pairing: Arc<PairingManager>,
        versions: Arc<VersionManager>,
        fallback: Arc<FallbackManager>,
        breaker_config: CircuitBreakerConfig,
        config: CoordinatorConfig,
        events: EventBus,
    ) -> Self {
        let timeout = fallback.config().request_timeout();
        Self {
            pairing,
            versions,
            fallback,
            breaker_config,
            breakers: RwLock::new(HashMap::new()),
            instances: Mutex::new(RoundRobin::default()),
            fallbacks: Vec::new(),
            local: None,
            client: Client::builder().timeout(timeout).build().unwrap_or_default(),
            events,
            config,
        }
    }

    /// Wire the whole distributed stack from application configuration.
    ///
    /// Must be called inside a Tokio runtime for the background sweepers.
    pub fn from_config(config: &Config, events: EventBus) -> Result<Self, TranslationError> {
        let fallback = Arc::new(FallbackManager::new(config.fallback.clone(), events.clone()));
        fallback.spawn_monitors();

        let pool = Arc::new(WorkerPool::ssh(config.pool.clone(), events.clone()));
        pool.spawn_sweeper();
        let pairing = Arc::new(PairingManager::new(
            pool,
            config.workers.clone(),
            config.fallback.health_check_timeout(),
            events.clone(),
        ));
        let versions = Arc::new(VersionManager::new(config.version.clone(), events.clone()));
        let local = Arc::new(LocalCoordinator::from_config_with_manager(
            config,
            fallback.clone(),
            events.clone(),
        )?);

        let coordinator = Self::new(
            pairing,
            versions,
            fallback,
            config.circuit_breaker.clone(),
            config.coordinator.clone(),
            events,
        )
        .with_local(local)
        .with_fallback(UnitFallback::dictionary(Dictionary::new()));
        for instance in &config.remote_instances {
            coordinator.add_remote_instance(RemoteInstance::from(instance));
        }
        Ok(coordinator)
    }

    /// Use a local coordinator as the first fallback
    pub fn with_local(mut self, local: Arc<LocalCoordinator>) -> Self {
        let runner = local.clone();
        self.fallbacks.push(UnitFallback::new(LOCAL_FALLBACK, move |text, prompt, cancel| {
            let local = runner.clone();
            async move {
                local
                    .translate_text(&text, &prompt, &cancel)
                    .await
                    .map(|outcome| outcome.text)
            }
        }));
        self.local = Some(local);
        self
    }

    pub fn with_fallback(mut self, fallback: UnitFallback) -> Self {
        self.fallbacks.push(fallback);
        self
    }

    pub fn pairing(&self) -> &Arc<PairingManager> {
        &self.pairing
    }

    pub fn versions(&self) -> &Arc<VersionManager> {
        &self.versions
    }

    pub fn fallback_manager(&self) -> &Arc<FallbackManager> {
        &self.fallback
    }

    pub fn add_remote_instance(&self, instance: RemoteInstance) {
        self.instances.lock().instances.push(instance);
    }

    pub fn remote_instances(&self) -> Vec<RemoteInstance> {
        self.instances.lock().instances.clone()
    }

    /// Mark every instance on `worker_id` available or not
    pub fn set_worker_available(&self, worker_id: &str, available: bool) {
        for instance in self
            .instances
            .lock()
            .instances
            .iter_mut()
            .filter(|i| i.worker_id == worker_id)
        {
            instance.available = available;
        }
    }

    pub fn available_instances(&self) -> usize {
        self.instances.lock().instances.iter().filter(|i| i.available).count()
    }

    /// Next available instance after the previous pick, wrapping around
    pub fn next_instance(&self) -> Result<RemoteInstance, TranslationError> {
        let mut rr = self.instances.lock();
        let count = rr.instances.len();
        for offset in 0..count {
            let index = (rr.cursor + offset) % count;
            if rr.instances[index].available {
                rr.cursor = index + 1;
                return Ok(rr.instances[index].clone());
            }
        }
        Err(TranslationError::NoRemoteInstances)
    }

    fn touch(&self, instance: &RemoteInstance) {
        if let Some(found) = self.instances.lock().instances.iter_mut().find(|i| {
            i.worker_id == instance.worker_id && i.provider == instance.provider && i.model == instance.model
        }) {
            found.last_used = Some(Utc::now());
        }
    }

    pub fn breaker(&self, worker_id: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(worker_id) {
            return breaker.clone();
        }
        self.breakers
            .write()
            .entry(worker_id.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::from_config(
                    format!("worker:{}", worker_id),
                    &self.breaker_config,
                ))
            })
            .clone()
    }

    /// Discover every configured worker and mark instances by reachability
    pub async fn discover_workers(&self, cancel: &CancellationToken) -> Vec<RemoteService> {
        let found = self.pairing.discover_all(cancel).await;
        let worker_ids: Vec<String> = self
            .instances
            .lock()
            .instances
            .iter()
            .map(|i| i.worker_id.clone())
            .collect();
        for worker_id in worker_ids {
            let reachable = found.iter().any(|s| s.worker_id == worker_id);
            self.set_worker_available(&worker_id, reachable);
        }
        info!("{} of {} remote instances available", self.available_instances(), self.remote_instances().len());
        found
    }

    /// Run a drift check over every known service and store the results
    pub async fn check_version_drift(&self, cancel: &CancellationToken) -> Vec<DriftAlert> {
        let mut services = self.pairing.list_services();
        let alerts = self.versions.check_version_drift(&mut services, cancel).await;
        for service in services {
            self.pairing.update_service(service);
        }
        alerts
    }

    /// Translate one fragment on the next remote instance
    pub async fn translate_with_remote_instances(
        &self,
        text: &str,
        context_hint: &str,
        cancel: &CancellationToken,
    ) -> Result<String, TranslationError> {
        let instance = self.next_instance()?;
        let breaker = self.breaker(&instance.worker_id);
        let translated = breaker
            .call(|| self.translate_on(&instance, text, context_hint, cancel))
            .await?;
        self.touch(&instance);
        Ok(translated)
    }

    async fn translate_on(
        &self,
        instance: &RemoteInstance,
        text: &str,
        context_hint: &str,
        cancel: &CancellationToken,
    ) -> Result<String, TranslationError> {
        let mut service = self
            .pairing
            .get_service(&instance.worker_id)
            .ok_or_else(|| TranslationError::ServiceNotFound(instance.worker_id.clone()))?;

        let validated = self.versions.validate_worker_for_work(&mut service, cancel).await;
        let url = service.url(TRANSLATE_PATH);
        self.pairing.update_service(service);
        validated?;

        debug!("Translating {} chars on {} ({}/{})", text.len(), instance.worker_id, instance.provider, instance.model);
        let request = self.client.post(&url).json(&RemoteTranslateRequest {
            text,
            context_hint,
            provider: &instance.provider,
            model: &instance.model,
        });
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TranslationError::Cancelled),
            response = request.send() => response.map_err(|e| TranslationError::Connection(format!("POST {} failed: {}", url, e)))?,
        };

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| TranslationError::Connection(format!("failed to read response from {}: {}", url, e)))?;
        if !status.is_success() {
            return Err(TranslationError::TranslationFailed {
                status: status.as_u16(),
                body,
            });
        }
        parse_translate_response(&body)
    }

    /// Give each available instance one chance at the fragment, each within
    /// its own request timeout
    async fn try_remote_instances(
        &self,
        text: &str,
        context_hint: &str,
        attempts: usize,
        cancel: &CancellationToken,
    ) -> Result<UnitOutcome, TranslationError> {
        let per_instance = self.fallback.config().request_timeout();
        let mut last_error = TranslationError::NoRemoteInstances;
        for _ in 0..attempts {
            let attempt = tokio::time::timeout(
                per_instance,
                self.translate_with_remote_instances(text, context_hint, cancel),
            )
            .await
            .unwrap_or_else(|_| Err(TranslationError::Timeout(format!("remote instance exceeded {:?}", per_instance))));
            match attempt {
                Ok(translated) => return Ok(UnitOutcome::new(translated, UnitSource::Remote)),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    warn!("Remote instance failed: {}", e);
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    /// Translate a fragment remotely, falling back locally when needed.
    ///
    /// Remote results are not cached; only the local coordinator keeps a
    /// translation cache. A pass over the remote instances gives every
    /// instance the full request timeout.
    pub async fn translate_text(
        &self,
        text: &str,
        prompt: &Prompt,
        cancel: &CancellationToken,
    ) -> Result<UnitOutcome, TranslationError> {
        if text.trim().is_empty() {
            return Ok(UnitOutcome::new(text, UnitSource::Passthrough));
        }
        let strategies: Vec<FallbackStrategy<UnitOutcome>> =
            self.fallbacks.iter().map(|f| f.strategy(text, prompt, cancel)).collect();
        let attempts = self.available_instances();
        let pass = self.fallback.config().request_timeout().saturating_mul(attempts.max(1) as u32);
        let policy = self.fallback.retry_policy().clone().with_request_timeout(pass);
        self.fallback
            .execute_with_fallback_policy(
                REMOTE_COMPONENT,
                cancel,
                &policy,
                || self.try_remote_instances(text, &prompt.context_hint, attempts, cancel),
                &strategies,
            )
            .await
    }

    pub async fn translate_book(
        &self,
        book: &Book,
        session_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<TranslationReport, TranslationError> {
        let source = match &self.local {
            Some(local) => local.resolve_source_language(book, session_id, cancel).await,
            None => self.config.source_language.clone(),
        };
        let job = JobContext::new(session_id, source.as_deref(), &self.config.target_language);
        BookWalker::new(self.events.clone(), self.config.max_concurrent)
            .translate_book(self, book, &job, cancel)
            .await
    }
}

#[async_trait]
impl UnitTranslator for DistributedCoordinator {
    async fn translate_unit(
        &self,
        unit: &TranslationUnit,
        prompt: &Prompt,
        cancel: &CancellationToken,
    ) -> Result<UnitOutcome, TranslationError> {
        self.translate_text(&unit.text, prompt, cancel).await
    }
}

impl std::fmt::Debug for DistributedCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedCoordinator")
            .field("instances", &self.remote_instances().len())
            .field("fallbacks", &self.fallbacks)
            .finish()
    }
}
