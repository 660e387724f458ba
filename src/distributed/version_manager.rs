/*!
 * Worker version management.
 *
 * Answers whether a worker runs the same code as this process, watches a
 * fleet for drift, and pushes updates to outdated workers. An update backs
 * up the worker's state, ships a (optionally signed) package, asks the worker
 * to apply it and waits until it reports the local version. Any failure
 * along the way rolls the worker back.
 */

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use log::{debug, error, info, warn};
use parking_lot::RwLock;
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::app_config::VersionConfig;
use crate::distributed::alerts::{AlertChannel, AlertManager, DriftAlert, Severity, WebhookAlertChannel};
use crate::distributed::pairing::{HEALTH_PATH, RemoteService, ServiceStatus};
use crate::distributed::{signing, update_package};
use crate::errors::TranslationError;
use crate::events::{Event, EventBus, EventType};

pub const VERSION_PATH: &str = "/api/v1/version";
pub const UPLOAD_PATH: &str = "/api/v1/update/upload";
pub const APPLY_PATH: &str = "/api/v1/update/apply";
pub const ROLLBACK_PATH: &str = "/api/v1/update/rollback";

/// Components that must match for a worker to count as up to date
pub const CRITICAL_COMPONENTS: [&str; 3] = ["translator", "api", "distributed"];

/// Version report of a translator build
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub codebase_version: String,
    #[serde(default)]
    pub build_time: String,
    #[serde(default)]
    pub git_commit: String,
    #[serde(default)]
    pub runtime_version: String,
    #[serde(default)]
    pub components: BTreeMap<String, String>,
    #[serde(default = "Utc::now")]
    pub last_updated: DateTime<Utc>,
}

impl VersionInfo {
    /// Version of this process
    pub fn local(config: &VersionConfig) -> Self {
        Self {
            codebase_version: config.codebase_version.clone(),
            build_time: String::new(),
            git_commit: String::new(),
            runtime_version: format!("rust {}", env!("CARGO_PKG_RUST_VERSION")),
            components: config.local_components(),
            last_updated: Utc::now(),
        }
    }

    /// Same codebase version and the same critical component versions
    pub fn matches(&self, remote: &VersionInfo) -> bool {
        self.codebase_version == remote.codebase_version
            && CRITICAL_COMPONENTS
                .iter()
                .all(|c| self.components.get(*c) == remote.components.get(*c))
    }
}

struct VersionCacheEntry {
    info: VersionInfo,
    up_to_date: bool,
    checked_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    /// Taken for an update that is still running
    Active,
    Completed,
    RolledBack,
    /// Past retention; its files are gone
    Expired,
}

/// State kept so a failed update can be undone
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdateBackup {
    pub worker_id: String,
    pub backup_id: String,
    pub timestamp: DateTime<Utc>,
    pub original_version: Option<VersionInfo>,
    pub original_status: ServiceStatus,
    pub backup_path: PathBuf,
    pub update_package: Option<PathBuf>,
    pub status: BackupStatus,
}

/// A package with its detached signature and the key that verifies it
#[derive(Debug, Clone, PartialEq)]
pub struct SignedPackage {
    pub package_path: PathBuf,
    pub signature_path: PathBuf,
    pub public_key_path: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VersionMetrics {
    pub total_updates: u64,
    pub successful_updates: u64,
    pub failed_updates: u64,
    /// Running average
    pub update_duration_ms: u64,
    pub last_update_time: Option<DateTime<Utc>>,

    pub total_rollbacks: u64,
    pub successful_rollbacks: u64,
    pub failed_rollbacks: u64,
    pub rollback_duration_ms: u64,
    pub last_rollback_time: Option<DateTime<Utc>>,

    pub workers_checked: u64,
    pub workers_up_to_date: u64,
    pub workers_outdated: u64,
    pub workers_unhealthy: u64,
    pub last_drift_check: Option<DateTime<Utc>>,
    pub max_drift_secs: u64,

    pub signature_verifications: u64,
    pub signature_successes: u64,
    pub signature_failures: u64,

    pub backups_created: u64,
    pub active_backups: u64,
}

fn running_average(previous_ms: u64, count: u64, sample: Duration) -> u64 {
    let sample = sample.as_millis() as u64;
    if count <= 1 {
        sample
    } else {
        (previous_ms * (count - 1) + sample) / count
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthStatus {
    pub status: HealthLevel,
    pub score: f64,
    pub update_success_rate: f64,
    pub rollback_success_rate: f64,
    pub signature_success_rate: f64,
    pub active_alerts: usize,
    pub metrics: VersionMetrics,
}

fn success_rate(successes: u64, total: u64) -> f64 {
    if total == 0 {
        100.0
    } else {
        successes as f64 / total as f64 * 100.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchUpdateFailure {
    pub worker_id: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchUpdateResult {
    pub total_workers: usize,
    pub successful: Vec<String>,
    pub failed: Vec<BatchUpdateFailure>,
    pub skipped: Vec<String>,
    pub duration: Duration,
}

impl BatchUpdateResult {
    /// Percentage of workers updated; 100 for an empty batch
    pub fn success_rate(&self) -> f64 {
        success_rate(self.successful.len() as u64, self.total_workers as u64)
    }

    pub fn summary(&self) -> String {
        format!(
            "Batch update completed: {}/{} successful ({:.1}%), {} failed, {} skipped in {:?}",
            self.successful.len(),
            self.total_workers,
            self.success_rate(),
            self.failed.len(),
            self.skipped.len(),
            self.duration
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VersionCacheStats {
    pub total_entries: usize,
    pub valid_entries: usize,
    pub expired_entries: usize,
    pub cache_ttl_secs: u64,
}

enum BatchOutcome {
    Updated(String),
    Skipped(String),
    Failed(BatchUpdateFailure),
}

/// `8h0m0s`
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{}h{}m{}s", secs / 3600, (secs % 3600) / 60, secs % 60)
}

/// Outdated workers are flagged; a current one leaves `Outdated` for `Paired`.
/// A worker mid-update keeps `Updating`.
fn mark_version_status(service: &mut RemoteService, up_to_date: bool) {
    match (service.status, up_to_date) {
        (ServiceStatus::Updating, _) => {}
        (_, false) => service.status = ServiceStatus::Outdated,
        (ServiceStatus::Outdated, true) => service.status = ServiceStatus::Paired,
        _ => {}
    }
}

fn since(then: DateTime<Utc>) -> Duration {
    (Utc::now() - then).to_std().unwrap_or(Duration::ZERO)
}

pub struct VersionManager {
    local: VersionInfo,
    config: VersionConfig,
    client: Client,
    events: EventBus,
    cache: RwLock<HashMap<String, VersionCacheEntry>>,
    cache_ttl: RwLock<Duration>,
    backups: RwLock<HashMap<String, UpdateBackup>>,
    metrics: RwLock<VersionMetrics>,
    alerts: AlertManager,
    last_alerts: RwLock<Vec<DriftAlert>>,
}

impl VersionManager {
    pub fn new(config: VersionConfig, events: EventBus) -> Self {
        let alerts = AlertManager::new(config.alert_history_limit);
        if let Some(url) = &config.alert_webhook_url {
            alerts.add_channel(Arc::new(WebhookAlertChannel::new(url)));
        }
        Self {
            local: VersionInfo::local(&config),
            client: Client::builder()
                .timeout(config.http_timeout())
                .build()
                .unwrap_or_default(),
            cache_ttl: RwLock::new(config.cache_ttl()),
            config,
            events,
            cache: RwLock::new(HashMap::new()),
            backups: RwLock::new(HashMap::new()),
            metrics: RwLock::new(VersionMetrics::default()),
            alerts,
            last_alerts: RwLock::new(Vec::new()),
        }
    }

    pub fn local_version(&self) -> &VersionInfo {
        &self.local
    }

    pub fn config(&self) -> &VersionConfig {
        &self.config
    }

    /// Whether the worker behind `service` matches the local version.
    ///
    /// Answers from the per-worker cache while the entry is younger than the
    /// cache TTL; otherwise asks the worker and refreshes `service.version`.
    pub async fn check_worker_version(
        &self,
        service: &mut RemoteService,
        cancel: &CancellationToken,
    ) -> Result<bool, TranslationError> {
        let ttl = *self.cache_ttl.read();
        let cached = self
            .cache
            .read()
            .get(&service.worker_id)
            .filter(|entry| entry.checked_at.elapsed() < ttl)
            .map(|entry| (entry.info.clone(), entry.up_to_date));
        if let Some((info, up_to_date)) = cached {
            debug!("Version of {} served from cache", service.worker_id);
            self.publish_version_checked(service, &info, up_to_date, true);
            service.version = Some(info);
            mark_version_status(service, up_to_date);
            return Ok(up_to_date);
        }

        let info = self.fetch_version(service, cancel).await?;
        let up_to_date = self.local.matches(&info);
        self.cache.write().insert(
            service.worker_id.clone(),
            VersionCacheEntry {
                info: info.clone(),
                up_to_date,
                checked_at: Instant::now(),
            },
        );
        self.publish_version_checked(service, &info, up_to_date, false);
        service.version = Some(info);
        service.last_seen = Utc::now();
        mark_version_status(service, up_to_date);
        Ok(up_to_date)
    }

    async fn fetch_version(
        &self,
        service: &RemoteService,
        cancel: &CancellationToken,
    ) -> Result<VersionInfo, TranslationError> {
        let response = self.send(self.client.get(service.url(VERSION_PATH)), cancel).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TranslationError::Connection(format!(
                "version check for {} returned status {}",
                service.worker_id,
                status.as_u16()
            )));
        }
        response
            .json::<VersionInfo>()
            .await
            .map_err(|e| TranslationError::InvalidResponse(format!("invalid version info from {}: {}", service.worker_id, e)))
    }

    fn publish_version_checked(&self, service: &RemoteService, info: &VersionInfo, up_to_date: bool, cached: bool) {
        self.events.publish(
            Event::new(EventType::WorkerVersionChecked, format!("Checked version of {}", service.worker_id))
                .with_data("worker_id", service.worker_id.as_str())
                .with_data("local_version", self.local.codebase_version.as_str())
                .with_data("worker_version", info.codebase_version.as_str())
                .with_data("up_to_date", up_to_date)
                .with_data("cached", cached),
        );
    }

    /// Refuse work unless the worker is current and `/health` answers 200
    pub async fn validate_worker_for_work(
        &self,
        service: &mut RemoteService,
        cancel: &CancellationToken,
    ) -> Result<(), TranslationError> {
        if !self.check_worker_version(service, cancel).await? {
            return Err(TranslationError::VersionMismatch {
                worker_id: service.worker_id.clone(),
                local: self.local.codebase_version.clone(),
                remote: service.codebase_version().unwrap_or("unknown").to_string(),
            });
        }

        let response = self.send(self.client.get(service.url(HEALTH_PATH)), cancel).await?;
        if !response.status().is_success() {
            return Err(TranslationError::Connection(format!(
                "worker {} health check returned status {}",
                service.worker_id,
                response.status().as_u16()
            )));
        }
        Ok(())
    }

    /// Check every service and raise one alert per outdated or unreachable worker
    pub async fn check_version_drift(
        &self,
        services: &mut [RemoteService],
        cancel: &CancellationToken,
    ) -> Vec<DriftAlert> {
        let mut alerts = Vec::new();
        let (mut up_to_date, mut outdated, mut unhealthy) = (0u64, 0u64, 0u64);
        let mut max_drift = Duration::ZERO;

        for service in services.iter_mut() {
            if cancel.is_cancelled() {
                break;
            }
            let alert = match self.check_worker_version(service, cancel).await {
                Ok(true) => {
                    up_to_date += 1;
                    None
                }
                Ok(false) => {
                    outdated += 1;
                    let remote = service.version.clone();
                    let drift = remote.as_ref().map(|v| since(v.last_updated)).unwrap_or(Duration::ZERO);
                    max_drift = max_drift.max(drift);
                    let current = remote.map(|v| v.codebase_version).unwrap_or_else(|| "unknown".to_string());
                    Some(DriftAlert::new(
                        &service.worker_id,
                        Severity::from_drift(drift),
                        drift,
                        &current,
                        &self.local.codebase_version,
                        format!(
                            "Worker {} is running version {}, expected {} (drift: {})",
                            service.worker_id,
                            current,
                            self.local.codebase_version,
                            format_duration(drift)
                        ),
                    ))
                }
                Err(e) if e.is_cancelled() => break,
                Err(e) => {
                    unhealthy += 1;
                    service.status = ServiceStatus::Unreachable;
                    let drift = since(service.last_seen);
                    Some(DriftAlert::new(
                        &service.worker_id,
                        Severity::High,
                        drift,
                        service.codebase_version().unwrap_or("unknown"),
                        &self.local.codebase_version,
                        format!("Worker {} is unreachable: {}", service.worker_id, e),
                    ))
                }
            };

            if let Some(alert) = alert {
                alerts.push(self.raise_alert(alert).await);
            }
        }

        {
            let mut metrics = self.metrics.write();
            metrics.workers_checked = services.len() as u64;
            metrics.workers_up_to_date = up_to_date;
            metrics.workers_outdated = outdated;
            metrics.workers_unhealthy = unhealthy;
            metrics.last_drift_check = Some(Utc::now());
            metrics.max_drift_secs = metrics.max_drift_secs.max(max_drift.as_secs());
        }
        *self.last_alerts.write() = alerts.clone();

        info!(
            "Drift check: {} checked, {} up to date, {} outdated, {} unhealthy",
            services.len(),
            up_to_date,
            outdated,
            unhealthy
        );
        self.events.publish(
            Event::new(EventType::VersionDriftCheckCompleted, "Version drift check completed")
                .with_data("workers_checked", services.len() as u64)
                .with_data("workers_up_to_date", up_to_date)
                .with_data("workers_outdated", outdated)
                .with_data("workers_unhealthy", unhealthy)
                .with_data("alerts_generated", alerts.len() as u64),
        );
        alerts
    }

    async fn raise_alert(&self, mut alert: DriftAlert) -> DriftAlert {
        alert.alert_id = format!("alert-{}", uuid::Uuid::new_v4());
        warn!("{}", alert.message);
        if let Err(e) = self.alerts.send_alert(alert.clone()).await {
            error!("Failed to deliver drift alert {}: {}", alert.alert_id, e);
        }
        self.events.publish(
            Event::new(EventType::DriftAlert, alert.message.clone())
                .with_data("alert_id", alert.alert_id.as_str())
                .with_data("worker_id", alert.worker_id.as_str())
                .with_data("severity", alert.severity.as_str())
                .with_data("drift_secs", alert.drift_secs)
                .with_data("current_version", alert.current_version.as_str())
                .with_data("expected_version", alert.expected_version.as_str()),
        );
        alert
    }

    /// Bring a worker to the local version, rolling back on any failure.
    ///
    /// With `signing_key` the package is signed and the signature and public
    /// key are uploaded alongside it.
    pub async fn update_worker(
        &self,
        service: &mut RemoteService,
        signing_key: Option<&Path>,
        cancel: &CancellationToken,
    ) -> Result<(), TranslationError> {
        let started = Instant::now();
        let original_status = service.status;
        service.status = ServiceStatus::Updating;
        info!(
            "Updating worker {} from {} to {}",
            service.worker_id,
            service.codebase_version().unwrap_or("unknown"),
            self.local.codebase_version
        );
        self.events.publish(
            Event::new(EventType::WorkerUpdateStarted, format!("Updating {}", service.worker_id))
                .with_data("worker_id", service.worker_id.as_str())
                .with_data("target_version", self.local.codebase_version.as_str())
                .with_data("current_version", service.codebase_version().unwrap_or_default())
                .with_data("signature_enabled", signing_key.is_some()),
        );

        if let Err(e) = self.create_backup(service, original_status) {
            service.status = original_status;
            self.record_update(false, started.elapsed());
            return Err(TranslationError::UpdateFailed(format!("failed to create backup: {}", e)));
        }

        let result = self.run_update(service, signing_key, cancel).await;
        match result {
            Ok(signed) => {
                service.status = ServiceStatus::Paired;
                self.set_backup_status(&service.worker_id, BackupStatus::Completed);
                self.record_update(true, started.elapsed());
                info!("Worker {} updated to {}", service.worker_id, self.local.codebase_version);
                self.events.publish(
                    Event::new(EventType::WorkerUpdateCompleted, format!("Updated {}", service.worker_id))
                        .with_data("worker_id", service.worker_id.as_str())
                        .with_data("version", self.local.codebase_version.as_str())
                        .with_data("signed", signed),
                );
                Ok(())
            }
            Err(e) => {
                error!("Update of worker {} failed: {}", service.worker_id, e);
                self.record_update(false, started.elapsed());
                self.events.publish(
                    Event::new(EventType::WorkerUpdateFailed, format!("Update of {} failed", service.worker_id))
                        .with_data("worker_id", service.worker_id.as_str())
                        .with_error(&e),
                );

                // Rollback runs to completion even when the caller gave up
                let rollback = self.rollback_worker(service, &CancellationToken::new()).await;
                // Back on the old version, or lost
                service.status = if rollback.is_ok() {
                    ServiceStatus::Outdated
                } else {
                    ServiceStatus::Unreachable
                };
                if e.is_cancelled() {
                    return Err(e);
                }
                match rollback {
                    Ok(()) => Err(TranslationError::UpdateFailed(e.to_string())),
                    Err(r) => Err(TranslationError::UpdateFailed(format!("{}; {}", e, r))),
                }
            }
        }
    }

    /// Package, upload, apply and wait. Returns whether the package was signed.
    async fn run_update(
        &self,
        service: &mut RemoteService,
        signing_key: Option<&Path>,
        cancel: &CancellationToken,
    ) -> Result<bool, TranslationError> {
        let signed = match signing_key {
            Some(key) => Some(self.create_signed_package(key)?),
            None => None,
        };
        let package = match &signed {
            Some(signed) => signed.package_path.clone(),
            None => update_package::create_package(
                &self.config.source_dir,
                &self.config.update_dir,
                &self.local.codebase_version,
            )?,
        };
        if let Some(backup) = self.backups.write().get_mut(&service.worker_id) {
            backup.update_package = Some(package.clone());
        }

        self.upload_file(service, &package, UPLOAD_PATH, None, cancel).await?;
        if let Some(signed) = &signed {
            let signature_path = format!("{}/signature", UPLOAD_PATH);
            self.upload_file(service, &signed.signature_path, &signature_path, Some("signature"), cancel)
                .await?;
            let key_path = format!("{}/public_key", UPLOAD_PATH);
            self.upload_file(service, &signed.public_key_path, &key_path, Some("public_key"), cancel)
                .await?;
        }

        let apply = self
            .client
            .post(service.url(APPLY_PATH))
            .header("X-Update-Version", self.local.codebase_version.as_str());
        let response = self.send(apply, cancel).await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(TranslationError::UpdateFailed(format!(
                "update trigger failed with status {}: {}",
                status, body
            )));
        }

        self.wait_for_update(service, cancel).await?;
        Ok(signed.is_some())
    }

    async fn upload_file(
        &self,
        service: &RemoteService,
        path: &Path,
        endpoint: &str,
        file_type: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<(), TranslationError> {
        let body = tokio::fs::read(path).await?;
        debug!("Uploading {} ({} bytes) to {}", path.display(), body.len(), service.worker_id);
        let mut request = self
            .client
            .post(service.url(endpoint))
            .header("Content-Type", "application/octet-stream")
            .header("X-Update-Version", self.local.codebase_version.as_str())
            .body(body);
        if let Some(file_type) = file_type {
            request = request.header("X-File-Type", file_type);
        }

        let response = self.send(request, cancel).await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(TranslationError::UpdateFailed(format!(
                "upload of {} failed with status {}: {}",
                path.display(),
                status,
                body
            )));
        }
        Ok(())
    }

    async fn wait_for_update(
        &self,
        service: &mut RemoteService,
        cancel: &CancellationToken,
    ) -> Result<(), TranslationError> {
        let deadline = Instant::now() + self.config.update_timeout();
        loop {
            self.invalidate(&service.worker_id);
            match self.check_worker_version(service, cancel).await {
                Ok(true) => return Ok(()),
                Ok(false) => debug!("Worker {} not updated yet", service.worker_id),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => debug!("Worker {} not answering yet: {}", service.worker_id, e),
            }
            if Instant::now() >= deadline {
                return Err(TranslationError::Timeout(format!(
                    "worker {} did not report version {} within {:?}",
                    service.worker_id,
                    self.local.codebase_version,
                    self.config.update_timeout()
                )));
            }
            self.sleep(self.config.update_poll_interval(), cancel).await?;
        }
    }

    fn create_backup(&self, service: &RemoteService, original_status: ServiceStatus) -> Result<String, TranslationError> {
        std::fs::create_dir_all(&self.config.backup_dir)?;
        let backup_id = format!("backup-{}-{}", service.worker_id, Utc::now().timestamp());
        let backup_path = self.config.backup_dir.join(&backup_id);
        std::fs::create_dir_all(&backup_path)?;

        let backup = UpdateBackup {
            worker_id: service.worker_id.clone(),
            backup_id: backup_id.clone(),
            timestamp: Utc::now(),
            original_version: service.version.clone(),
            original_status,
            backup_path,
            update_package: None,
            status: BackupStatus::Active,
        };
        self.backups.write().insert(service.worker_id.clone(), backup);
        self.record_backup();

        self.events.publish(
            Event::new(EventType::WorkerBackupCreated, format!("Backed up {}", service.worker_id))
                .with_data("worker_id", service.worker_id.as_str())
                .with_data("backup_id", backup_id.as_str())
                .with_data("original_version", service.codebase_version().unwrap_or_default()),
        );
        Ok(backup_id)
    }

    fn set_backup_status(&self, worker_id: &str, status: BackupStatus) {
        if let Some(backup) = self.backups.write().get_mut(worker_id) {
            backup.status = status;
        }
        self.refresh_active_backups();
    }

    pub fn backup(&self, worker_id: &str) -> Option<UpdateBackup> {
        self.backups.read().get(worker_id).cloned()
    }

    /// Return a worker to the version recorded in its active backup
    pub async fn rollback_worker(
        &self,
        service: &mut RemoteService,
        cancel: &CancellationToken,
    ) -> Result<(), TranslationError> {
        let started = Instant::now();
        let backup = self
            .backups
            .read()
            .get(&service.worker_id)
            .filter(|b| b.status == BackupStatus::Active)
            .cloned()
            .ok_or_else(|| {
                TranslationError::RollbackFailed(format!("no active backup for worker {}", service.worker_id))
            })?;
        let to_version = backup
            .original_version
            .as_ref()
            .map(|v| v.codebase_version.clone())
            .unwrap_or_default();

        warn!("Rolling back worker {} to {}", service.worker_id, to_version);
        self.events.publish(
            Event::new(EventType::WorkerRollbackStarted, format!("Rolling back {}", service.worker_id))
                .with_data("worker_id", service.worker_id.as_str())
                .with_data("backup_id", backup.backup_id.as_str())
                .with_data("from_version", service.codebase_version().unwrap_or_default())
                .with_data("to_version", to_version.as_str()),
        );

        let result = self.run_rollback(service, &backup, cancel).await;
        self.record_rollback(result.is_ok(), started.elapsed());
        match result {
            Ok(()) => {
                service.version = backup.original_version.clone();
                service.status = ServiceStatus::Paired;
                self.set_backup_status(&service.worker_id, BackupStatus::RolledBack);
                info!("Worker {} rolled back to {}", service.worker_id, to_version);
                self.events.publish(
                    Event::new(EventType::WorkerRollbackCompleted, format!("Rolled back {}", service.worker_id))
                        .with_data("worker_id", service.worker_id.as_str())
                        .with_data("backup_id", backup.backup_id.as_str())
                        .with_data("version", to_version.as_str()),
                );
                Ok(())
            }
            Err(e) if e.is_cancelled() => Err(e),
            Err(e) => {
                error!("Rollback of worker {} failed: {}", service.worker_id, e);
                Err(TranslationError::RollbackFailed(e.to_string()))
            }
        }
    }

    async fn run_rollback(
        &self,
        service: &RemoteService,
        backup: &UpdateBackup,
        cancel: &CancellationToken,
    ) -> Result<(), TranslationError> {
        let request = self
            .client
            .post(service.url(ROLLBACK_PATH))
            .header("X-Backup-ID", backup.backup_id.as_str());
        let response = self.send(request, cancel).await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(TranslationError::RollbackFailed(format!(
                "rollback request failed with status {}: {}",
                status, body
            )));
        }

        let Some(original) = &backup.original_version else {
            return Ok(());
        };
        let deadline = Instant::now() + self.config.rollback_timeout();
        loop {
            self.invalidate(&service.worker_id);
            match self.fetch_version(service, cancel).await {
                Ok(info) if info.codebase_version == original.codebase_version => return Ok(()),
                Ok(info) => debug!("Worker {} still reports {}", service.worker_id, info.codebase_version),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => debug!("Worker {} not answering during rollback: {}", service.worker_id, e),
            }
            if Instant::now() >= deadline {
                return Err(TranslationError::Timeout(format!(
                    "worker {} did not return to version {} within {:?}",
                    service.worker_id,
                    original.codebase_version,
                    self.config.rollback_timeout()
                )));
            }
            self.sleep(self.config.rollback_poll_interval(), cancel).await?;
        }
    }

    /// Update every outdated service with at most `max_concurrency` in flight
    pub async fn batch_update_workers(
        &self,
        services: &mut [RemoteService],
        max_concurrency: usize,
        cancel: &CancellationToken,
    ) -> BatchUpdateResult {
        let started = Instant::now();
        let concurrency = if max_concurrency == 0 {
            self.config.batch_update_concurrency.max(1)
        } else {
            max_concurrency
        };
        let signing_key = self.config.signing_key_path.clone();
        let total_workers = services.len();

        let outcomes: Vec<BatchOutcome> = stream::iter(services.iter_mut())
            .map(|service| {
                let signing_key = signing_key.clone();
                async move {
                    let worker_id = service.worker_id.clone();
                    match self.check_worker_version(service, cancel).await {
                        Ok(true) => return BatchOutcome::Skipped(worker_id),
                        Ok(false) => {}
                        Err(e) => {
                            return BatchOutcome::Failed(BatchUpdateFailure {
                                worker_id,
                                error: format!("version check failed: {}", e),
                            });
                        }
                    }
                    match self.update_worker(service, signing_key.as_deref(), cancel).await {
                        Ok(()) => BatchOutcome::Updated(worker_id),
                        Err(e) => BatchOutcome::Failed(BatchUpdateFailure {
                            worker_id,
                            error: format!("update failed: {}", e),
                        }),
                    }
                }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut result = BatchUpdateResult {
            total_workers,
            successful: Vec::new(),
            failed: Vec::new(),
            skipped: Vec::new(),
            duration: Duration::ZERO,
        };
        for outcome in outcomes {
            match outcome {
                BatchOutcome::Updated(id) => result.successful.push(id),
                BatchOutcome::Skipped(id) => result.skipped.push(id),
                BatchOutcome::Failed(failure) => result.failed.push(failure),
            }
        }
        result.duration = started.elapsed();
        info!("{}", result.summary());
        result
    }

    /// Build and sign a package; the public key is expected next to the
    /// private key with a `.pub` extension
    pub fn create_signed_package(&self, private_key_path: &Path) -> Result<SignedPackage, TranslationError> {
        let key = signing::load_private_key(private_key_path)?;
        let package_path = update_package::create_package(
            &self.config.source_dir,
            &self.config.update_dir,
            &self.local.codebase_version,
        )?;
        let signature_path = match signing::sign_package(&package_path, &key) {
            Ok(path) => path,
            Err(e) => {
                let _ = std::fs::remove_file(&package_path);
                return Err(e);
            }
        };
        let public_key_path = private_key_path.with_extension("pub");
        // Fail before shipping anything the worker would reject
        self.verify_package(&package_path, &signature_path, &public_key_path)?;
        Ok(SignedPackage {
            package_path,
            signature_path,
            public_key_path,
        })
    }

    /// Verify a signed package and record the outcome in the metrics
    pub fn verify_package(&self, package: &Path, signature: &Path, public_key: &Path) -> Result<(), TranslationError> {
        let result = signing::verify_package(package, signature, public_key);
        self.record_signature(result.is_ok());
        result
    }

    /// Delete non-active backups older than the retention window
    /// Mark finished backups older than the retention period `Expired` and
    /// delete their files. Returns how many expired on this call.
    pub fn cleanup_expired_backups(&self) -> usize {
        let retention = self.config.backup_retention();
        let expired: Vec<UpdateBackup> = {
            let mut backups = self.backups.write();
            backups
                .values_mut()
                .filter(|b| {
                    matches!(b.status, BackupStatus::Completed | BackupStatus::RolledBack)
                        && since(b.timestamp) > retention
                })
                .map(|b| {
                    b.status = BackupStatus::Expired;
                    b.clone()
                })
                .collect()
        };
        for backup in &expired {
            info!("Backup {} for {} expired", backup.backup_id, backup.worker_id);
            if let Err(e) = std::fs::remove_dir_all(&backup.backup_path) {
                warn!("Failed to remove backup {}: {}", backup.backup_path.display(), e);
            }
        }
        self.refresh_active_backups();
        expired.len()
    }

    pub fn invalidate(&self, worker_id: &str) {
        self.cache.write().remove(worker_id);
    }

    pub fn clear_cache(&self) {
        self.cache.write().clear();
    }

    /// Zero is ignored
    pub fn set_cache_ttl(&self, ttl: Duration) {
        if !ttl.is_zero() {
            *self.cache_ttl.write() = ttl;
        }
    }

    pub fn cache_stats(&self) -> VersionCacheStats {
        let ttl = *self.cache_ttl.read();
        let cache = self.cache.read();
        let valid = cache.values().filter(|e| e.checked_at.elapsed() < ttl).count();
        VersionCacheStats {
            total_entries: cache.len(),
            valid_entries: valid,
            expired_entries: cache.len() - valid,
            cache_ttl_secs: ttl.as_secs(),
        }
    }

    pub fn metrics(&self) -> VersionMetrics {
        self.metrics.read().clone()
    }

    /// Alerts raised by the most recent drift check
    pub fn alerts(&self) -> Vec<DriftAlert> {
        self.last_alerts.read().clone()
    }

    pub fn alert_manager(&self) -> &AlertManager {
        &self.alerts
    }

    pub fn add_alert_channel(&self, channel: Arc<dyn AlertChannel>) {
        self.alerts.add_channel(channel);
    }

    pub fn alert_history(&self, limit: usize) -> Vec<DriftAlert> {
        self.alerts.history(limit)
    }

    pub fn acknowledge_alert(&self, alert_id: &str, acknowledged_by: &str) -> bool {
        self.alerts.acknowledge(alert_id, acknowledged_by)
    }

    /// Overall fleet score from 0 to 100
    pub fn health_status(&self) -> HealthStatus {
        let metrics = self.metrics();
        let mut score: f64 = 100.0;

        if metrics.workers_checked > 0 {
            let checked = metrics.workers_checked as f64;
            score -= metrics.workers_outdated as f64 / checked * 50.0;
            score -= metrics.workers_unhealthy as f64 / checked * 30.0;
        }
        if let Some(last_check) = metrics.last_drift_check {
            let hours = since(last_check).as_secs_f64() / 3600.0;
            if hours > 1.0 {
                score -= (hours * 5.0).min(20.0);
            }
        }
        if metrics.total_updates > 0 {
            score -= metrics.failed_updates as f64 / metrics.total_updates as f64 * 10.0;
        }
        let score = score.max(0.0);

        let status = if score < 40.0 {
            HealthLevel::Critical
        } else if score < 70.0 {
            HealthLevel::Warning
        } else {
            HealthLevel::Healthy
        };

        HealthStatus {
            status,
            score,
            update_success_rate: success_rate(metrics.successful_updates, metrics.total_updates),
            rollback_success_rate: success_rate(metrics.successful_rollbacks, metrics.total_rollbacks),
            signature_success_rate: success_rate(metrics.signature_successes, metrics.signature_verifications),
            active_alerts: self.alerts.active_alerts(),
            metrics,
        }
    }

    fn record_update(&self, success: bool, duration: Duration) {
        let mut m = self.metrics.write();
        m.total_updates += 1;
        if success {
            m.successful_updates += 1;
        } else {
            m.failed_updates += 1;
        }
        m.update_duration_ms = running_average(m.update_duration_ms, m.total_updates, duration);
        m.last_update_time = Some(Utc::now());
    }

    fn record_rollback(&self, success: bool, duration: Duration) {
        let mut m = self.metrics.write();
        m.total_rollbacks += 1;
        if success {
            m.successful_rollbacks += 1;
        } else {
            m.failed_rollbacks += 1;
        }
        m.rollback_duration_ms = running_average(m.rollback_duration_ms, m.total_rollbacks, duration);
        m.last_rollback_time = Some(Utc::now());
    }

    fn record_signature(&self, success: bool) {
        let mut m = self.metrics.write();
        m.signature_verifications += 1;
        if success {
            m.signature_successes += 1;
        } else {
            m.signature_failures += 1;
        }
    }

    fn record_backup(&self) {
        self.metrics.write().backups_created += 1;
        self.refresh_active_backups();
    }

    fn refresh_active_backups(&self) {
        let active = self
            .backups
            .read()
            .values()
            .filter(|b| b.status == BackupStatus::Active)
            .count() as u64;
        self.metrics.write().active_backups = active;
    }

    async fn send(&self, request: RequestBuilder, cancel: &CancellationToken) -> Result<Response, TranslationError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TranslationError::Cancelled),
            response = request.send() => response.map_err(|e| TranslationError::Connection(e.to_string())),
        }
    }

    async fn sleep(&self, duration: Duration, cancel: &CancellationToken) -> Result<(), TranslationError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TranslationError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

impl std::fmt::Debug for VersionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionManager")
            .field("local_version", &self.local.codebase_version)
            .field("cached", &self.cache.read().len())
            .field("backups", &self.backups.read().len())
            .finish()
    }
}
