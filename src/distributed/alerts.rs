/*!
 * Version drift alerts.
 *
 * `AlertManager` keeps a bounded history of alerts and forwards each new one
 * to every registered channel. A failing channel does not stop the others;
 * the last channel error is returned to the caller.
 */

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use parking_lot::RwLock;
use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};

use crate::errors::TranslationError;

/// Default number of alerts kept in history
pub const DEFAULT_ALERT_HISTORY: usize = 1000;

const HOUR: u64 = 60 * 60;

/// How urgent a drift alert is
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Severity for a worker that has lagged behind for `drift`
    pub fn from_drift(drift: Duration) -> Self {
        let secs = drift.as_secs();
        if secs > 24 * HOUR {
            Self::Critical
        } else if secs > 12 * HOUR {
            Self::High
        } else if secs > 6 * HOUR {
            Self::Medium
        } else {
            Self::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One outdated or unreachable worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftAlert {
    pub alert_id: String,
    pub worker_id: String,
    pub severity: Severity,
    /// Whole seconds the worker has been behind (or unseen)
    pub drift_secs: u64,
    pub current_version: String,
    pub expected_version: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub acknowledged: bool,
    #[serde(default)]
    pub acknowledged_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub acknowledged_by: Option<String>,
}

impl DriftAlert {
    pub fn new(
        worker_id: &str,
        severity: Severity,
        drift: Duration,
        current_version: &str,
        expected_version: &str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            alert_id: String::new(),
            worker_id: worker_id.to_string(),
            severity,
            drift_secs: drift.as_secs(),
            current_version: current_version.to_string(),
            expected_version: expected_version.to_string(),
            message: message.into(),
            timestamp: Utc::now(),
            acknowledged: false,
            acknowledged_at: None,
            acknowledged_by: None,
        }
    }

    pub fn drift(&self) -> Duration {
        Duration::from_secs(self.drift_secs)
    }
}

/// A destination for alerts
#[async_trait]
pub trait AlertChannel: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, alert: &DriftAlert) -> Result<(), TranslationError>;
}

/// Posts alerts as JSON to an HTTP endpoint
#[derive(Debug, Clone)]
pub struct WebhookAlertChannel {
    url: String,
    method: Method,
    headers: HashMap<String, String>,
    client: Client,
}

impl WebhookAlertChannel {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            method: Method::POST,
            headers: HashMap::new(),
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
        }
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }
}

#[async_trait]
impl AlertChannel for WebhookAlertChannel {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, alert: &DriftAlert) -> Result<(), TranslationError> {
        let payload = serde_json::json!({
            "alert_id": alert.alert_id,
            "worker_id": alert.worker_id,
            "severity": alert.severity,
            "drift_secs": alert.drift_secs,
            "current_version": alert.current_version,
            "expected_version": alert.expected_version,
            "message": alert.message,
            "timestamp": alert.timestamp.to_rfc3339(),
            "acknowledged": alert.acknowledged,
        });

        let mut request = self.client.request(self.method.clone(), &self.url).json(&payload);
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|e| TranslationError::Connection(format!("failed to send webhook: {}", e)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(TranslationError::Connection(format!(
                "webhook returned status {}",
                status.as_u16()
            )));
        }
        Ok(())
    }
}

/// Alert history and delivery
pub struct AlertManager {
    channels: RwLock<Vec<Arc<dyn AlertChannel>>>,
    history: RwLock<VecDeque<DriftAlert>>,
    max_history: usize,
}

impl AlertManager {
    pub fn new(max_history: usize) -> Self {
        let max_history = if max_history == 0 {
            DEFAULT_ALERT_HISTORY
        } else {
            max_history
        };
        Self {
            channels: RwLock::new(Vec::new()),
            history: RwLock::new(VecDeque::new()),
            max_history,
        }
    }

    pub fn add_channel(&self, channel: Arc<dyn AlertChannel>) {
        self.channels.write().push(channel);
    }

    pub fn channel_count(&self) -> usize {
        self.channels.read().len()
    }

    /// Record `alert` and deliver it to every channel
    pub async fn send_alert(&self, mut alert: DriftAlert) -> Result<DriftAlert, TranslationError> {
        if alert.alert_id.is_empty() {
            alert.alert_id = format!("alert-{}", uuid::Uuid::new_v4());
        }

        {
            let mut history = self.history.write();
            history.push_back(alert.clone());
            while history.len() > self.max_history {
                history.pop_front();
            }
        }

        let channels: Vec<Arc<dyn AlertChannel>> = self.channels.read().clone();
        let mut last_error = None;
        for channel in channels {
            match channel.send(&alert).await {
                Ok(()) => debug!("Alert {} delivered via {}", alert.alert_id, channel.name()),
                Err(e) => {
                    warn!("Alert channel {} failed: {}", channel.name(), e);
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) => Err(e),
            None => Ok(alert),
        }
    }

    /// The most recent `limit` alerts in the order they were raised; 0 means all
    pub fn history(&self, limit: usize) -> Vec<DriftAlert> {
        let history = self.history.read();
        let limit = if limit == 0 || limit > history.len() {
            history.len()
        } else {
            limit
        };
        history.iter().skip(history.len() - limit).cloned().collect()
    }

    /// Mark an alert acknowledged. False if unknown or already acknowledged.
    pub fn acknowledge(&self, alert_id: &str, acknowledged_by: &str) -> bool {
        let mut history = self.history.write();
        match history
            .iter_mut()
            .find(|a| a.alert_id == alert_id && !a.acknowledged)
        {
            Some(alert) => {
                alert.acknowledged = true;
                alert.acknowledged_at = Some(Utc::now());
                alert.acknowledged_by = Some(acknowledged_by.to_string());
                true
            }
            None => false,
        }
    }

    pub fn active_alerts(&self) -> usize {
        self.history.read().iter().filter(|a| !a.acknowledged).count()
    }
}

impl Default for AlertManager {
    fn default() -> Self {
        Self::new(DEFAULT_ALERT_HISTORY)
    }
}

impl std::fmt::Debug for AlertManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertManager")
            .field("channels", &self.channel_count())
            .field("history", &self.history.read().len())
            .field("max_history", &self.max_history)
            .finish()
    }
}
