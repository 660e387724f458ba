/*!
 * Event bus for progress and error reporting.
 *
 * Subscribers register either for one event type or for every event. Each
 * subscriber owns a bounded queue drained by its own task, so a slow or
 * panicking handler never blocks the publisher or its siblings. When the
 * queue is full the event is dropped for that subscriber only.
 */

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use log::{debug, warn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::errors::TranslationError;

/// Default number of queued events per subscriber
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Kinds of events published by the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    TranslationStarted,
    TranslationCompleted,
    TranslationError,
    Progress,
    UnitFailed,
    LanguageDetected,
    DegradedModeEntered,
    DegradedModeExited,
    FailureAlert,
    FallbackSuccess,
    AllFallbacksFailed,
    OperationMetrics,
    ServiceDiscovered,
    ServicePaired,
    ServiceUnreachable,
    WorkerVersionChecked,
    VersionDriftCheckCompleted,
    DriftAlert,
    WorkerUpdateStarted,
    WorkerUpdateCompleted,
    WorkerUpdateFailed,
    WorkerBackupCreated,
    WorkerRollbackStarted,
    WorkerRollbackCompleted,
    ConnectionOpened,
    ConnectionEvicted,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TranslationStarted => "translation_started",
            Self::TranslationCompleted => "translation_completed",
            Self::TranslationError => "translation_error",
            Self::Progress => "progress",
            Self::UnitFailed => "unit_failed",
            Self::LanguageDetected => "language_detected",
            Self::DegradedModeEntered => "degraded_mode_entered",
            Self::DegradedModeExited => "degraded_mode_exited",
            Self::FailureAlert => "failure_alert",
            Self::FallbackSuccess => "fallback_success",
            Self::AllFallbacksFailed => "all_fallbacks_failed",
            Self::OperationMetrics => "operation_metrics",
            Self::ServiceDiscovered => "service_discovered",
            Self::ServicePaired => "service_paired",
            Self::ServiceUnreachable => "service_unreachable",
            Self::WorkerVersionChecked => "worker_version_checked",
            Self::VersionDriftCheckCompleted => "version_drift_check_completed",
            Self::DriftAlert => "drift_alert",
            Self::WorkerUpdateStarted => "worker_update_started",
            Self::WorkerUpdateCompleted => "worker_update_completed",
            Self::WorkerUpdateFailed => "worker_update_failed",
            Self::WorkerBackupCreated => "worker_backup_created",
            Self::WorkerRollbackStarted => "worker_rollback_started",
            Self::WorkerRollbackCompleted => "worker_rollback_completed",
            Self::ConnectionOpened => "connection_opened",
            Self::ConnectionEvicted => "connection_evicted",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single event on the bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl Event {
    pub fn new(event_type: EventType, message: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event_type,
            timestamp: Utc::now(),
            message: message.into(),
            session_id: None,
            data: Map::new(),
        }
    }

    pub fn with_session(mut self, session_id: Option<&str>) -> Self {
        self.session_id = session_id.map(str::to_string);
        self
    }

    pub fn with_data(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }

    /// Attach the structured form of an error: its kind and display text
    pub fn with_error(self, error: &TranslationError) -> Self {
        self.with_data("error_kind", error.kind().as_str())
            .with_data("error", error.to_string())
    }

    /// Convenience accessor for string payload fields
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }
}

/// Something that wants to hear about events
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &Event);
}

impl<F> EventHandler for F
where
    F: Fn(&Event) + Send + Sync,
{
    fn handle(&self, event: &Event) {
        self(event)
    }
}

/// Identifier returned by `subscribe`, used to unsubscribe
pub type SubscriptionId = u64;

#[derive(Clone)]
struct Subscriber {
    id: SubscriptionId,
    handler: Arc<dyn EventHandler>,
    /// `None` when subscribed outside a tokio runtime; such handlers run inline
    queue: Option<mpsc::Sender<Event>>,
}

#[derive(Default)]
struct Subscribers {
    by_type: HashMap<EventType, Vec<Subscriber>>,
    all: Vec<Subscriber>,
}

/// Fan-out of events to per-type and catch-all subscribers
#[derive(Clone)]
pub struct EventBus {
    subscribers: Arc<RwLock<Subscribers>>,
    next_id: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
    queue_capacity: usize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_queue_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_queue_capacity(queue_capacity: usize) -> Self {
        Self {
            subscribers: Arc::new(RwLock::new(Subscribers::default())),
            next_id: Arc::new(AtomicU64::new(1)),
            dropped: Arc::new(AtomicU64::new(0)),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Subscribe to a single event type
    pub fn subscribe<H>(&self, event_type: EventType, handler: H) -> SubscriptionId
    where
        H: EventHandler + 'static,
    {
        let subscriber = self.make_subscriber(Arc::new(handler));
        let id = subscriber.id;
        self.subscribers
            .write()
            .by_type
            .entry(event_type)
            .or_default()
            .push(subscriber);
        id
    }

    /// Subscribe to every event type
    pub fn subscribe_all<H>(&self, handler: H) -> SubscriptionId
    where
        H: EventHandler + 'static,
    {
        let subscriber = self.make_subscriber(Arc::new(handler));
        let id = subscriber.id;
        self.subscribers.write().all.push(subscriber);
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut subscribers = self.subscribers.write();
        subscribers.all.retain(|s| s.id != id);
        for list in subscribers.by_type.values_mut() {
            list.retain(|s| s.id != id);
        }
    }

    /// Publish an event. Never blocks and never fails from the caller's side.
    pub fn publish(&self, event: Event) {
        let targets: Vec<Subscriber> = {
            let subscribers = self.subscribers.read();
            subscribers
                .by_type
                .get(&event.event_type)
                .into_iter()
                .flatten()
                .chain(subscribers.all.iter())
                .cloned()
                .collect()
        };

        for subscriber in targets {
            match &subscriber.queue {
                Some(queue) => {
                    if queue.try_send(event.clone()).is_err() {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        debug!(
                            "Dropped {} event for subscriber {}",
                            event.event_type, subscriber.id
                        );
                    }
                }
                None => invoke(subscriber.id, subscriber.handler.as_ref(), &event),
            }
        }
    }

    /// Number of events dropped because a subscriber queue was full
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn subscriber_count(&self) -> usize {
        let subscribers = self.subscribers.read();
        subscribers.all.len() + subscribers.by_type.values().map(Vec::len).sum::<usize>()
    }

    fn make_subscriber(&self, handler: Arc<dyn EventHandler>) -> Subscriber {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let (tx, mut rx) = mpsc::channel::<Event>(self.queue_capacity);
                let handler = handler.clone();
                runtime.spawn(async move {
                    while let Some(event) = rx.recv().await {
                        invoke(id, handler.as_ref(), &event);
                    }
                });
                Some(tx)
            }
            Err(_) => None,
        };
        Subscriber { id, handler, queue }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .field("dropped", &self.dropped_events())
            .finish()
    }
}

fn invoke(id: SubscriptionId, handler: &dyn EventHandler, event: &Event) {
    if catch_unwind(AssertUnwindSafe(|| handler.handle(event))).is_err() {
        warn!(
            "Event handler {} panicked while handling {}",
            id, event.event_type
        );
    }
}
