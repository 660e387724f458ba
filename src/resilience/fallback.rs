/*!
 * Fallback manager: retries, ordered fallback strategies and degraded mode.
 *
 * Every `execute_with_fallback` call runs the primary operation under the
 * retry policy, records the outcome against a per-component failure
 * tracker, and on failure walks the eligible strategies in order. A
 * component whose failure rate crosses the degradation threshold puts the
 * whole manager in degraded mode, which makes every strategy eligible until
 * a periodic recovery check finds all components healthy again.
 */

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::app_config::FallbackConfig;
use crate::errors::TranslationError;
use crate::events::{Event, EventBus, EventType};
use crate::resilience::retry::RetryPolicy;

/// Strategy gated by `enable_local_fallback`
pub const LOCAL_FALLBACK: &str = "local_fallback";
/// Strategy gated by `enable_reduced_quality`
pub const REDUCED_QUALITY: &str = "reduced_quality";
/// Strategy gated by `enable_caching_fallback`
pub const CACHING_FALLBACK: &str = "caching_fallback";
/// Strategy gated by `enable_dictionary_fallback`
pub const DICTIONARY_FALLBACK: &str = "dictionary_fallback";

type StrategyFn<T> = dyn Fn() -> BoxFuture<'static, Result<T, TranslationError>> + Send + Sync;

/// A named alternative to the primary operation
pub struct FallbackStrategy<T> {
    name: String,
    run: Arc<StrategyFn<T>>,
}

impl<T> Clone for FallbackStrategy<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            run: self.run.clone(),
        }
    }
}

impl<T: Send + 'static> FallbackStrategy<T> {
    pub fn new<F, Fut>(name: impl Into<String>, function: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, TranslationError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            run: Arc::new(move || -> BoxFuture<'static, Result<T, TranslationError>> {
                Box::pin(function())
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<T> std::fmt::Debug for FallbackStrategy<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackStrategy").field("name", &self.name).finish()
    }
}

#[derive(Debug)]
struct FailureTracker {
    failures: u64,
    total_requests: u64,
    window_start: Instant,
    last_failure: Option<Instant>,
}

impl FailureTracker {
    fn new() -> Self {
        Self {
            failures: 0,
            total_requests: 0,
            window_start: Instant::now(),
            last_failure: None,
        }
    }

    /// Record one outcome and return the failure rate of the current window
    fn record(&mut self, failed: bool, window: Duration) -> f64 {
        if self.window_start.elapsed() > window {
            self.failures = 0;
            self.total_requests = 0;
            self.window_start = Instant::now();
        }
        self.total_requests += 1;
        if failed {
            self.failures += 1;
            self.last_failure = Some(Instant::now());
        }
        self.failure_rate(window)
    }

    fn failure_rate(&self, window: Duration) -> f64 {
        if self.total_requests == 0 || self.window_start.elapsed() > window {
            return 0.0;
        }
        self.failures as f64 / self.total_requests as f64
    }
}

#[derive(Debug)]
struct RecoveryTracker {
    consecutive_successes: u32,
    last_success: Option<Instant>,
    recovery_started: Instant,
    in_recovery: bool,
}

/// Per-component slice of `FallbackStatus`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComponentStatus {
    pub failure_rate: f64,
    pub total_requests: u64,
    pub failures: u64,
    pub in_recovery: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FallbackStatus {
    pub degraded_mode: bool,
    pub components: BTreeMap<String, ComponentStatus>,
}

pub struct FallbackManager {
    config: FallbackConfig,
    retry: RetryPolicy,
    events: EventBus,
    failures: RwLock<HashMap<String, Arc<Mutex<FailureTracker>>>>,
    recovery: RwLock<HashMap<String, Arc<Mutex<RecoveryTracker>>>>,
    degraded: AtomicBool,
    shutdown: CancellationToken,
}

impl FallbackManager {
    pub fn new(config: FallbackConfig, events: EventBus) -> Self {
        Self {
            retry: RetryPolicy::from_config(&config),
            config,
            events,
            failures: RwLock::new(HashMap::new()),
            recovery: RwLock::new(HashMap::new()),
            degraded: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    /// Start the periodic degraded-mode and recovery checks
    pub fn spawn_monitors(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        let interval = self.config.recovery_check_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(manager) = weak.upgrade() else { break };
                manager.run_recovery_check();
            }
        })
    }

    /// Stop background monitors
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn config(&self) -> &FallbackConfig {
        &self.config
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Run a single operation under the retry policy, without fallbacks
    pub async fn execute_with_retries<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        operation: F,
    ) -> Result<T, TranslationError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TranslationError>>,
    {
        self.retry.execute(cancel, operation).await
    }

    /// Whether a strategy with this name may run right now
    pub fn should_execute_fallback(&self, name: &str) -> bool {
        if self.is_degraded() {
            return true;
        }
        match name {
            LOCAL_FALLBACK => self.config.enable_local_fallback,
            REDUCED_QUALITY => self.config.enable_reduced_quality,
            CACHING_FALLBACK => self.config.enable_caching_fallback,
            DICTIONARY_FALLBACK => self.config.enable_dictionary_fallback,
            _ => true,
        }
    }

    /// Run `primary` with retries, then each eligible strategy with retries.
    ///
    /// Returns the first success. When everything fails the primary error is
    /// returned wrapped in `AllFallbacksFailed`. Cancellation is returned as is.
    pub async fn execute_with_fallback<T, F, Fut>(
        &self,
        component_id: &str,
        cancel: &CancellationToken,
        primary: F,
        strategies: &[FallbackStrategy<T>],
    ) -> Result<T, TranslationError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TranslationError>>,
    {
        self.execute_with_fallback_policy(component_id, cancel, &self.retry, primary, strategies)
            .await
    }

    /// Like `execute_with_fallback`, with `policy` governing the primary
    /// operation instead of the manager's own retry policy
    pub async fn execute_with_fallback_policy<T, F, Fut>(
        &self,
        component_id: &str,
        cancel: &CancellationToken,
        policy: &RetryPolicy,
        primary: F,
        strategies: &[FallbackStrategy<T>],
    ) -> Result<T, TranslationError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TranslationError>>,
    {
        let started = Instant::now();
        let result = self
            .run_chain(component_id, cancel, policy, primary, strategies, started)
            .await;
        self.events.publish(
            Event::new(
                EventType::OperationMetrics,
                format!("Operation completed for {}", component_id),
            )
            .with_data("component_id", component_id)
            .with_data("duration_ms", started.elapsed().as_millis() as u64)
            .with_data("success", result.is_ok()),
        );
        result
    }

    async fn run_chain<T, F, Fut>(
        &self,
        component_id: &str,
        cancel: &CancellationToken,
        policy: &RetryPolicy,
        primary: F,
        strategies: &[FallbackStrategy<T>],
        started: Instant,
    ) -> Result<T, TranslationError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TranslationError>>,
    {
        let primary_error = match policy.execute(cancel, primary).await {
            Ok(value) => {
                self.record_success(component_id);
                return Ok(value);
            }
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => e,
        };
        self.record_failure(component_id, &primary_error);

        for strategy in strategies {
            if !self.should_execute_fallback(&strategy.name) {
                debug!("Skipping disabled fallback '{}' for {}", strategy.name, component_id);
                continue;
            }
            info!(
                "Executing fallback '{}' for {} after: {}",
                strategy.name, component_id, primary_error
            );
            let run = strategy.run.clone();
            match self.retry.execute(cancel, move || (*run)()).await {
                Ok(value) => {
                    self.events.publish(
                        Event::new(
                            EventType::FallbackSuccess,
                            format!("Fallback strategy '{}' succeeded for {}", strategy.name, component_id),
                        )
                        .with_data("component_id", component_id)
                        .with_data("strategy", strategy.name.as_str())
                        .with_data("duration_ms", started.elapsed().as_millis() as u64),
                    );
                    return Ok(value);
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => warn!("Fallback '{}' failed for {}: {}", strategy.name, component_id, e),
            }
        }

        self.events.publish(
            Event::new(
                EventType::AllFallbacksFailed,
                format!("All fallback strategies failed for {}", component_id),
            )
            .with_data("component_id", component_id)
            .with_data("duration_ms", started.elapsed().as_millis() as u64)
            .with_error(&primary_error),
        );
        Err(TranslationError::AllFallbacksFailed {
            component: component_id.to_string(),
            source: Box::new(primary_error),
        })
    }

    pub fn record_success(&self, component_id: &str) {
        let window = self.config.failure_tracking_window();
        self.failure_tracker(component_id).lock().record(false, window);

        let tracker = self.recovery_tracker(component_id);
        let mut recovery = tracker.lock();
        recovery.consecutive_successes += 1;
        recovery.last_success = Some(Instant::now());
        if recovery.in_recovery
            && recovery.consecutive_successes >= self.config.recovery_success_threshold
        {
            recovery.in_recovery = false;
            info!("Component {} recovered", component_id);
        }
    }

    pub fn record_failure(&self, component_id: &str, error: &TranslationError) {
        let window = self.config.failure_tracking_window();
        let failure_rate = self.failure_tracker(component_id).lock().record(true, window);

        {
            let tracker = self.recovery_tracker(component_id);
            let mut recovery = tracker.lock();
            recovery.consecutive_successes = 0;
            if !recovery.in_recovery {
                recovery.in_recovery = true;
                recovery.recovery_started = Instant::now();
            }
        }

        if self.config.enable_graceful_degradation
            && failure_rate >= self.config.degradation_threshold
            && self
                .degraded
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            warn!(
                "Entering degraded mode: {} failure rate {:.2}",
                component_id, failure_rate
            );
            self.events.publish(
                Event::new(
                    EventType::DegradedModeEntered,
                    format!("Entered degraded mode due to high failure rate on {}", component_id),
                )
                .with_data("component_id", component_id)
                .with_data("failure_rate", failure_rate)
                .with_data("threshold", self.config.degradation_threshold),
            );
        }

        if failure_rate >= self.config.alert_threshold {
            self.events.publish(
                Event::new(
                    EventType::FailureAlert,
                    format!("High failure rate alert for {}", component_id),
                )
                .with_data("component_id", component_id)
                .with_data("failure_rate", failure_rate)
                .with_data("threshold", self.config.alert_threshold)
                .with_error(error),
            );
        }
    }

    pub fn failure_rate(&self, component_id: &str) -> f64 {
        let window = self.config.failure_tracking_window();
        self.failures
            .read()
            .get(component_id)
            .map(|t| t.lock().failure_rate(window))
            .unwrap_or(0.0)
    }

    /// One pass of the periodic monitors: leave degraded mode when no
    /// component is above the threshold, and reset stale recovery streaks.
    pub fn run_recovery_check(&self) {
        let window = self.config.failure_tracking_window();
        if self.is_degraded() {
            let any_unhealthy = self
                .failures
                .read()
                .values()
                .any(|t| t.lock().failure_rate(window) >= self.config.degradation_threshold);
            if !any_unhealthy
                && self
                    .degraded
                    .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
            {
                info!("Exited degraded mode");
                self.events.publish(Event::new(
                    EventType::DegradedModeExited,
                    "Exited degraded mode - system recovered",
                ));
            }
        }

        let recovery_window = self.config.recovery_window();
        for (component_id, tracker) in self.recovery.read().iter() {
            let mut recovery = tracker.lock();
            if !recovery.in_recovery {
                continue;
            }
            let since = recovery.last_success.unwrap_or(recovery.recovery_started);
            if since.elapsed() > recovery_window && recovery.consecutive_successes > 0 {
                debug!("Recovery window expired for {}", component_id);
                recovery.consecutive_successes = 0;
            }
        }
    }

    pub fn status(&self) -> FallbackStatus {
        let window = self.config.failure_tracking_window();
        let recovery = self.recovery.read();
        let components = self
            .failures
            .read()
            .iter()
            .map(|(id, tracker)| {
                let t = tracker.lock();
                let in_recovery = recovery.get(id).map(|r| r.lock().in_recovery).unwrap_or(false);
                (
                    id.clone(),
                    ComponentStatus {
                        failure_rate: t.failure_rate(window),
                        total_requests: t.total_requests,
                        failures: t.failures,
                        in_recovery,
                    },
                )
            })
            .collect();
        FallbackStatus {
            degraded_mode: self.is_degraded(),
            components,
        }
    }

    fn failure_tracker(&self, component_id: &str) -> Arc<Mutex<FailureTracker>> {
        if let Some(tracker) = self.failures.read().get(component_id) {
            return tracker.clone();
        }
        self.failures
            .write()
            .entry(component_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(FailureTracker::new())))
            .clone()
    }

    fn recovery_tracker(&self, component_id: &str) -> Arc<Mutex<RecoveryTracker>> {
        if let Some(tracker) = self.recovery.read().get(component_id) {
            return tracker.clone();
        }
        self.recovery
            .write()
            .entry(component_id.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(RecoveryTracker {
                    consecutive_successes: 0,
                    last_success: None,
                    recovery_started: Instant::now(),
                    in_recovery: false,
                }))
            })
            .clone()
    }
}

impl Drop for FallbackManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for FallbackManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackManager")
            .field("degraded", &self.is_degraded())
            .field("retry", &self.retry)
            .finish()
    }
}
