/*!
 * Three-state circuit breaker.
 *
 * The state lock is only held to decide whether a call may proceed and to
 * record its outcome, never across the call itself.
 */

use std::future::Future;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Serialize;

use crate::app_config::CircuitBreakerConfig;
use crate::errors::TranslationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failures: u32,
    successes: u32,
    last_failure: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    recovery_timeout: Duration,
    success_threshold: u32,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(
        name: impl Into<String>,
        failure_threshold: u32,
        recovery_timeout: Duration,
        success_threshold: u32,
    ) -> Self {
        Self {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            success_threshold: success_threshold.max(1),
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failures: 0,
                successes: 0,
                last_failure: None,
            }),
        }
    }

    pub fn from_config(name: impl Into<String>, config: &CircuitBreakerConfig) -> Self {
        Self::new(
            name,
            config.failure_threshold,
            config.recovery_timeout(),
            config.success_threshold,
        )
    }

    /// Run `operation` through the breaker.
    ///
    /// While open and inside the recovery timeout the operation is not
    /// invoked and `CircuitOpen` is returned. Cancellation is not counted as
    /// a failure.
    pub async fn call<T, F, Fut>(&self, operation: F) -> Result<T, TranslationError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, TranslationError>>,
    {
        self.admit()?;
        let result = operation().await;
        match &result {
            Ok(_) => self.record_success(),
            Err(e) if e.is_cancelled() => {}
            Err(_) => self.record_failure(),
        }
        result
    }

    pub fn get_state(&self) -> CircuitState {
        self.state.lock().state
    }

    pub fn failures(&self) -> u32 {
        self.state.lock().failures
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn admit(&self) -> Result<(), TranslationError> {
        let mut s = self.state.lock();
        if s.state != CircuitState::Open {
            return Ok(());
        }
        let waited = s.last_failure.map(|t| t.elapsed()).unwrap_or(Duration::MAX);
        if waited >= self.recovery_timeout {
            s.state = CircuitState::HalfOpen;
            s.successes = 0;
            info!("Circuit '{}' half-open, probing", self.name);
            Ok(())
        } else {
            debug!("Circuit '{}' open, rejecting call", self.name);
            Err(TranslationError::CircuitOpen)
        }
    }

    fn record_success(&self) {
        let mut s = self.state.lock();
        match s.state {
            CircuitState::Closed => s.failures = 0,
            CircuitState::HalfOpen => {
                s.successes += 1;
                if s.successes >= self.success_threshold {
                    s.state = CircuitState::Closed;
                    s.failures = 0;
                    s.successes = 0;
                    info!("Circuit '{}' closed", self.name);
                }
            }
            // A call admitted before another task opened the circuit
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self) {
        let mut s = self.state.lock();
        match s.state {
            CircuitState::Closed => {
                s.failures += 1;
                if s.failures >= self.failure_threshold {
                    s.state = CircuitState::Open;
                    s.last_failure = Some(Instant::now());
                    warn!(
                        "Circuit '{}' opened after {} consecutive failures",
                        self.name, s.failures
                    );
                }
            }
            CircuitState::HalfOpen => {
                s.state = CircuitState::Open;
                s.successes = 0;
                s.last_failure = Some(Instant::now());
                warn!("Circuit '{}' re-opened during probe", self.name);
            }
            CircuitState::Open => {
                s.last_failure = Some(Instant::now());
            }
        }
    }
}
