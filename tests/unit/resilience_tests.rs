/*!
 * Tests for the circuit breaker, retry policy and fallback manager
 */

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use ebook_translator::errors::{ProviderError, TranslationError};
use ebook_translator::events::{EventBus, EventType};
use ebook_translator::resilience::fallback::{DICTIONARY_FALLBACK, LOCAL_FALLBACK};
use ebook_translator::resilience::{CircuitBreaker, CircuitState, FallbackManager, FallbackStrategy, RetryPolicy};

use crate::common::{EventRecorder, fast_fallback_config};

fn transport() -> TranslationError {
    ProviderError::ConnectionError("connection reset".into()).into()
}

async fn fail(breaker: &CircuitBreaker) -> Result<(), TranslationError> {
    breaker.call(|| async { Err::<(), _>(transport()) }).await
}

#[tokio::test]
async fn test_breaker_afterThresholdFailures_shouldOpenAndReject() {
    let breaker = CircuitBreaker::new("backend", 2, Duration::from_secs(60), 1);
    let _ = fail(&breaker).await;
    assert_eq!(breaker.get_state(), CircuitState::Closed);
    let _ = fail(&breaker).await;
    assert_eq!(breaker.get_state(), CircuitState::Open);

    let invoked = AtomicUsize::new(0);
    let result = breaker
        .call(|| async {
            invoked.fetch_add(1, Ordering::SeqCst);
            Ok::<_, TranslationError>("never")
        })
        .await;
    assert!(matches!(result, Err(TranslationError::CircuitOpen)));
    assert_eq!(invoked.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_breaker_successInClosed_shouldResetFailures() {
    let breaker = CircuitBreaker::new("backend", 3, Duration::from_secs(60), 1);
    let _ = fail(&breaker).await;
    let _ = fail(&breaker).await;
    assert_eq!(breaker.failures(), 2);
    breaker.call(|| async { Ok::<_, TranslationError>(()) }).await.unwrap();
    assert_eq!(breaker.failures(), 0);
}

#[tokio::test]
async fn test_breaker_afterRecoveryTimeout_shouldProbeAndClose() {
    let breaker = CircuitBreaker::new("backend", 1, Duration::from_millis(30), 2);
    let _ = fail(&breaker).await;
    assert_eq!(breaker.get_state(), CircuitState::Open);
    tokio::time::sleep(Duration::from_millis(50)).await;

    breaker.call(|| async { Ok::<_, TranslationError>(()) }).await.unwrap();
    assert_eq!(breaker.get_state(), CircuitState::HalfOpen);
    breaker.call(|| async { Ok::<_, TranslationError>(()) }).await.unwrap();
    assert_eq!(breaker.get_state(), CircuitState::Closed);
}

#[tokio::test]
async fn test_breaker_failedProbe_shouldReopen() {
    let breaker = CircuitBreaker::new("backend", 1, Duration::from_millis(20), 1);
    let _ = fail(&breaker).await;
    tokio::time::sleep(Duration::from_millis(40)).await;
    let _ = fail(&breaker).await;
    assert_eq!(breaker.get_state(), CircuitState::Open);
    assert!(matches!(fail(&breaker).await, Err(TranslationError::CircuitOpen)));
}

#[tokio::test]
async fn test_retry_withTransientFailures_shouldSucceedAfterBackoff() {
    let policy = RetryPolicy::from_config(&fast_fallback_config(3));
    let attempts = AtomicUsize::new(0);
    let started = Instant::now();

    let result = policy
        .execute(&CancellationToken::new(), || async {
            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(transport())
            } else {
                Ok("Bonjour")
            }
        })
        .await;

    assert_eq!(result.unwrap(), "Bonjour");
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert!(started.elapsed() >= Duration::from_millis(30));
}

#[tokio::test]
async fn test_retry_withPermanentError_shouldStopImmediately() {
    let policy = RetryPolicy::from_config(&fast_fallback_config(5));
    let attempts = AtomicUsize::new(0);
    let result: Result<(), _> = policy
        .execute(&CancellationToken::new(), || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(ProviderError::AuthenticationError("bad key".into()).into())
        })
        .await;
    assert!(result.is_err());
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_retry_withPersistentTransportError_shouldStopAfterMaxRetriesWithLastError() {
    let policy = RetryPolicy::from_config(&fast_fallback_config(2));
    let attempts = AtomicUsize::new(0);
    let result: Result<(), _> = policy
        .execute(&CancellationToken::new(), || async {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            Err(ProviderError::ConnectionError(format!("reset on attempt {}", attempt)).into())
        })
        .await;

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    match result {
        Err(TranslationError::Provider(ProviderError::ConnectionError(message))) => {
            assert_eq!(message, "reset on attempt 3");
        }
        other => panic!("expected the last transport error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_retry_withSlowAttempt_shouldTimeOut() {
    let policy = RetryPolicy::no_retries(Duration::from_millis(20));
    let result = policy
        .execute(&CancellationToken::new(), || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, TranslationError>(())
        })
        .await;
    assert!(matches!(result, Err(TranslationError::Timeout(_))));
}

#[tokio::test]
async fn test_retry_cancelledDuringBackoff_shouldReturnCancelled() {
    let mut config = fast_fallback_config(5);
    config.retry_backoff_base_ms = 10_000;
    config.max_backoff_ms = 10_000;
    let policy = RetryPolicy::from_config(&config);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let result: Result<(), _> = policy.execute(&cancel, || async { Err(transport()) }).await;
    assert!(matches!(result, Err(TranslationError::Cancelled)));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_fallback_primaryFails_shouldUseFirstEligibleStrategy() {
    let events = EventBus::new();
    let recorder = EventRecorder::attach(&events);
    let manager = FallbackManager::new(fast_fallback_config(0), events);
    let strategies = vec![
        FallbackStrategy::new("broken", || async { Err::<String, _>(transport()) }),
        FallbackStrategy::new(LOCAL_FALLBACK, || async { Ok("[local] Hello".to_string()) }),
    ];

    let result = manager
        .execute_with_fallback("backend:mock", &CancellationToken::new(), || async { Err(transport()) }, &strategies)
        .await;

    assert_eq!(result.unwrap(), "[local] Hello");
    let success = recorder.wait_for(EventType::FallbackSuccess, 1, Duration::from_secs(1)).await;
    assert_eq!(success[0].data_str("strategy"), Some(LOCAL_FALLBACK));
}

#[tokio::test]
async fn test_fallback_disabledStrategy_shouldBeSkippedWhenHealthy() {
    let mut config = fast_fallback_config(0);
    config.enable_dictionary_fallback = false;
    config.enable_graceful_degradation = false;
    let manager = FallbackManager::new(config, EventBus::new());
    assert!(!manager.should_execute_fallback(DICTIONARY_FALLBACK));
    assert!(manager.should_execute_fallback("custom"));

    let strategies = vec![FallbackStrategy::new(DICTIONARY_FALLBACK, || async { Ok(1) })];
    let result = manager
        .execute_with_fallback("c", &CancellationToken::new(), || async { Err(transport()) }, &strategies)
        .await;
    match result {
        Err(TranslationError::AllFallbacksFailed { component, source }) => {
            assert_eq!(component, "c");
            assert!(matches!(*source, TranslationError::Provider(ProviderError::ConnectionError(_))));
        }
        other => panic!("unexpected result: {:?}", other),
    }
}

#[tokio::test]
async fn test_fallback_highFailureRate_shouldEnterDegradedModeOnceAndRecover() {
    let mut config = fast_fallback_config(0);
    config.enable_local_fallback = false;
    let events = EventBus::new();
    let recorder = EventRecorder::attach(&events);
    let manager = Arc::new(FallbackManager::new(config, events));

    for _ in 0..3 {
        let _ = manager
            .execute_with_fallback::<(), _, _>("c", &CancellationToken::new(), || async { Err(transport()) }, &[])
            .await;
    }
    assert!(manager.is_degraded());
    assert!(manager.should_execute_fallback(LOCAL_FALLBACK));
    recorder.settle().await;
    assert_eq!(recorder.of_type(EventType::DegradedModeEntered).len(), 1);

    // Enough successes bring the rate under the threshold
    for _ in 0..4 {
        manager.record_success("c");
    }
    manager.run_recovery_check();
    assert!(!manager.is_degraded());
    let exited = recorder.wait_for(EventType::DegradedModeExited, 1, Duration::from_secs(1)).await;
    assert_eq!(exited.len(), 1);
}

#[tokio::test]
async fn test_fallback_cancelled_shouldNotRunStrategies() {
    let manager = FallbackManager::new(fast_fallback_config(2), EventBus::new());
    let cancel = CancellationToken::new();
    cancel.cancel();
    let ran = Arc::new(AtomicUsize::new(0));
    let counter = ran.clone();
    let strategies = vec![FallbackStrategy::new("any", move || {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    })];

    let result = manager
        .execute_with_fallback("c", &cancel, || async { Ok(()) }, &strategies)
        .await;
    assert!(matches!(result, Err(TranslationError::Cancelled)));
    assert_eq!(ran.load(Ordering::SeqCst), 0);
}
