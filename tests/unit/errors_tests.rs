/*!
 * Tests for error types and retry classification
 */

use ebook_translator::errors::{AppError, ErrorKind, ProviderError, TranslationError};

#[test]
fn test_providerError_transientKinds_shouldBeRetryable() {
    assert!(ProviderError::ConnectionError("reset".into()).is_retryable());
    assert!(ProviderError::RateLimitExceeded("slow down".into()).is_retryable());
    assert!(ProviderError::TextSizeError("too long".into()).is_retryable());
    assert!(ProviderError::ApiError { status_code: 503, message: "busy".into() }.is_retryable());
}

#[test]
fn test_providerError_permanentKinds_shouldNotBeRetryable() {
    assert!(!ProviderError::AuthenticationError("bad key".into()).is_retryable());
    assert!(!ProviderError::ParseError("garbage".into()).is_retryable());
    assert!(!ProviderError::ConfigError("no binary".into()).is_retryable());
    assert!(!ProviderError::ApiError { status_code: 404, message: "gone".into() }.is_retryable());
    assert!(!ProviderError::Cancelled.is_retryable());
}

#[test]
fn test_translationError_circuitOpen_shouldNotBeRetryable() {
    assert!(!TranslationError::CircuitOpen.is_retryable());
    assert_eq!(TranslationError::CircuitOpen.kind(), ErrorKind::CircuitOpen);
}

#[test]
fn test_translationError_remoteStatus_shouldRetryServerErrorsOnly() {
    let server = TranslationError::TranslationFailed { status: 502, body: String::new() };
    let throttled = TranslationError::TranslationFailed { status: 429, body: String::new() };
    let client = TranslationError::TranslationFailed { status: 400, body: String::new() };
    assert!(server.is_retryable());
    assert!(throttled.is_retryable());
    assert!(!client.is_retryable());
}

#[test]
fn test_translationError_versionMismatch_shouldNotBeRetryable() {
    let error = TranslationError::VersionMismatch {
        worker_id: "w1".into(),
        local: "v1.2.3".into(),
        remote: "v0.9.0".into(),
    };
    assert!(!error.is_retryable());
    let display = error.to_string();
    assert!(display.contains("v1.2.3") && display.contains("v0.9.0"));
}

#[test]
fn test_translationError_cancelledProvider_shouldCountAsCancelled() {
    let error: TranslationError = ProviderError::Cancelled.into();
    assert!(error.is_cancelled());
    assert_eq!(error.kind(), ErrorKind::Cancelled);
}

#[test]
fn test_allFallbacksFailed_kind_shouldBeThePrimaryKind() {
    let error = TranslationError::AllFallbacksFailed {
        component: "backend:openai".into(),
        source: Box::new(ProviderError::RateLimitExceeded("429".into()).into()),
    };
    assert_eq!(error.kind(), ErrorKind::RateLimited);
    assert_eq!(error.kind().as_str(), "rate_limited");
}

#[test]
fn test_appError_fromTranslationError_shouldWrap() {
    let error: AppError = TranslationError::NoRemoteInstances.into();
    assert!(error.to_string().contains("no remote instances available"));
}
