/*!
 * End-to-end tests for the local coordinator with a scripted backend
 */

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use ebook_translator::book::{Book, Chapter, HINT_BOOK_TITLE, Metadata, UnitPath};
use ebook_translator::errors::{ErrorKind, TranslationError};
use ebook_translator::events::{EventBus, EventType};
use ebook_translator::providers::mock::MockProvider;
use ebook_translator::providers::{Backend, Prompt};
use ebook_translator::resilience::fallback::LOCAL_FALLBACK;
use ebook_translator::resilience::{CircuitState, FallbackManager};
use ebook_translator::translation::cache::{CacheKey, TranslationCache};
use ebook_translator::translation::coordinator::{LocalCoordinator, UnitFallback};
use ebook_translator::translation::detection::StaticLanguageDetector;
use ebook_translator::translation::walker::UnitSource;

use crate::common::{
    EventRecorder, init_test_logging, book_with_title, breaker_config, coordinator_config, fast_fallback_config, sample_book,
};

struct Harness {
    coordinator: LocalCoordinator,
    recorder: EventRecorder,
}

fn harness(
    backend: MockProvider,
    max_retries: u32,
    failure_threshold: u32,
    source: Option<&str>,
    max_concurrent: usize,
) -> Harness {
    init_test_logging();
    let events = EventBus::new();
    let recorder = EventRecorder::attach(&events);
    let fallback = Arc::new(FallbackManager::new(fast_fallback_config(max_retries), events.clone()));
    let coordinator = LocalCoordinator::new(
        Arc::new(backend),
        TranslationCache::new(Duration::from_secs(3600), true),
        fallback,
        &breaker_config(failure_threshold, 60_000),
        coordinator_config(source, "fr", max_concurrent),
        events,
    );
    Harness { coordinator, recorder }
}

fn local_fallback() -> UnitFallback {
    UnitFallback::new(LOCAL_FALLBACK, |text: String, _prompt: Prompt, _cancel: CancellationToken| async move {
        Ok(format!("[local] {}", text))
    })
}

#[tokio::test]
async fn test_translateBook_withPreseededCache_shouldNotCallBackend() {
    let backend = MockProvider::panicking().with_name("openai").with_model("gpt-4");
    let h = harness(backend.clone(), 0, 5, Some("en"), 2);
    let key = CacheKey::new("Hello", HINT_BOOK_TITLE, "openai", "gpt-4").fingerprint();
    h.coordinator.cache().set(&key, "Bonjour");

    let report = h
        .coordinator
        .translate_book(&book_with_title("Hello"), Some("session-1"), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.book.metadata.title, "Bonjour");
    assert_eq!(report.cached, 1);
    assert_eq!(backend.calls(), 0);

    let progress = h.recorder.wait_for(EventType::Progress, 2, Duration::from_secs(1)).await;
    let from_cache: Vec<_> = progress.iter().filter(|e| e.data_str("source") == Some("cache")).collect();
    assert_eq!(from_cache.len(), 1);
    assert_eq!(from_cache[0].data_str("path"), Some("metadata.title"));
    assert_eq!(from_cache[0].data_str("session_id"), Some("session-1"));
}

#[tokio::test]
async fn test_translateText_withTransientFailures_shouldRetryWithBackoffAndCache() {
    let backend = MockProvider::fail_first(2);
    let h = harness(backend.clone(), 3, 5, Some("en"), 1);
    let prompt = Prompt::new(Some("en"), "fr", HINT_BOOK_TITLE);

    let started = Instant::now();
    let outcome = h
        .coordinator
        .translate_text("Hello", &prompt, &CancellationToken::new())
        .await
        .unwrap();

    assert!(started.elapsed() >= Duration::from_millis(30));
    assert_eq!(outcome.text, "[fr] Hello");
    assert_eq!(outcome.source, UnitSource::Backend);
    assert_eq!(backend.calls(), 3);
    assert_eq!(h.coordinator.cache().size(), 1);

    // Second call is served from the cache
    let again = h
        .coordinator
        .translate_text("Hello", &prompt, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(again.source, UnitSource::Cache);
    assert_eq!(backend.calls(), 3);
}

#[tokio::test]
async fn test_translateBook_withFailingBackend_shouldOpenBreakerAndUseFallback() {
    let backend = MockProvider::failing();
    let events = EventBus::new();
    let recorder = EventRecorder::attach(&events);
    let fallback = Arc::new(FallbackManager::new(fast_fallback_config(0), events.clone()));
    let coordinator = LocalCoordinator::new(
        Arc::new(backend.clone()),
        TranslationCache::new(Duration::from_secs(3600), true),
        fallback.clone(),
        &breaker_config(2, 50),
        coordinator_config(Some("en"), "fr", 1),
        events,
    )
    .with_fallback(local_fallback());

    let book = Book {
        metadata: Metadata {
            title: "One".to_string(),
            description: "Two".to_string(),
            ..Metadata::default()
        },
        chapters: vec![Chapter {
            title: "Three".to_string(),
            sections: Vec::new(),
        }],
    };
    let report = coordinator
        .translate_book(&book, None, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(backend.calls(), 2);
    assert_eq!(coordinator.breaker().get_state(), CircuitState::Open);
    assert_eq!(report.fallbacks, 3);
    assert!(report.is_complete());
    assert_eq!(report.book.metadata.title, "[local] One");
    assert_eq!(report.book.metadata.description, "[local] Two");
    assert_eq!(report.book.chapters[0].title, "[local] Three");
    // Fallback results are never cached
    assert_eq!(coordinator.cache().size(), 0);

    assert!(fallback.is_degraded());
    recorder.settle().await;
    assert_eq!(recorder.of_type(EventType::DegradedModeEntered).len(), 1);
}

#[tokio::test]
async fn test_translateBook_withConcurrency_shouldPreserveStructureAndOrder() {
    let backend = MockProvider::slow(10);
    let h = harness(backend.clone(), 0, 5, Some("ru"), 4);
    let book = sample_book();

    let report = h
        .coordinator
        .translate_book(&book, None, &CancellationToken::new())
        .await
        .unwrap();

    let translated = report.book.units();
    let original = book.units();
    assert_eq!(translated.len(), original.len());
    for (out, input) in translated.iter().zip(original.iter()) {
        assert_eq!(out.path, input.path);
        if input.is_blank() {
            assert_eq!(out.text, input.text);
        } else {
            assert_eq!(out.text, format!("[fr] {}", input.text));
        }
    }
    assert_eq!(report.skipped, 1);
    assert_eq!(report.translated, original.len() - 1);
    assert_eq!(report.total_units, original.len());
    assert_eq!(report.book.metadata.language, book.metadata.language);

    // Metadata goes first, with the matching context hints
    let requests = backend.requests();
    assert_eq!(requests.len(), original.len() - 1);
    let first_two: Vec<&str> = requests[..2].iter().map(|r| r.context_hint.as_str()).collect();
    assert!(first_two.contains(&"Book title") && first_two.contains(&"Book description"));
    assert!(requests.iter().all(|r| r.source_language.as_deref() == Some("ru")));

    let progress = h
        .recorder
        .wait_for(EventType::Progress, original.len(), Duration::from_secs(1))
        .await;
    assert_eq!(progress.len(), original.len());
    let completed = h
        .recorder
        .wait_for(EventType::TranslationCompleted, 1, Duration::from_secs(1))
        .await;
    assert_eq!(completed.len(), 1);
}

#[tokio::test]
async fn test_translateBook_withBlankUnits_shouldSkipBackend() {
    let backend = MockProvider::working();
    let h = harness(backend.clone(), 0, 5, Some("en"), 2);
    let book = Book {
        metadata: Metadata {
            title: "   ".to_string(),
            ..Metadata::default()
        },
        chapters: Vec::new(),
    };

    let report = h
        .coordinator
        .translate_book(&book, None, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.book, book);
    assert_eq!(report.skipped, 2);
    assert_eq!(backend.calls(), 0);
    assert_eq!(h.coordinator.cache().size(), 0);
}

#[tokio::test]
async fn test_translateBook_withUnrecoverableUnits_shouldKeepSourceAndReportFailures() {
    let backend = MockProvider::failing();
    let h = harness(backend, 0, 100, Some("en"), 2);

    let report = h
        .coordinator
        .translate_book(&book_with_title("Hello"), Some("s"), &CancellationToken::new())
        .await
        .unwrap();

    assert!(!report.is_complete());
    assert_eq!(report.book.metadata.title, "Hello");
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].path, UnitPath::MetadataTitle.to_string());
    assert_eq!(report.failed[0].error_kind, ErrorKind::Transport);

    let failed = h.recorder.wait_for(EventType::UnitFailed, 1, Duration::from_secs(1)).await;
    assert_eq!(failed.len(), 1);
    let progress = h.recorder.wait_for(EventType::Progress, 2, Duration::from_secs(1)).await;
    assert!(progress.iter().any(|e| e.data_str("source") == Some("original")));
}

#[tokio::test]
async fn test_translateBook_whenCancelled_shouldStopPromptly() {
    let backend = MockProvider::slow(5_000);
    let h = harness(backend, 0, 5, Some("en"), 2);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let result = h.coordinator.translate_book(&sample_book(), None, &cancel).await;
    assert!(matches!(result, Err(TranslationError::Cancelled)));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_translateBook_withoutSourceLanguage_shouldUseDetector() {
    let backend = MockProvider::working();
    let h = harness(backend.clone(), 0, 5, None, 2);
    let coordinator = h
        .coordinator
        .with_detector(Arc::new(StaticLanguageDetector(Some("ru".to_string()))));

    let report = coordinator
        .translate_book(&book_with_title("Привет"), None, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.source_language.as_deref(), Some("ru"));
    assert_eq!(backend.requests()[0].source_language.as_deref(), Some("ru"));
    let detected = h.recorder.wait_for(EventType::LanguageDetected, 1, Duration::from_secs(1)).await;
    assert_eq!(detected[0].data_str("language"), Some("ru"));
}

#[tokio::test]
async fn test_translateBook_withUndetectableLanguage_shouldLetModelDetect() {
    let backend = MockProvider::working();
    let h = harness(backend.clone(), 0, 5, None, 2);
    let coordinator = h.coordinator.with_detector(Arc::new(StaticLanguageDetector(None)));

    let report = coordinator
        .translate_book(&book_with_title("Hello"), None, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.source_language, None);
    assert_eq!(backend.requests()[0].source_language, None);
    assert_eq!(coordinator.backend().provider_name(), "mock");
}

#[tokio::test]
async fn test_translateText_withFallback_shouldHandFallbackTheCallersCancellation() {
    let seen = Arc::new(parking_lot::Mutex::new(Vec::<CancellationToken>::new()));
    let recorded = seen.clone();
    let remembering = UnitFallback::new(LOCAL_FALLBACK, move |text: String, _prompt: Prompt, cancel: CancellationToken| {
        recorded.lock().push(cancel);
        async move { Ok(format!("[local] {}", text)) }
    });
    let events = EventBus::new();
    let coordinator = LocalCoordinator::new(
        Arc::new(MockProvider::failing()),
        TranslationCache::new(Duration::from_secs(3600), true),
        Arc::new(FallbackManager::new(fast_fallback_config(0), events.clone())),
        &breaker_config(5, 60_000),
        coordinator_config(Some("en"), "fr", 1),
        events,
    )
    .with_fallback(remembering);

    let caller = CancellationToken::new();
    let prompt = Prompt::new(Some("en"), "fr", HINT_BOOK_TITLE);
    let outcome = coordinator.translate_text("Hello", &prompt, &caller).await.unwrap();
    assert_eq!(outcome.source, UnitSource::Fallback);

    let handed = seen.lock().clone();
    assert_eq!(handed.len(), 1);
    assert!(!handed[0].is_cancelled());
    caller.cancel();
    assert!(handed[0].is_cancelled());
}
