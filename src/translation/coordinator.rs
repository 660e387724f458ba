/*!
 * Local translation coordinator.
 *
 * Translates a book against a single in-process backend. Each unit goes
 * through the cache first; on a miss the backend call runs inside the
 * circuit breaker, which itself runs under the fallback manager's retry
 * policy, and the configured fallbacks take over when that fails.
 */

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use log::{debug, info};
use tokio_util::sync::CancellationToken;

use async_trait::async_trait;

use crate::app_config::{CircuitBreakerConfig, Config, CoordinatorConfig};
use crate::book::{Book, TranslationUnit};
use crate::errors::TranslationError;
use crate::events::{Event, EventBus, EventType};
use crate::providers::dictionary::Dictionary;
use crate::providers::{Backend, Prompt, ProviderBackend};
use crate::resilience::fallback::{DICTIONARY_FALLBACK, LOCAL_FALLBACK};
use crate::resilience::{CircuitBreaker, FallbackManager, FallbackStrategy};
use crate::translation::cache::{CacheKey, TranslationCache};
use crate::translation::detection::{LanguageDetector, LlmLanguageDetector};
use crate::translation::walker::{BookWalker, JobContext, TranslationReport, UnitOutcome, UnitSource, UnitTranslator};

type UnitFallbackFn =
    dyn Fn(String, Prompt, CancellationToken) -> BoxFuture<'static, Result<String, TranslationError>> + Send + Sync;

/// A named per-unit alternative used when the primary path fails
#[derive(Clone)]
pub struct UnitFallback {
    name: String,
    run: Arc<UnitFallbackFn>,
}

impl UnitFallback {
    pub fn new<F, Fut>(name: impl Into<String>, function: F) -> Self
    where
        F: Fn(String, Prompt, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, TranslationError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            run: Arc::new(
                move |text, prompt, cancel| -> BoxFuture<'static, Result<String, TranslationError>> {
                    Box::pin(function(text, prompt, cancel))
                },
            ),
        }
    }

    /// Word substitution, gated by `enable_dictionary_fallback`
    pub fn dictionary(dictionary: Dictionary) -> Self {
        Self::new(DICTIONARY_FALLBACK, move |text, _prompt, _cancel| {
            let dictionary = dictionary.clone();
            async move { Ok(dictionary.apply(&text)) }
        })
    }

    /// Another backend, gated by `enable_local_fallback`
    pub fn backend(backend: Arc<dyn Backend>) -> Self {
        Self::new(LOCAL_FALLBACK, move |text, prompt, cancel| {
            let backend = backend.clone();
            async move {
                backend
                    .translate(&text, &prompt, &cancel)
                    .await
                    .map_err(TranslationError::from)
            }
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bind this fallback to one unit. The fallback runs under a child of
    /// `cancel`, so cancelling the caller also stops it.
    pub fn strategy(&self, text: &str, prompt: &Prompt, cancel: &CancellationToken) -> FallbackStrategy<UnitOutcome> {
        let run = self.run.clone();
        let text = text.to_string();
        let prompt = prompt.clone();
        let cancel = cancel.child_token();
        FallbackStrategy::new(self.name.clone(), move || {
            let future = (*run)(text.clone(), prompt.clone(), cancel.clone());
            async move { future.await.map(|t| UnitOutcome::new(t, UnitSource::Fallback)) }
        })
    }
}

impl std::fmt::Debug for UnitFallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitFallback").field("name", &self.name).finish()
    }
}

pub struct LocalCoordinator {
    backend: Arc<dyn Backend>,
    cache: TranslationCache,
    breaker: CircuitBreaker,
    fallback: Arc<FallbackManager>,
    events: EventBus,
    config: CoordinatorConfig,
    fallbacks: Vec<UnitFallback>,
    detector: Option<Arc<dyn LanguageDetector>>,
    component_id: String,
}

impl LocalCoordinator {
    pub fn new(
        backend: Arc<dyn Backend>,
        cache: TranslationCache,
        fallback: Arc<FallbackManager>,
        breaker_config: &CircuitBreakerConfig,
        config: CoordinatorConfig,
        events: EventBus,
    ) -> Self {
        let component_id = format!("backend:{}", backend.provider_name());
        Self {
            breaker: CircuitBreaker::from_config(component_id.clone(), breaker_config),
            backend,
            cache,
            fallback,
            events,
            config,
            fallbacks: Vec::new(),
            detector: None,
            component_id,
        }
    }

    /// Wire a coordinator from application configuration.
    ///
    /// Must be called inside a Tokio runtime; the cache sweeper and the
    /// fallback monitors are spawned on it.
    pub fn from_config(config: &Config, events: EventBus) -> Result<Self, TranslationError> {
        let fallback = Arc::new(FallbackManager::new(config.fallback.clone(), events.clone()));
        fallback.spawn_monitors();
        Self::from_config_with_manager(config, fallback, events)
    }

    /// Like `from_config`, sharing an existing fallback manager
    pub fn from_config_with_manager(
        config: &Config,
        fallback: Arc<FallbackManager>,
        events: EventBus,
    ) -> Result<Self, TranslationError> {
        let backend: Arc<dyn Backend> = Arc::new(ProviderBackend::from_config(&config.provider)?);
        let cache = TranslationCache::with_sweeper(
            config.cache.ttl(),
            config.cache.enabled,
            config.cache.cleanup_interval(),
        );

        let detector: Arc<dyn LanguageDetector> = Arc::new(LlmLanguageDetector::new(backend.clone()));
        Ok(Self::new(
            backend,
            cache,
            fallback,
            &config.circuit_breaker,
            config.coordinator.clone(),
            events,
        )
        .with_fallback(UnitFallback::dictionary(Dictionary::new()))
        .with_detector(detector))
    }

    pub fn with_fallback(mut self, fallback: UnitFallback) -> Self {
        self.fallbacks.push(fallback);
        self
    }

    pub fn with_detector(mut self, detector: Arc<dyn LanguageDetector>) -> Self {
        self.detector = Some(detector);
        self
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn cache(&self) -> &TranslationCache {
        &self.cache
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn fallback_manager(&self) -> &Arc<FallbackManager> {
        &self.fallback
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Source language from config, else from the detector, else `None`
    pub async fn resolve_source_language(
        &self,
        book: &Book,
        session_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> Option<String> {
        if let Some(source) = &self.config.source_language {
            return Some(source.clone());
        }
        let detector = self.detector.as_ref()?;
        let sample = book.sample_text(self.config.detection_sample_chars);
        let detected = detector.detect(&sample, cancel).await;
        match &detected {
            Some(code) => {
                info!("Detected source language: {}", code);
                self.events.publish(
                    Event::new(EventType::LanguageDetected, format!("Detected source language {}", code))
                        .with_session(session_id)
                        .with_data("language", code.as_str()),
                );
            }
            None => info!("Source language unknown, the model will detect it"),
        }
        detected
    }

    pub async fn translate_book(
        &self,
        book: &Book,
        session_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<TranslationReport, TranslationError> {
        let source = self.resolve_source_language(book, session_id, cancel).await;
        let job = JobContext::new(session_id, source.as_deref(), &self.config.target_language);
        BookWalker::new(self.events.clone(), self.config.max_concurrent)
            .translate_book(self, book, &job, cancel)
            .await
    }

    /// Translate a single fragment outside of a book
    pub async fn translate_text(
        &self,
        text: &str,
        prompt: &Prompt,
        cancel: &CancellationToken,
    ) -> Result<UnitOutcome, TranslationError> {
        if text.trim().is_empty() {
            return Ok(UnitOutcome::new(text, UnitSource::Passthrough));
        }

        let key = CacheKey::new(text, &prompt.context_hint, self.backend.provider_name(), self.backend.model())
            .fingerprint();
        if let Some(cached) = self.cache.get(&key) {
            debug!("Cache hit for {} chars of {}", text.len(), prompt.context_hint);
            return Ok(UnitOutcome::new(cached, UnitSource::Cache));
        }

        let strategies: Vec<FallbackStrategy<UnitOutcome>> =
            self.fallbacks.iter().map(|f| f.strategy(text, prompt, cancel)).collect();

        let outcome = self
            .fallback
            .execute_with_fallback(
                &self.component_id,
                cancel,
                || self.call_backend(text, prompt, cancel),
                &strategies,
            )
            .await?;

        if outcome.source == UnitSource::Backend {
            self.cache.set(&key, &outcome.text);
        }
        Ok(outcome)
    }

    async fn call_backend(
        &self,
        text: &str,
        prompt: &Prompt,
        cancel: &CancellationToken,
    ) -> Result<UnitOutcome, TranslationError> {
        self.breaker
            .call(|| async {
                self.backend
                    .translate(text, prompt, cancel)
                    .await
                    .map(|t| UnitOutcome::new(t, UnitSource::Backend))
                    .map_err(TranslationError::from)
            })
            .await
    }
}

#[async_trait]
impl UnitTranslator for LocalCoordinator {
    async fn translate_unit(
        &self,
        unit: &TranslationUnit,
        prompt: &Prompt,
        cancel: &CancellationToken,
    ) -> Result<UnitOutcome, TranslationError> {
        self.translate_text(&unit.text, prompt, cancel).await
    }
}
