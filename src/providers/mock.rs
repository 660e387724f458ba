/*!
 * Mock provider implementations for testing.
 *
 * This module provides a scripted backend that simulates different behaviors:
 * - `MockProvider::working()` - Always succeeds with a tagged translation
 * - `MockProvider::failing()` - Always fails with a retryable error
 * - `MockProvider::fail_first(n)` - Fails the first `n` calls, then succeeds
 * - `MockProvider::slow(ms)` - Succeeds after a delay, honouring cancellation
 */

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::{Backend, Prompt};
use crate::errors::ProviderError;

/// Behavior mode for the mock provider
#[derive(Debug, Clone, PartialEq)]
pub enum MockBehavior {
    /// Always succeeds with `[target] text`
    Working,
    /// Always returns the same text
    Fixed(String),
    /// Always fails with a connection error
    Failing,
    /// Always fails with the given error
    FailWith(ProviderError),
    /// Fails the first `n` requests with a connection error
    FailFirst { n: usize },
    /// Fails every Nth request
    Intermittent { fail_every: usize },
    /// Simulates slow response (for timeout testing)
    Slow { delay_ms: u64 },
    /// Panics inside `translate`
    Panicking,
}

/// A request the mock has seen
#[derive(Debug, Clone, PartialEq)]
pub struct MockRequest {
    pub text: String,
    pub source_language: Option<String>,
    pub target_language: String,
    pub context_hint: String,
}

/// Mock provider for testing translation behavior
#[derive(Debug, Clone)]
pub struct MockProvider {
    name: String,
    model: String,
    behavior: MockBehavior,
    /// Request counter shared between clones
    request_count: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<MockRequest>>>,
}

impl MockProvider {
    /// Create a new mock provider with the specified behavior
    pub fn new(behavior: MockBehavior) -> Self {
        Self {
            name: "mock".to_string(),
            model: "mock-model".to_string(),
            behavior,
            request_count: Arc::new(AtomicUsize::new(0)),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn working() -> Self {
        Self::new(MockBehavior::Working)
    }

    pub fn fixed(response: &str) -> Self {
        Self::new(MockBehavior::Fixed(response.to_string()))
    }

    pub fn failing() -> Self {
        Self::new(MockBehavior::Failing)
    }

    pub fn fail_first(n: usize) -> Self {
        Self::new(MockBehavior::FailFirst { n })
    }

    pub fn slow(delay_ms: u64) -> Self {
        Self::new(MockBehavior::Slow { delay_ms })
    }

    pub fn panicking() -> Self {
        Self::new(MockBehavior::Panicking)
    }

    /// Report a different provider name, e.g. to match a preseeded cache key
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }

    /// Number of `translate` calls so far
    pub fn calls(&self) -> usize {
        self.request_count.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<MockRequest> {
        self.requests.lock().clone()
    }

    fn transient() -> ProviderError {
        ProviderError::ConnectionError("mock transport failure".to_string())
    }

    fn translated(text: &str, prompt: &Prompt) -> String {
        format!("[{}] {}", prompt.target_language, text)
    }
}

#[async_trait]
impl Backend for MockProvider {
    async fn translate(
        &self,
        text: &str,
        prompt: &Prompt,
        cancel: &CancellationToken,
    ) -> Result<String, ProviderError> {
        let call = self.request_count.fetch_add(1, Ordering::SeqCst) + 1;
        self.requests.lock().push(MockRequest {
            text: text.to_string(),
            source_language: prompt.source_language.clone(),
            target_language: prompt.target_language.clone(),
            context_hint: prompt.context_hint.clone(),
        });
        if cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }

        match &self.behavior {
            MockBehavior::Working => Ok(Self::translated(text, prompt)),
            MockBehavior::Fixed(response) => Ok(response.clone()),
            MockBehavior::Failing => Err(Self::transient()),
            MockBehavior::FailWith(error) => Err(error.clone()),
            MockBehavior::FailFirst { n } => {
                if call <= *n {
                    Err(Self::transient())
                } else {
                    Ok(Self::translated(text, prompt))
                }
            }
            MockBehavior::Intermittent { fail_every } => {
                if *fail_every > 0 && call % fail_every == 0 {
                    Err(Self::transient())
                } else {
                    Ok(Self::translated(text, prompt))
                }
            }
            MockBehavior::Slow { delay_ms } => {
                tokio::select! {
                    _ = cancel.cancelled() => Err(ProviderError::Cancelled),
                    _ = tokio::time::sleep(Duration::from_millis(*delay_ms)) => Ok(Self::translated(text, prompt)),
                }
            }
            MockBehavior::Panicking => panic!("mock provider panicked on {:?}", text),
        }
    }

    fn provider_name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        &self.model
    }
}
