/*!
 * Source language detection.
 *
 * Used once per job when no source language is configured. Detection never
 * fails a job: every problem is logged and reported as `None`, which makes
 * the prompt ask the model to detect the language itself.
 */

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};
use tokio_util::sync::CancellationToken;

use crate::language_utils::parse_detected_language;
use crate::providers::{Backend, Prompt};

#[async_trait]
pub trait LanguageDetector: Send + Sync {
    /// ISO 639-1 (or 639-3) code of `sample`, if it can be determined
    async fn detect(&self, sample: &str, cancel: &CancellationToken) -> Option<String>;
}

/// Asks an LLM backend for the language code of a sample
pub struct LlmLanguageDetector {
    backend: Arc<dyn Backend>,
}

impl LlmLanguageDetector {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl LanguageDetector for LlmLanguageDetector {
    async fn detect(&self, sample: &str, cancel: &CancellationToken) -> Option<String> {
        if sample.trim().is_empty() {
            return None;
        }
        match self.backend.translate(sample, &Prompt::detect_language(), cancel).await {
            Ok(reply) => {
                let code = parse_detected_language(&reply);
                if code.is_none() {
                    warn!("Could not read a language code from detector reply: {:?}", reply);
                }
                code
            }
            Err(e) => {
                warn!("Language detection failed: {}", e);
                None
            }
        }
    }
}

/// Detector with a fixed answer
pub struct StaticLanguageDetector(pub Option<String>);

#[async_trait]
impl LanguageDetector for StaticLanguageDetector {
    async fn detect(&self, _sample: &str, _cancel: &CancellationToken) -> Option<String> {
        debug!("Static language detector returning {:?}", self.0);
        self.0.clone()
    }
}
