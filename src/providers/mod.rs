/*!
 * Provider implementations for different translation services.
 *
 * Every LLM variant implements the `Backend` capability: translate a piece
 * of text under a `Prompt` and report a stable provider name for cache keys.
 * `ProviderBackend` is the tagged sum the coordinator holds; adding a
 * provider means adding one variant and one module.
 *
 * - `openai`: OpenAI-compatible chat completions (openai, zhipu, deepseek)
 * - `anthropic`: Anthropic messages API
 * - `gemini`: Google Gemini generateContent
 * - `ollama`: Ollama native generate API
 * - `qwen`: DashScope with refreshable OAuth credentials
 * - `llamacpp`: local llama.cpp subprocess
 * - `dictionary`: in-process word substitution
 * - `mock`: scripted backend for tests and demos
 */

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use tokio_util::sync::CancellationToken;

use crate::app_config::{ProviderConfig, ProviderKind};
use crate::errors::ProviderError;
use crate::language_utils::prompt_language_name;

pub mod anthropic;
pub mod dictionary;
pub mod gemini;
pub mod llamacpp;
pub mod mock;
pub mod ollama;
pub mod openai;
pub mod qwen;

use anthropic::Anthropic;
use dictionary::Dictionary;
use gemini::Gemini;
use llamacpp::LlamaCpp;
use ollama::Ollama;
use openai::OpenAICompatible;
use qwen::Qwen;

/// What the model is asked to do for one unit
#[derive(Debug, Clone, PartialEq)]
pub struct Prompt {
    /// `None` asks the model to detect the source language itself
    pub source_language: Option<String>,
    pub target_language: String,
    /// Role of the text, e.g. "Chapter title"
    pub context_hint: String,
    /// Replaces the translation instruction, for auxiliary tasks
    pub instruction: Option<String>,
}

impl Prompt {
    pub fn new(source_language: Option<&str>, target_language: &str, context_hint: &str) -> Self {
        Self {
            source_language: source_language.map(str::to_string),
            target_language: target_language.to_string(),
            context_hint: context_hint.to_string(),
            instruction: None,
        }
    }

    /// Ask for the ISO 639-1 code of the text instead of a translation
    pub fn detect_language() -> Self {
        Self {
            source_language: None,
            target_language: String::new(),
            context_hint: String::new(),
            instruction: Some(
                "Identify the language of the user's text. \
                 Reply with its ISO 639-1 code only, for example \"en\" or \"ru\"."
                    .to_string(),
            ),
        }
    }

    pub fn system_message(&self) -> String {
        if let Some(instruction) = &self.instruction {
            return instruction.clone();
        }
        let target = prompt_language_name(&self.target_language);
        let direction = match &self.source_language {
            Some(source) => format!("from {} to {}", prompt_language_name(source), target),
            None => format!("into {}, detecting the source language automatically", target),
        };
        format!(
            "You are a professional literary translator. Translate the user's text {}. \
             Preserve meaning, tone, paragraph breaks and inline markup. \
             Reply with the translated text only, without notes or explanations.",
            direction
        )
    }

    pub fn user_message(&self, text: &str) -> String {
        if self.context_hint.is_empty() {
            text.to_string()
        } else {
            format!("[{}]\n{}", self.context_hint, text)
        }
    }

    /// System and user parts in one string, for completion-style APIs
    pub fn combined(&self, text: &str) -> String {
        format!("{}\n\n{}", self.system_message(), self.user_message(text))
    }
}

/// Uniform translation capability over every provider
#[async_trait]
pub trait Backend: Send + Sync {
    /// Translate `text`. Implementations must stop promptly when `cancel` fires.
    async fn translate(
        &self,
        text: &str,
        prompt: &Prompt,
        cancel: &CancellationToken,
    ) -> Result<String, ProviderError>;

    /// Stable identifier used in cache keys
    fn provider_name(&self) -> &str;

    fn model(&self) -> &str;
}

/// Tagged sum over the supported providers
#[derive(Debug)]
pub enum ProviderBackend {
    OpenAI(OpenAICompatible),
    Anthropic(Anthropic),
    Gemini(Gemini),
    Ollama(Ollama),
    Qwen(Qwen),
    LlamaCpp(LlamaCpp),
    Dictionary(Dictionary),
}

impl ProviderBackend {
    pub fn from_config(config: &ProviderConfig) -> Result<Self, ProviderError> {
        config
            .validate()
            .map_err(|e| ProviderError::ConfigError(e.to_string()))?;
        Ok(match config.kind {
            ProviderKind::OpenAI | ProviderKind::Zhipu | ProviderKind::DeepSeek => {
                Self::OpenAI(OpenAICompatible::from_config(config)?)
            }
            ProviderKind::Anthropic => Self::Anthropic(Anthropic::from_config(config)?),
            ProviderKind::Gemini => Self::Gemini(Gemini::from_config(config)?),
            ProviderKind::Ollama => Self::Ollama(Ollama::from_config(config)?),
            ProviderKind::Qwen => Self::Qwen(Qwen::from_config(config)?),
            ProviderKind::LlamaCpp => Self::LlamaCpp(LlamaCpp::from_config(config)?),
            ProviderKind::Dictionary => Self::Dictionary(Dictionary::new()),
        })
    }

    fn inner(&self) -> &dyn Backend {
        match self {
            Self::OpenAI(b) => b,
            Self::Anthropic(b) => b,
            Self::Gemini(b) => b,
            Self::Ollama(b) => b,
            Self::Qwen(b) => b,
            Self::LlamaCpp(b) => b,
            Self::Dictionary(b) => b,
        }
    }
}

#[async_trait]
impl Backend for ProviderBackend {
    async fn translate(
        &self,
        text: &str,
        prompt: &Prompt,
        cancel: &CancellationToken,
    ) -> Result<String, ProviderError> {
        self.inner().translate(text, prompt, cancel).await
    }

    fn provider_name(&self) -> &str {
        self.inner().provider_name()
    }

    fn model(&self) -> &str {
        self.inner().model()
    }
}

/// Build the shared reqwest client for a provider
pub(crate) fn build_client(timeout: Duration) -> Result<Client, ProviderError> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| ProviderError::ConfigError(format!("failed to build HTTP client: {}", e)))
}

/// Race a request against cancellation
pub(crate) async fn with_cancel<T, F>(cancel: &CancellationToken, request: F) -> Result<T, ProviderError>
where
    F: Future<Output = Result<T, ProviderError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ProviderError::Cancelled),
        result = request => result,
    }
}

/// Map a transport-level reqwest failure
pub(crate) fn transport_error(error: reqwest::Error) -> ProviderError {
    if error.is_decode() {
        ProviderError::ParseError(error.to_string())
    } else {
        ProviderError::ConnectionError(error.to_string())
    }
}

static CONTEXT_OVERFLOW: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"(?i)(context[ _]length|maximum context|too many tokens|too long|max_tokens)").ok()
});

/// Classify a non-2xx response
pub(crate) fn classify_status(status: u16, body: String) -> ProviderError {
    match status {
        401 | 403 => ProviderError::AuthenticationError(body),
        429 => ProviderError::RateLimitExceeded(body),
        413 => ProviderError::TextSizeError(body),
        400 if CONTEXT_OVERFLOW.as_ref().is_some_and(|re| re.is_match(&body)) => {
            ProviderError::TextSizeError(body)
        }
        _ => ProviderError::ApiError {
            status_code: status,
            message: body,
        },
    }
}

/// Read a response, turning non-2xx into a classified error
pub(crate) async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Failed to get error response text".to_string());
    log::error!("Provider API error ({}): {}", status, body);
    Err(classify_status(status.as_u16(), body))
}

static PREAMBLE: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(here is the translation|here's the translation|translated text|translation)\b[^:\n]{0,40}:\s*").ok()
});

/// Trim echoed preambles such as "Translation:" from a model reply
pub fn clean_translation(raw: &str) -> String {
    let trimmed = raw.trim();
    match PREAMBLE.as_ref() {
        Some(re) => re.replace(trimmed, "").trim().to_string(),
        None => trimmed.to_string(),
    }
}
