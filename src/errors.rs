/*!
 * Error types for the ebook translator.
 *
 * Backend failures are described by `ProviderError`, everything the pipeline
 * core can surface by `TranslationError`. Both are `Clone` so retry loops can
 * keep the last error around and events can carry a copy of it.
 */

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur when talking to an LLM backend
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    /// Credentials missing or rejected
    #[error("Authentication error: {0}")]
    AuthenticationError(String),

    /// HTTP 429 or a provider-specific equivalent
    #[error("Rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    /// Input exceeds the model context or the output was truncated
    #[error("Text size error: {0}")]
    TextSizeError(String),

    /// Connect, read, write or timeout failure
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Response did not have the expected shape
    #[error("Failed to parse API response: {0}")]
    ParseError(String),

    /// Any other non-2xx response
    #[error("API responded with error: {status_code} - {message}")]
    ApiError {
        /// HTTP status code
        status_code: u16,
        /// Response body
        message: String,
    },

    /// The backend is misconfigured (missing binary, missing OAuth client, ...)
    #[error("Provider configuration error: {0}")]
    ConfigError(String),

    /// The caller cancelled the request
    #[error("Request cancelled")]
    Cancelled,
}

/// Errors surfaced by the translation pipeline core
#[derive(Error, Debug, Clone)]
pub enum TranslationError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("circuit breaker is open")]
    CircuitOpen,

    #[error("no remote instances available")]
    NoRemoteInstances,

    #[error("service not found: {0}")]
    ServiceNotFound(String),

    /// The remote worker answered the translate call with a non-2xx status
    #[error("remote translation failed with status {status}: {body}")]
    TranslationFailed { status: u16, body: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Transport failure on the worker channel (SSH dial, worker HTTP)
    #[error("worker connection error: {0}")]
    Connection(String),

    #[error("update failed: {0}")]
    UpdateFailed(String),

    #[error("rollback failed: {0}")]
    RollbackFailed(String),

    #[error("worker {worker_id} version mismatch: local {local}, remote {remote}")]
    VersionMismatch {
        worker_id: String,
        local: String,
        remote: String,
    },

    #[error("no authentication method configured for worker {0}")]
    NoAuth(String),

    #[error("signature error: {0}")]
    Signature(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("operation cancelled")]
    Cancelled,

    /// The primary call and every eligible fallback failed; carries the primary error
    #[error("all fallbacks failed for {component}: {source}")]
    AllFallbacksFailed {
        component: String,
        source: Box<TranslationError>,
    },

    #[error("I/O error: {0}")]
    Io(String),
}

/// Error kind carried in event payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Config,
    Auth,
    Transport,
    RateLimited,
    Provider,
    MalformedResponse,
    TextSize,
    Cache,
    CircuitOpen,
    NoRemoteInstances,
    ServiceNotFound,
    TranslationFailed,
    InvalidResponse,
    UpdateFailed,
    RollbackFailed,
    VersionMismatch,
    NoAuth,
    Signature,
    Timeout,
    Cancelled,
    Io,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::Auth => "auth",
            Self::Transport => "transport",
            Self::RateLimited => "rate_limited",
            Self::Provider => "provider",
            Self::MalformedResponse => "malformed_response",
            Self::TextSize => "text_size",
            Self::Cache => "cache",
            Self::CircuitOpen => "circuit_open",
            Self::NoRemoteInstances => "no_remote_instances",
            Self::ServiceNotFound => "service_not_found",
            Self::TranslationFailed => "translation_failed",
            Self::InvalidResponse => "invalid_response",
            Self::UpdateFailed => "update_failed",
            Self::RollbackFailed => "rollback_failed",
            Self::VersionMismatch => "version_mismatch",
            Self::NoAuth => "no_auth",
            Self::Signature => "signature",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Io => "io",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ProviderError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AuthenticationError(_) => ErrorKind::Auth,
            Self::RateLimitExceeded(_) => ErrorKind::RateLimited,
            Self::TextSizeError(_) => ErrorKind::TextSize,
            Self::ConnectionError(_) => ErrorKind::Transport,
            Self::ParseError(_) => ErrorKind::MalformedResponse,
            Self::ApiError { .. } => ErrorKind::Provider,
            Self::ConfigError(_) => ErrorKind::Config,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether another attempt may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ConnectionError(_) | Self::RateLimitExceeded(_) | Self::TextSizeError(_) => true,
            Self::ApiError { status_code, .. } => *status_code >= 500,
            _ => false,
        }
    }
}

impl TranslationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Config,
            Self::Provider(e) => e.kind(),
            Self::Cache(_) => ErrorKind::Cache,
            Self::CircuitOpen => ErrorKind::CircuitOpen,
            Self::NoRemoteInstances => ErrorKind::NoRemoteInstances,
            Self::ServiceNotFound(_) => ErrorKind::ServiceNotFound,
            Self::TranslationFailed { .. } => ErrorKind::TranslationFailed,
            Self::InvalidResponse(_) => ErrorKind::InvalidResponse,
            Self::Connection(_) => ErrorKind::Transport,
            Self::UpdateFailed(_) => ErrorKind::UpdateFailed,
            Self::RollbackFailed(_) => ErrorKind::RollbackFailed,
            Self::VersionMismatch { .. } => ErrorKind::VersionMismatch,
            Self::NoAuth(_) => ErrorKind::NoAuth,
            Self::Signature(_) => ErrorKind::Signature,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::AllFallbacksFailed { source, .. } => source.kind(),
            Self::Io(_) => ErrorKind::Io,
        }
    }

    /// Whether the retry loop should make another attempt.
    ///
    /// `CircuitOpen` is not retried; the fallback chain handles it.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Provider(e) => e.is_retryable(),
            Self::Connection(_) | Self::Timeout(_) => true,
            Self::TranslationFailed { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Provider(ProviderError::Cancelled))
    }
}

impl From<std::io::Error> for TranslationError {
    fn from(error: std::io::Error) -> Self {
        Self::Io(error.to_string())
    }
}

/// Main application error type used by the binary
#[derive(Error, Debug)]
pub enum AppError {
    /// Error from a file operation
    #[error("File error: {0}")]
    File(String),

    /// Error from translation
    #[error("Translation error: {0}")]
    Translation(#[from] TranslationError),

    /// Any other error
    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl From<anyhow::Error> for AppError {
    fn from(error: anyhow::Error) -> Self {
        Self::Unknown(error.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(error: std::io::Error) -> Self {
        Self::File(error.to_string())
    }
}
