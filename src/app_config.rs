use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application configuration module
/// This module handles the configuration of the translation pipeline:
/// provider selection, cache, concurrency, resilience knobs, the remote
/// worker pool and version management. Configuration is stored as JSON.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    /// Active LLM provider
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Translation cache settings
    #[serde(default)]
    pub cache: CacheConfig,

    /// Coordinator settings (languages, concurrency)
    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    /// Circuit breaker thresholds
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Retry, fallback and degradation settings
    #[serde(default)]
    pub fallback: FallbackConfig,

    /// Remote worker connection pool
    #[serde(default)]
    pub pool: PoolConfig,

    /// Worker version management
    #[serde(default)]
    pub version: VersionConfig,

    /// Known remote workers
    #[serde(default)]
    pub workers: Vec<WorkerDescriptor>,

    /// Remote (worker, provider, model) triples used by the distributed coordinator
    #[serde(default)]
    pub remote_instances: Vec<RemoteInstanceConfig>,

    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,
}

/// LLM provider variants
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    OpenAI,
    Anthropic,
    Gemini,
    Ollama,
    Qwen,
    Zhipu,
    DeepSeek,
    #[serde(rename = "llama-cpp", alias = "llamacpp")]
    LlamaCpp,
    Dictionary,
}

impl ProviderKind {
    // @returns: Stable lowercase identifier, used in cache keys
    pub fn name(&self) -> &'static str {
        match self {
            Self::OpenAI => "openai",
            Self::Anthropic => "anthropic",
            Self::Gemini => "gemini",
            Self::Ollama => "ollama",
            Self::Qwen => "qwen",
            Self::Zhipu => "zhipu",
            Self::DeepSeek => "deepseek",
            Self::LlamaCpp => "llama-cpp",
            Self::Dictionary => "dictionary",
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            Self::OpenAI => "https://api.openai.com/v1",
            Self::Anthropic => "https://api.anthropic.com",
            Self::Gemini => "https://generativelanguage.googleapis.com/v1beta",
            Self::Ollama => "http://localhost:11434",
            Self::Qwen => "https://dashscope.aliyuncs.com/compatible-mode/v1",
            Self::Zhipu => "https://open.bigmodel.cn/api/paas/v4",
            Self::DeepSeek => "https://api.deepseek.com/v1",
            Self::LlamaCpp | Self::Dictionary => "",
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            Self::OpenAI => "gpt-4",
            Self::Anthropic => "claude-3-sonnet-20240229",
            Self::Gemini => "gemini-pro",
            Self::Ollama => "llama3",
            Self::Qwen => "qwen-plus",
            Self::Zhipu => "glm-4",
            Self::DeepSeek => "deepseek-chat",
            Self::LlamaCpp => "local",
            Self::Dictionary => "dictionary",
        }
    }

    /// Whether the provider needs an API key in configuration
    pub fn requires_api_key(&self) -> bool {
        matches!(
            self,
            Self::OpenAI | Self::Anthropic | Self::Gemini | Self::Zhipu | Self::DeepSeek
        )
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAI),
            "anthropic" => Ok(Self::Anthropic),
            "gemini" => Ok(Self::Gemini),
            "ollama" => Ok(Self::Ollama),
            "qwen" => Ok(Self::Qwen),
            "zhipu" => Ok(Self::Zhipu),
            "deepseek" => Ok(Self::DeepSeek),
            "llama-cpp" | "llamacpp" => Ok(Self::LlamaCpp),
            "dictionary" => Ok(Self::Dictionary),
            _ => Err(anyhow!("Invalid provider type: {}", s)),
        }
    }
}

/// Sampling and request options shared by every provider
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ProviderOptions {
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    // @field: Per-request timeout
    #[serde(default = "default_provider_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ProviderOptions {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_provider_timeout_secs(),
        }
    }
}

/// Provider configuration
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ProviderConfig {
    // @field: Provider variant
    #[serde(default, rename = "name", alias = "provider")]
    pub kind: ProviderKind,

    // @field: Service URL, empty for the provider default
    #[serde(default)]
    pub base_url: String,

    // @field: Model name, empty for the provider default
    #[serde(default)]
    pub model: String,

    // @field: API key
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default)]
    pub options: ProviderOptions,

    // @field: Qwen OAuth credentials file, defaults to $HOME/.translator/qwen_credentials.json
    #[serde(default)]
    pub oauth_credentials_path: Option<PathBuf>,

    // @field: Qwen OAuth token endpoint
    #[serde(default = "default_qwen_token_url")]
    pub oauth_token_url: String,

    // @field: llama.cpp executable
    #[serde(default = "default_llama_cpp_binary")]
    pub llama_cpp_binary: PathBuf,

    // @field: GGUF model file for llama.cpp
    #[serde(default)]
    pub llama_cpp_model_path: Option<PathBuf>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self::new(ProviderKind::default())
    }
}

impl ProviderConfig {
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            base_url: String::new(),
            model: String::new(),
            api_key: None,
            options: ProviderOptions::default(),
            oauth_credentials_path: None,
            oauth_token_url: default_qwen_token_url(),
            llama_cpp_binary: default_llama_cpp_binary(),
            llama_cpp_model_path: None,
        }
    }

    pub fn effective_base_url(&self) -> String {
        if self.base_url.is_empty() {
            self.kind.default_base_url().to_string()
        } else {
            self.base_url.trim_end_matches('/').to_string()
        }
    }

    pub fn effective_model(&self) -> String {
        if self.model.is_empty() {
            self.kind.default_model().to_string()
        } else {
            self.model.clone()
        }
    }

    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref().filter(|k| !k.is_empty())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.options.timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=2.0).contains(&self.options.temperature) {
            return Err(anyhow!(
                "temperature must be between 0 and 2, got {}",
                self.options.temperature
            ));
        }
        if self.options.max_tokens == 0 {
            return Err(anyhow!("max_tokens must be greater than 0"));
        }
        if self.kind.requires_api_key() && self.api_key().is_none() {
            return Err(anyhow!("API key is required for {} provider", self.kind));
        }
        if self.kind == ProviderKind::LlamaCpp && self.llama_cpp_model_path.is_none() {
            return Err(anyhow!("llama_cpp_model_path is required for llama-cpp provider"));
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,

    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: default_cache_ttl_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CoordinatorConfig {
    // @field: Max units in flight
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    // @field: Source language code, detected when absent
    #[serde(default)]
    pub source_language: Option<String>,

    #[serde(default = "default_target_language")]
    pub target_language: String,

    // @field: Characters sampled for language detection
    #[serde(default = "default_detection_sample_chars")]
    pub detection_sample_chars: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            source_language: None,
            target_language: default_target_language(),
            detection_sample_chars: default_detection_sample_chars(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,

    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_ms: default_recovery_timeout_ms(),
            success_threshold: default_success_threshold(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }
}

/// Retry, fallback and graceful degradation settings
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct FallbackConfig {
    #[serde(default = "default_true")]
    pub enable_graceful_degradation: bool,
    #[serde(default = "default_degradation_threshold")]
    pub degradation_threshold: f64,
    #[serde(default = "default_alert_threshold")]
    pub alert_threshold: f64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_base_ms")]
    pub retry_backoff_base_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_true")]
    pub enable_jitter: bool,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    #[serde(default = "default_health_check_timeout_ms")]
    pub health_check_timeout_ms: u64,

    #[serde(default = "default_recovery_check_interval_ms")]
    pub recovery_check_interval_ms: u64,
    #[serde(default = "default_recovery_success_threshold")]
    pub recovery_success_threshold: u32,
    #[serde(default = "default_recovery_window_ms")]
    pub recovery_window_ms: u64,
    #[serde(default = "default_failure_tracking_window_ms")]
    pub failure_tracking_window_ms: u64,

    #[serde(default = "default_true")]
    pub enable_local_fallback: bool,
    #[serde(default = "default_true")]
    pub enable_reduced_quality: bool,
    #[serde(default = "default_true")]
    pub enable_caching_fallback: bool,
    #[serde(default = "default_true")]
    pub enable_dictionary_fallback: bool,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enable_graceful_degradation: true,
            degradation_threshold: default_degradation_threshold(),
            alert_threshold: default_alert_threshold(),
            max_retries: default_max_retries(),
            retry_backoff_base_ms: default_retry_backoff_base_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            enable_jitter: true,
            request_timeout_ms: default_request_timeout_ms(),
            connection_timeout_ms: default_connection_timeout_ms(),
            health_check_timeout_ms: default_health_check_timeout_ms(),
            recovery_check_interval_ms: default_recovery_check_interval_ms(),
            recovery_success_threshold: default_recovery_success_threshold(),
            recovery_window_ms: default_recovery_window_ms(),
            failure_tracking_window_ms: default_failure_tracking_window_ms(),
            enable_local_fallback: true,
            enable_reduced_quality: true,
            enable_caching_fallback: true,
            enable_dictionary_fallback: true,
        }
    }
}

impl FallbackConfig {
    pub fn retry_backoff_base(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_base_ms)
    }
    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }
    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }
    pub fn recovery_check_interval(&self) -> Duration {
        Duration::from_millis(self.recovery_check_interval_ms.max(1))
    }
    pub fn recovery_window(&self) -> Duration {
        Duration::from_millis(self.recovery_window_ms)
    }
    pub fn failure_tracking_window(&self) -> Duration {
        Duration::from_millis(self.failure_tracking_window_ms)
    }
}

/// Remote worker connection pool
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PoolConfig {
    #[serde(default = "default_max_connections_per_worker")]
    pub max_connections_per_worker: usize,
    #[serde(default = "default_connection_idle_timeout_secs")]
    pub connection_idle_timeout_secs: u64,
    #[serde(default = "default_connection_max_lifetime_secs")]
    pub connection_max_lifetime_secs: u64,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,

    // @field: Verify worker host keys against known_hosts
    #[serde(default = "default_true")]
    pub host_key_verification: bool,
    // @field: known_hosts file, defaults to $HOME/.ssh/known_hosts
    #[serde(default)]
    pub known_hosts_path: Option<PathBuf>,

    #[serde(default = "default_connection_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections_per_worker: default_max_connections_per_worker(),
            connection_idle_timeout_secs: default_connection_idle_timeout_secs(),
            connection_max_lifetime_secs: default_connection_max_lifetime_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            host_key_verification: true,
            known_hosts_path: None,
            connect_timeout_ms: default_connection_timeout_ms(),
        }
    }
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_idle_timeout_secs)
    }
    pub fn max_lifetime(&self) -> Duration {
        Duration::from_secs(self.connection_max_lifetime_secs)
    }
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Worker version management
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct VersionConfig {
    // @field: Version this process compares workers against
    #[serde(default = "default_codebase_version")]
    pub codebase_version: String,

    // @field: Local component versions; `translator` defaults to the codebase version
    #[serde(default = "default_components")]
    pub components: BTreeMap<String, String>,

    #[serde(default = "default_version_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    // @field: Tree packaged for worker updates
    #[serde(default = "default_source_dir")]
    pub source_dir: PathBuf,
    #[serde(default = "default_update_dir")]
    pub update_dir: PathBuf,
    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,
    // @field: PKCS#1 PEM private key used to sign update packages
    #[serde(default)]
    pub signing_key_path: Option<PathBuf>,

    #[serde(default = "default_update_timeout_secs")]
    pub update_timeout_secs: u64,
    #[serde(default = "default_update_poll_interval_ms")]
    pub update_poll_interval_ms: u64,
    #[serde(default = "default_rollback_timeout_secs")]
    pub rollback_timeout_secs: u64,
    #[serde(default = "default_rollback_poll_interval_ms")]
    pub rollback_poll_interval_ms: u64,
    #[serde(default = "default_backup_retention_secs")]
    pub backup_retention_secs: u64,

    #[serde(default = "default_alert_history_limit")]
    pub alert_history_limit: usize,
    #[serde(default)]
    pub alert_webhook_url: Option<String>,

    #[serde(default = "default_batch_update_concurrency")]
    pub batch_update_concurrency: usize,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
}

impl Default for VersionConfig {
    fn default() -> Self {
        Self {
            codebase_version: default_codebase_version(),
            components: default_components(),
            cache_ttl_secs: default_version_cache_ttl_secs(),
            source_dir: default_source_dir(),
            update_dir: default_update_dir(),
            backup_dir: default_backup_dir(),
            signing_key_path: None,
            update_timeout_secs: default_update_timeout_secs(),
            update_poll_interval_ms: default_update_poll_interval_ms(),
            rollback_timeout_secs: default_rollback_timeout_secs(),
            rollback_poll_interval_ms: default_rollback_poll_interval_ms(),
            backup_retention_secs: default_backup_retention_secs(),
            alert_history_limit: default_alert_history_limit(),
            alert_webhook_url: None,
            batch_update_concurrency: default_batch_update_concurrency(),
            http_timeout_secs: default_http_timeout_secs(),
        }
    }
}

impl VersionConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
    pub fn update_timeout(&self) -> Duration {
        Duration::from_secs(self.update_timeout_secs)
    }
    pub fn update_poll_interval(&self) -> Duration {
        Duration::from_millis(self.update_poll_interval_ms.max(1))
    }
    pub fn rollback_timeout(&self) -> Duration {
        Duration::from_secs(self.rollback_timeout_secs)
    }
    pub fn rollback_poll_interval(&self) -> Duration {
        Duration::from_millis(self.rollback_poll_interval_ms.max(1))
    }
    pub fn backup_retention(&self) -> Duration {
        Duration::from_secs(self.backup_retention_secs)
    }
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    /// Local component versions with `translator` filled in
    pub fn local_components(&self) -> BTreeMap<String, String> {
        let mut components = self.components.clone();
        components
            .entry("translator".to_string())
            .or_insert_with(|| self.codebase_version.clone());
        components
    }
}

/// Authentication material for a worker; at least one must be set
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct WorkerAuth {
    // @field: PEM private key contents
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl WorkerAuth {
    pub fn is_empty(&self) -> bool {
        self.private_key.as_deref().is_none_or(str::is_empty)
            && self.password.as_deref().is_none_or(str::is_empty)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ServiceProtocol {
    Http,
    #[default]
    Https,
}

impl std::fmt::Display for ServiceProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Http => write!(f, "http"),
            Self::Https => write!(f, "https"),
        }
    }
}

/// A remote worker process
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct WorkerDescriptor {
    pub id: String,
    pub host: String,
    // @field: SSH port
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub auth: WorkerAuth,
    #[serde(default = "default_max_capacity")]
    pub max_capacity: usize,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,

    // @field: Port of the worker's HTTP API
    #[serde(default = "default_service_port")]
    pub service_port: u16,
    #[serde(default)]
    pub service_protocol: ServiceProtocol,
}

impl WorkerDescriptor {
    pub fn new(id: &str, host: &str, user: &str) -> Self {
        Self {
            id: id.to_string(),
            host: host.to_string(),
            port: default_ssh_port(),
            user: user.to_string(),
            auth: WorkerAuth::default(),
            max_capacity: default_max_capacity(),
            tags: Vec::new(),
            enabled: true,
            service_port: default_service_port(),
            service_protocol: ServiceProtocol::default(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RemoteInstanceConfig {
    pub worker_id: String,
    pub provider: String,
    pub model: String,
}

/// Log level
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn to_level_filter(self) -> log::LevelFilter {
        match self {
            Self::Error => log::LevelFilter::Error,
            Self::Warn => log::LevelFilter::Warn,
            Self::Info => log::LevelFilter::Info,
            Self::Debug => log::LevelFilter::Debug,
            Self::Trace => log::LevelFilter::Trace,
        }
    }
}

fn default_temperature() -> f32 {
    0.3
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_provider_timeout_secs() -> u64 {
    60
}

fn default_qwen_token_url() -> String {
    "https://chat.qwen.ai/api/v1/oauth2/token".to_string()
}

fn default_llama_cpp_binary() -> PathBuf {
    PathBuf::from("llama-cli")
}

fn default_true() -> bool {
    true
}

fn default_cache_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_cleanup_interval_secs() -> u64 {
    5 * 60
}

fn default_max_concurrent() -> usize {
    5
}

fn default_target_language() -> String {
    "en".to_string()
}

fn default_detection_sample_chars() -> usize {
    1000
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout_ms() -> u64 {
    60_000
}

fn default_success_threshold() -> u32 {
    3
}

fn default_degradation_threshold() -> f64 {
    0.5
}

fn default_alert_threshold() -> f64 {
    0.8
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_base_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_connection_timeout_ms() -> u64 {
    10_000
}

fn default_health_check_timeout_ms() -> u64 {
    5_000
}

fn default_recovery_check_interval_ms() -> u64 {
    10_000
}

fn default_recovery_success_threshold() -> u32 {
    3
}

fn default_recovery_window_ms() -> u64 {
    60_000
}

fn default_failure_tracking_window_ms() -> u64 {
    5 * 60 * 1000
}

fn default_max_connections_per_worker() -> usize {
    10
}

fn default_connection_idle_timeout_secs() -> u64 {
    5 * 60
}

fn default_connection_max_lifetime_secs() -> u64 {
    30 * 60
}

fn default_codebase_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_components() -> BTreeMap<String, String> {
    ["api", "distributed", "deployment"]
        .into_iter()
        .map(|name| (name.to_string(), "1.0.0".to_string()))
        .collect()
}

fn default_version_cache_ttl_secs() -> u64 {
    5 * 60
}

fn default_source_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_update_dir() -> PathBuf {
    PathBuf::from("updates")
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from("backups")
}

fn default_update_timeout_secs() -> u64 {
    5 * 60
}

fn default_update_poll_interval_ms() -> u64 {
    10_000
}

fn default_rollback_timeout_secs() -> u64 {
    2 * 60
}

fn default_rollback_poll_interval_ms() -> u64 {
    5_000
}

fn default_backup_retention_secs() -> u64 {
    24 * 60 * 60
}

fn default_alert_history_limit() -> usize {
    1000
}

fn default_batch_update_concurrency() -> usize {
    3
}

fn default_http_timeout_secs() -> u64 {
    30
}

fn default_ssh_port() -> u16 {
    22
}

fn default_service_port() -> u16 {
    8443
}

fn default_max_capacity() -> usize {
    1
}

impl Config {
    /// Load configuration from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Save configuration as pretty-printed JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), json)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;
        Ok(())
    }

    /// Validate the configuration for consistency and required values
    pub fn validate(&self) -> Result<()> {
        self.provider.validate()?;

        if let Some(source) = &self.coordinator.source_language {
            crate::language_utils::get_language_name(source)?;
        }
        crate::language_utils::get_language_name(&self.coordinator.target_language)?;

        if self.coordinator.max_concurrent == 0 {
            return Err(anyhow!("max_concurrent must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.fallback.degradation_threshold)
            || !(0.0..=1.0).contains(&self.fallback.alert_threshold)
        {
            return Err(anyhow!("fallback thresholds must be between 0 and 1"));
        }
        if self.pool.max_connections_per_worker == 0 {
            return Err(anyhow!("max_connections_per_worker must be at least 1"));
        }

        let mut seen = HashSet::new();
        for worker in &self.workers {
            if !seen.insert(worker.id.as_str()) {
                return Err(anyhow!("Duplicate worker id: {}", worker.id));
            }
            if worker.max_capacity == 0 {
                return Err(anyhow!("Worker {} must have max_capacity >= 1", worker.id));
            }
            if worker.auth.is_empty() {
                return Err(anyhow!(
                    "Worker {} needs a private key or a password",
                    worker.id
                ));
            }
        }
        for instance in &self.remote_instances {
            if !seen.contains(instance.worker_id.as_str()) {
                return Err(anyhow!(
                    "Remote instance refers to unknown worker: {}",
                    instance.worker_id
                ));
            }
        }

        Ok(())
    }
}
