/*!
 * Qwen (DashScope) client.
 *
 * Speaks the OpenAI-compatible chat format. Authentication is either a plain
 * API key or an OAuth token persisted on disk; the token is refreshed when it
 * is within five minutes of expiry, or once after a 401, and the refreshed
 * token is written back atomically before the request is retried.
 */

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::openai::{ChatCompletionRequest, send_chat};
use super::{Backend, Prompt, build_client, check_response, transport_error, with_cancel};
use crate::app_config::{ProviderConfig, ProviderKind};
use crate::errors::ProviderError;

pub const CLIENT_ID_ENV: &str = "QWEN_CLIENT_ID";
pub const CLIENT_SECRET_ENV: &str = "QWEN_CLIENT_SECRET";

/// Refresh this long before the recorded expiry
const EXPIRY_MARGIN_MS: i64 = 5 * 60 * 1000;

/// OAuth credentials as stored on disk
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QwenCredentials {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub resource_url: Option<String>,
    /// Milliseconds since the Unix epoch
    pub expiry_date: i64,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl QwenCredentials {
    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        now_ms + EXPIRY_MARGIN_MS >= self.expiry_date
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(chrono::Utc::now().timestamp_millis())
    }

    /// API base derived from `resource_url`, e.g. `portal.qwen.ai` -> `https://portal.qwen.ai/v1`
    pub fn api_base(&self) -> Option<String> {
        let resource = self.resource_url.as_deref()?.trim().trim_end_matches('/');
        if resource.is_empty() {
            return None;
        }
        let with_scheme = if resource.starts_with("http://") || resource.starts_with("https://") {
            resource.to_string()
        } else {
            format!("https://{}", resource)
        };
        if with_scheme.ends_with("/v1") {
            Some(with_scheme)
        } else {
            Some(format!("{}/v1", with_scheme))
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    resource_url: Option<String>,
}

/// `$HOME/.translator/qwen_credentials.json`
pub fn default_credentials_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".translator").join("qwen_credentials.json"))
}

pub fn load_credentials(path: &Path) -> Result<QwenCredentials, ProviderError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ProviderError::ConfigError(format!("cannot read {}: {}", path.display(), e)))?;
    serde_json::from_str(&content)
        .map_err(|e| ProviderError::ConfigError(format!("invalid credentials in {}: {}", path.display(), e)))
}

/// Write credentials via a temp file in the same directory, then rename, mode 0600
pub fn save_credentials(path: &Path, credentials: &QwenCredentials) -> Result<(), ProviderError> {
    let persist_error = |e: &dyn std::fmt::Display| {
        ProviderError::ConfigError(format!("failed to persist Qwen credentials to {}: {}", path.display(), e))
    };
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).map_err(|e| persist_error(&e))?;

    let json = serde_json::to_vec_pretty(credentials).map_err(|e| persist_error(&e))?;
    let mut file = tempfile::NamedTempFile::new_in(dir).map_err(|e| persist_error(&e))?;
    file.write_all(&json).map_err(|e| persist_error(&e))?;
    file.flush().map_err(|e| persist_error(&e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o600))
            .map_err(|e| persist_error(&e))?;
    }

    file.persist(path).map_err(|e| persist_error(&e.error))?;
    Ok(())
}

#[derive(Debug)]
pub struct Qwen {
    client: Client,
    model: String,
    temperature: f32,
    max_tokens: u32,
    api_key: Option<String>,
    default_base_url: String,
    credentials_path: Option<PathBuf>,
    token_url: String,
    client_credentials: Option<(String, String)>,
    /// In-memory copy of the on-disk token; the file wins after a refresh
    token: Mutex<Option<QwenCredentials>>,
}

impl Qwen {
    pub fn from_config(config: &ProviderConfig) -> Result<Self, ProviderError> {
        let credentials_path = config.oauth_credentials_path.clone().or_else(default_credentials_path);
        let token = match &credentials_path {
            Some(path) if path.exists() => match load_credentials(path) {
                Ok(credentials) => Some(credentials),
                Err(e) => {
                    log::warn!("Ignoring Qwen OAuth credentials: {}", e);
                    None
                }
            },
            _ => None,
        };
        let client_credentials = match (std::env::var(CLIENT_ID_ENV), std::env::var(CLIENT_SECRET_ENV)) {
            (Ok(id), Ok(secret)) if !id.is_empty() && !secret.is_empty() => Some((id, secret)),
            _ => None,
        };
        let default_base_url = if config.base_url.is_empty() {
            ProviderKind::Qwen.default_base_url().to_string()
        } else {
            config.effective_base_url()
        };

        Ok(Self {
            client: build_client(config.timeout())?,
            model: config.effective_model(),
            temperature: config.options.temperature,
            max_tokens: config.options.max_tokens,
            api_key: config.api_key().map(str::to_string),
            default_base_url,
            credentials_path,
            token_url: config.oauth_token_url.clone(),
            client_credentials,
            token: Mutex::new(token),
        })
    }

    /// Override the client id and secret normally read from the environment
    pub fn with_client_credentials(mut self, client_id: &str, client_secret: &str) -> Self {
        self.client_credentials = Some((client_id.to_string(), client_secret.to_string()));
        self
    }

    pub async fn current_credentials(&self) -> Option<QwenCredentials> {
        self.token.lock().await.clone()
    }

    /// Bearer token and API base for the next request, refreshing if close to expiry
    async fn access(&self, force_refresh: bool) -> Result<(String, String), ProviderError> {
        let mut guard = self.token.lock().await;
        match guard.as_ref() {
            Some(current) => {
                if force_refresh || current.is_expired() {
                    let refreshed = self.refresh(current).await?;
                    *guard = Some(refreshed);
                }
                let credentials = guard
                    .as_ref()
                    .ok_or_else(|| ProviderError::AuthenticationError("Qwen token unavailable".to_string()))?;
                let base = credentials
                    .api_base()
                    .unwrap_or_else(|| self.default_base_url.clone());
                Ok((credentials.access_token.clone(), base))
            }
            None => match &self.api_key {
                Some(key) => Ok((key.clone(), self.default_base_url.clone())),
                None => Err(ProviderError::AuthenticationError(
                    "Qwen needs an API key or OAuth credentials".to_string(),
                )),
            },
        }
    }

    async fn refresh(&self, current: &QwenCredentials) -> Result<QwenCredentials, ProviderError> {
        let (client_id, client_secret) = self.client_credentials.as_ref().ok_or_else(|| {
            ProviderError::ConfigError(format!(
                "{} and {} must be set to refresh the Qwen OAuth token",
                CLIENT_ID_ENV, CLIENT_SECRET_ENV
            ))
        })?;
        log::info!("Refreshing Qwen OAuth token");

        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", current.refresh_token.as_str()),
            ("client_id", client_id.as_str()),
            ("client_secret", client_secret.as_str()),
        ];
        let response = self
            .client
            .post(&self.token_url)
            .form(&params)
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_response(response).await?;
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::ParseError(format!("invalid token response: {}", e)))?;

        let now_ms = chrono::Utc::now().timestamp_millis();
        let refreshed = QwenCredentials {
            access_token: token.access_token,
            refresh_token: token.refresh_token.unwrap_or_else(|| current.refresh_token.clone()),
            token_type: token.token_type.unwrap_or_else(|| current.token_type.clone()),
            resource_url: token.resource_url.or_else(|| current.resource_url.clone()),
            expiry_date: now_ms + token.expires_in.unwrap_or(3600) * 1000,
        };

        if let Some(path) = &self.credentials_path {
            save_credentials(path, &refreshed)?;
        }
        Ok(refreshed)
    }

    async fn send(&self, request: &ChatCompletionRequest) -> Result<String, ProviderError> {
        let (bearer, base) = self.access(false).await?;
        match send_chat(&self.client, &base, &bearer, request).await {
            Err(ProviderError::AuthenticationError(body)) => {
                if self.token.lock().await.is_none() {
                    return Err(ProviderError::AuthenticationError(body));
                }
                log::warn!("Qwen rejected the access token, refreshing: {}", body);
                let (bearer, base) = self.access(true).await?;
                send_chat(&self.client, &base, &bearer, request).await
            }
            other => other,
        }
    }
}

#[async_trait]
impl Backend for Qwen {
    async fn translate(
        &self,
        text: &str,
        prompt: &Prompt,
        cancel: &CancellationToken,
    ) -> Result<String, ProviderError> {
        let request = ChatCompletionRequest::for_prompt(&self.model, prompt, text, self.temperature, self.max_tokens);
        with_cancel(cancel, self.send(&request)).await
    }

    fn provider_name(&self) -> &str {
        "qwen"
    }

    fn model(&self) -> &str {
        &self.model
    }
}
