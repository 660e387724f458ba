use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::{Backend, Prompt, build_client, check_response, clean_translation, transport_error, with_cancel};
use crate::app_config::ProviderConfig;
use crate::errors::ProviderError;

/// Ollama client for interacting with Ollama's native API
#[derive(Debug)]
pub struct Ollama {
    /// Base URL of the Ollama API
    base_url: String,
    /// HTTP client for making requests
    client: Client,
    model: String,
}

/// Generate request for the Ollama API
#[derive(Debug, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Model name to use for generation
    model: String,
    /// Prompt to generate from
    prompt: String,
    /// Whether to stream the response
    stream: bool,
}

impl GenerationRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            stream: false,
        }
    }
}

/// Generate response from the Ollama API
#[derive(Debug, Deserialize)]
pub struct GenerationResponse {
    /// Generated text
    pub response: Option<String>,
    /// Whether generation finished
    #[serde(default)]
    pub done: bool,
}

impl Ollama {
    pub fn from_config(config: &ProviderConfig) -> Result<Self, ProviderError> {
        Ok(Self {
            base_url: config.effective_base_url(),
            client: build_client(config.timeout())?,
            model: config.effective_model(),
        })
    }

    /// Generate a completion (non-streaming)
    pub async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse, ProviderError> {
        let url = format!("{}/api/generate", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_response(response).await?;
        response
            .json::<GenerationResponse>()
            .await
            .map_err(|e| ProviderError::ParseError(format!("Failed to parse Ollama response: {}", e)))
    }
}

#[async_trait]
impl Backend for Ollama {
    async fn translate(
        &self,
        text: &str,
        prompt: &Prompt,
        cancel: &CancellationToken,
    ) -> Result<String, ProviderError> {
        let request = GenerationRequest::new(&self.model, prompt.combined(text));
        let response = with_cancel(cancel, self.generate(&request)).await?;
        if !response.done {
            return Err(ProviderError::TextSizeError("generation did not finish".to_string()));
        }
        let text = response
            .response
            .ok_or_else(|| ProviderError::ParseError("missing response field".to_string()))?;
        Ok(clean_translation(&text))
    }

    fn provider_name(&self) -> &str {
        "ollama"
    }

    fn model(&self) -> &str {
        &self.model
    }
}
