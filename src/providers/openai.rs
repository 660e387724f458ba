/*!
 * OpenAI-compatible chat completions client.
 *
 * Serves `openai`, `zhipu` and `deepseek`, which share the wire format and
 * differ only in base URL, default model and provider name. The request and
 * response types are reused by the Qwen client.
 */

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::{Backend, Prompt, build_client, check_response, clean_translation, transport_error, with_cancel};
use crate::app_config::ProviderConfig;
use crate::errors::ProviderError;

/// A chat message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Chat completion request
#[derive(Debug, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl ChatCompletionRequest {
    pub fn for_prompt(model: &str, prompt: &Prompt, text: &str, temperature: f32, max_tokens: u32) -> Self {
        Self {
            model: model.to_string(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: prompt.system_message(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: prompt.user_message(text),
                },
            ],
            temperature,
            max_tokens,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ChatCompletionResponse {
    #[serde(default)]
    pub choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
pub struct ChatChoice {
    pub message: Option<ChatChoiceMessage>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChatChoiceMessage {
    pub content: Option<String>,
}

impl ChatCompletionResponse {
    /// The translation from the first choice
    pub fn into_text(self) -> Result<String, ProviderError> {
        let choice = self
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::ParseError("response has no choices".to_string()))?;
        if choice.finish_reason.as_deref() == Some("length") {
            return Err(ProviderError::TextSizeError(
                "output truncated at max_tokens".to_string(),
            ));
        }
        let content = choice
            .message
            .and_then(|m| m.content)
            .ok_or_else(|| ProviderError::ParseError("choice has no message content".to_string()))?;
        Ok(clean_translation(&content))
    }
}

/// POST a chat completion and parse the first choice
pub(crate) async fn send_chat(
    client: &Client,
    base_url: &str,
    bearer: &str,
    request: &ChatCompletionRequest,
) -> Result<String, ProviderError> {
    let url = format!("{}/chat/completions", base_url.trim_end_matches('/'));
    let response = client
        .post(&url)
        .bearer_auth(bearer)
        .json(request)
        .send()
        .await
        .map_err(transport_error)?;
    let response = check_response(response).await?;
    let parsed: ChatCompletionResponse = response
        .json()
        .await
        .map_err(|e| ProviderError::ParseError(e.to_string()))?;
    parsed.into_text()
}

/// Client for OpenAI-compatible endpoints
#[derive(Debug)]
pub struct OpenAICompatible {
    client: Client,
    name: String,
    base_url: String,
    model: String,
    api_key: String,
    temperature: f32,
    max_tokens: u32,
}

impl OpenAICompatible {
    pub fn from_config(config: &ProviderConfig) -> Result<Self, ProviderError> {
        let api_key = config
            .api_key()
            .ok_or_else(|| ProviderError::AuthenticationError(format!("{} API key is missing", config.kind)))?;
        Ok(Self {
            client: build_client(config.timeout())?,
            name: config.kind.name().to_string(),
            base_url: config.effective_base_url(),
            model: config.effective_model(),
            api_key: api_key.to_string(),
            temperature: config.options.temperature,
            max_tokens: config.options.max_tokens,
        })
    }
}

#[async_trait]
impl Backend for OpenAICompatible {
    async fn translate(
        &self,
        text: &str,
        prompt: &Prompt,
        cancel: &CancellationToken,
    ) -> Result<String, ProviderError> {
        let request = ChatCompletionRequest::for_prompt(&self.model, prompt, text, self.temperature, self.max_tokens);
        with_cancel(cancel, send_chat(&self.client, &self.base_url, &self.api_key, &request)).await
    }

    fn provider_name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        &self.model
    }
}
