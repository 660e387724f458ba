/*!
 * Tests for the HTTP backends against a mock server
 */

use std::time::Duration;

use mockito::{Matcher, Server};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use ebook_translator::app_config::{ProviderConfig, ProviderKind};
use ebook_translator::errors::ProviderError;
use ebook_translator::providers::qwen::{QwenCredentials, load_credentials, save_credentials};
use ebook_translator::providers::{Backend, Prompt, ProviderBackend};

fn config(kind: ProviderKind, base_url: &str, api_key: Option<&str>) -> ProviderConfig {
    ProviderConfig {
        base_url: base_url.to_string(),
        api_key: api_key.map(str::to_string),
        ..ProviderConfig::new(kind)
    }
}

fn prompt() -> Prompt {
    Prompt::new(Some("en"), "fr", "Book title")
}

#[tokio::test]
async fn test_openai_withSuccessfulResponse_shouldReturnCleanedText() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/chat/completions")
        .match_header("authorization", "Bearer sk-test")
        .match_body(Matcher::PartialJson(json!({"model": "gpt-4"})))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(json!({"choices": [{"message": {"content": "Translation: Bonjour"}, "finish_reason": "stop"}]}).to_string())
        .create_async()
        .await;

    let mut provider_config = config(ProviderKind::OpenAI, &server.url(), Some("sk-test"));
    provider_config.model = "gpt-4".to_string();
    let backend = ProviderBackend::from_config(&provider_config).unwrap();
    assert_eq!(backend.provider_name(), "openai");
    assert_eq!(backend.model(), "gpt-4");

    let text = backend.translate("Hello", &prompt(), &CancellationToken::new()).await.unwrap();
    assert_eq!(text, "Bonjour");
    mock.assert_async().await;
}

#[tokio::test]
async fn test_openai_withStatusCodes_shouldClassifyErrors() {
    let mut throttling = Server::new_async().await;
    let _throttled = throttling
        .mock("POST", "/chat/completions")
        .with_status(429)
        .with_body("slow down")
        .create_async()
        .await;
    let backend =
        ProviderBackend::from_config(&config(ProviderKind::OpenAI, &throttling.url(), Some("sk-test"))).unwrap();
    let result = backend.translate("Hello", &prompt(), &CancellationToken::new()).await;
    assert!(matches!(result, Err(ProviderError::RateLimitExceeded(_))));

    let mut denying = Server::new_async().await;
    let _denied = denying
        .mock("POST", "/chat/completions")
        .with_status(401)
        .with_body("invalid api key")
        .create_async()
        .await;
    let backend =
        ProviderBackend::from_config(&config(ProviderKind::OpenAI, &denying.url(), Some("sk-test"))).unwrap();
    let result = backend.translate("Hello", &prompt(), &CancellationToken::new()).await;
    assert!(matches!(result, Err(ProviderError::AuthenticationError(_))));
}

#[tokio::test]
async fn test_openai_withTruncatedOutput_shouldReportTextSize() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("POST", "/chat/completions")
        .with_status(200)
        .with_body(json!({"choices": [{"message": {"content": "Bonj"}, "finish_reason": "length"}]}).to_string())
        .create_async()
        .await;
    let backend = ProviderBackend::from_config(&config(ProviderKind::OpenAI, &server.url(), Some("sk-test"))).unwrap();
    let result = backend.translate("Hello", &prompt(), &CancellationToken::new()).await;
    assert!(matches!(result, Err(ProviderError::TextSizeError(_))));
}

#[tokio::test]
async fn test_openai_withoutApiKey_shouldFailConstruction() {
    let result = ProviderBackend::from_config(&config(ProviderKind::OpenAI, "http://localhost:1", None));
    assert!(matches!(result, Err(ProviderError::ConfigError(_))));
}

#[tokio::test]
async fn test_anthropic_withSuccessfulResponse_shouldJoinTextBlocks() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/v1/messages")
        .match_header("x-api-key", "ak-test")
        .with_status(200)
        .with_body(json!({"content": [{"type": "text", "text": "Bonjour"}]}).to_string())
        .create_async()
        .await;

    let backend =
        ProviderBackend::from_config(&config(ProviderKind::Anthropic, &server.url(), Some("ak-test"))).unwrap();
    let text = backend.translate("Hello", &prompt(), &CancellationToken::new()).await.unwrap();
    assert_eq!(text, "Bonjour");
    mock.assert_async().await;
}

#[tokio::test]
async fn test_ollama_withContextOverflow_shouldReportTextSize() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("POST", "/api/generate")
        .with_status(400)
        .with_body("prompt exceeds maximum context length")
        .create_async()
        .await;

    let backend = ProviderBackend::from_config(&config(ProviderKind::Ollama, &server.url(), None)).unwrap();
    let result = backend.translate("Hello", &prompt(), &CancellationToken::new()).await;
    assert!(matches!(result, Err(ProviderError::TextSizeError(_))));
}

#[tokio::test]
async fn test_ollama_withFinishedGeneration_shouldReturnText() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("POST", "/api/generate")
        .match_body(Matcher::PartialJson(json!({"stream": false})))
        .with_status(200)
        .with_body(json!({"response": "Bonjour", "done": true}).to_string())
        .create_async()
        .await;

    let backend = ProviderBackend::from_config(&config(ProviderKind::Ollama, &server.url(), None)).unwrap();
    let text = backend.translate("Hello", &prompt(), &CancellationToken::new()).await.unwrap();
    assert_eq!(text, "Bonjour");
}

#[tokio::test]
async fn test_gemini_withApiKey_shouldSendKeyAsQuery() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/models/gemini-test:generateContent")
        .match_query(Matcher::UrlEncoded("key".into(), "gk-test".into()))
        .with_status(200)
        .with_body(json!({"candidates": [{"content": {"parts": [{"text": "Bonjour"}]}, "finishReason": "STOP"}]}).to_string())
        .create_async()
        .await;

    let mut provider_config = config(ProviderKind::Gemini, &server.url(), Some("gk-test"));
    provider_config.model = "gemini-test".to_string();
    let backend = ProviderBackend::from_config(&provider_config).unwrap();
    let text = backend.translate("Hello", &prompt(), &CancellationToken::new()).await.unwrap();
    assert_eq!(text, "Bonjour");
    mock.assert_async().await;
}

#[tokio::test]
async fn test_backend_whenCancelled_shouldReturnCancelled() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("POST", "/api/generate")
        .with_status(200)
        .with_body(json!({"response": "Bonjour", "done": true}).to_string())
        .create_async()
        .await;

    let backend = ProviderBackend::from_config(&config(ProviderKind::Ollama, &server.url(), None)).unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = backend.translate("Hello", &prompt(), &cancel).await;
    assert_eq!(result, Err(ProviderError::Cancelled));
}

#[tokio::test]
async fn test_qwen_withExpiredToken_shouldRefreshAndPersist() {
    let mut server = Server::new_async().await;
    let token = server
        .mock("POST", "/oauth/token")
        .match_body(Matcher::AllOf(vec![
            Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
            Matcher::UrlEncoded("refresh_token".into(), "refresh-1".into()),
            Matcher::UrlEncoded("client_id".into(), "client".into()),
        ]))
        .with_status(200)
        .with_body(json!({"access_token": "access-2", "expires_in": 3600}).to_string())
        .create_async()
        .await;
    let chat = server
        .mock("POST", "/v1/chat/completions")
        .match_header("authorization", "Bearer access-2")
        .with_status(200)
        .with_body(json!({"choices": [{"message": {"content": "Bonjour"}, "finish_reason": "stop"}]}).to_string())
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("qwen_credentials.json");
    save_credentials(
        &path,
        &QwenCredentials {
            access_token: "access-1".to_string(),
            refresh_token: "refresh-1".to_string(),
            token_type: "Bearer".to_string(),
            resource_url: Some(server.url()),
            expiry_date: chrono::Utc::now().timestamp_millis() - 1_000,
        },
    )
    .unwrap();

    let mut provider_config = ProviderConfig::new(ProviderKind::Qwen);
    provider_config.oauth_credentials_path = Some(path.clone());
    provider_config.oauth_token_url = format!("{}/oauth/token", server.url());
    provider_config.options.timeout_secs = 5;
    let qwen = ebook_translator::providers::qwen::Qwen::from_config(&provider_config)
        .unwrap()
        .with_client_credentials("client", "secret");

    let text = tokio::time::timeout(
        Duration::from_secs(10),
        qwen.translate("Hello", &prompt(), &CancellationToken::new()),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(text, "Bonjour");
    token.assert_async().await;
    chat.assert_async().await;

    let saved = load_credentials(&path).unwrap();
    assert_eq!(saved.access_token, "access-2");
    assert_eq!(saved.refresh_token, "refresh-1");
    assert!(!saved.is_expired());
    assert_eq!(qwen.current_credentials().await, Some(saved));
}

#[test]
fn test_dictionary_shouldSubstituteWithoutNetwork() {
    let backend = ProviderBackend::from_config(&ProviderConfig::new(ProviderKind::Dictionary)).unwrap();
    let text = tokio_test::block_on(async { backend.translate("книга", &prompt(), &CancellationToken::new()).await })
        .unwrap();
    assert_eq!(text, "књига");
}
