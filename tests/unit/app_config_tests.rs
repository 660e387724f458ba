/*!
 * Tests for configuration loading and validation
 */

use ebook_translator::app_config::{
    Config, LogLevel, ProviderConfig, ProviderKind, RemoteInstanceConfig, WorkerAuth, WorkerDescriptor,
};
use ebook_translator::language_utils::parse_detected_language;

fn worker(id: &str) -> WorkerDescriptor {
    let mut worker = WorkerDescriptor::new(id, "10.0.0.5", "translator");
    worker.auth = WorkerAuth {
        private_key: Some("~/.ssh/id_ed25519".to_string()),
        password: None,
    };
    worker
}

fn valid_config() -> Config {
    Config {
        provider: ProviderConfig::new(ProviderKind::Dictionary),
        ..Config::default()
    }
}

#[test]
fn test_defaults_shouldMatchDocumentedValues() {
    let config = Config::default();
    assert_eq!(config.cache.ttl_secs, 24 * 60 * 60);
    assert!(config.cache.enabled);
    assert_eq!(config.coordinator.max_concurrent, 5);
    assert_eq!(config.circuit_breaker.failure_threshold, 5);
    assert_eq!(config.circuit_breaker.success_threshold, 3);
    assert_eq!(config.fallback.max_retries, 3);
    assert_eq!(config.fallback.degradation_threshold, 0.5);
    assert_eq!(config.fallback.alert_threshold, 0.8);
    assert_eq!(config.pool.max_connections_per_worker, 10);
    assert_eq!(config.log_level, LogLevel::Info);
}

#[test]
fn test_validate_withDictionaryProvider_shouldPass() {
    valid_config().validate().unwrap();
}

#[test]
fn test_validate_withMissingApiKey_shouldFail() {
    let config = Config::default();
    let error = config.validate().unwrap_err().to_string();
    assert!(error.contains("API key"));
}

#[test]
fn test_validate_withDuplicateWorker_shouldFail() {
    let mut config = valid_config();
    config.workers = vec![worker("w1"), worker("w1")];
    assert!(config.validate().unwrap_err().to_string().contains("Duplicate worker id"));
}

#[test]
fn test_validate_withWorkerWithoutAuth_shouldFail() {
    let mut config = valid_config();
    config.workers = vec![WorkerDescriptor::new("w1", "10.0.0.5", "translator")];
    assert!(config.validate().is_err());
}

#[test]
fn test_validate_withUnknownRemoteWorker_shouldFail() {
    let mut config = valid_config();
    config.workers = vec![worker("w1")];
    config.remote_instances = vec![RemoteInstanceConfig {
        worker_id: "w2".to_string(),
        provider: "openai".to_string(),
        model: "gpt-4".to_string(),
    }];
    assert!(config.validate().unwrap_err().to_string().contains("unknown worker: w2"));
}

#[test]
fn test_validate_withInvalidTargetLanguage_shouldFail() {
    let mut config = valid_config();
    config.coordinator.target_language = "xx-invalid".to_string();
    assert!(config.validate().is_err());
}

#[test]
fn test_fromFile_withPartialJson_shouldFillDefaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("conf.json");
    std::fs::write(
        &path,
        r#"{
            "provider": {"name": "ollama", "model": "llama3"},
            "coordinator": {"target_language": "fr", "max_concurrent": 2},
            "log_level": "debug"
        }"#,
    )
    .unwrap();

    let config = Config::from_file(&path).unwrap();
    assert_eq!(config.provider.kind, ProviderKind::Ollama);
    assert_eq!(config.provider.effective_model(), "llama3");
    assert_eq!(config.coordinator.target_language, "fr");
    assert_eq!(config.coordinator.max_concurrent, 2);
    assert_eq!(config.log_level, LogLevel::Debug);
    assert_eq!(config.cache.ttl_secs, 24 * 60 * 60);
    config.validate().unwrap();
}

#[test]
fn test_save_thenFromFile_shouldPreserveWorkers() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("conf.json");
    let mut config = valid_config();
    config.workers = vec![worker("w1")];
    config.save(&path).unwrap();

    let loaded = Config::from_file(&path).unwrap();
    assert_eq!(loaded.workers, config.workers);
}

#[test]
fn test_fromFile_withMalformedJson_shouldFail() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("conf.json");
    std::fs::write(&path, "{ not json").unwrap();
    assert!(Config::from_file(&path).is_err());
}

#[test]
fn test_parseDetectedLanguage_withVariousReplies_shouldExtractCode() {
    assert_eq!(parse_detected_language("ru").as_deref(), Some("ru"));
    assert_eq!(parse_detected_language("\"en\".").as_deref(), Some("en"));
    assert_eq!(parse_detected_language("The text is in German (de)").as_deref(), Some("de"));
    assert_eq!(parse_detected_language("???"), None);
}
