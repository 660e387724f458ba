/*!
 * Local llama.cpp backend.
 *
 * Runs the configured `llama-cli` binary once per unit and captures stdout.
 * The child is killed if the request is cancelled or dropped.
 */

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::{Backend, Prompt, clean_translation, with_cancel};
use crate::app_config::ProviderConfig;
use crate::errors::ProviderError;

static ANSI_ESCAPE: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"\x1b\[[0-9;]*[A-Za-z]").ok());

#[derive(Debug)]
pub struct LlamaCpp {
    binary: PathBuf,
    model_path: PathBuf,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl LlamaCpp {
    pub fn from_config(config: &ProviderConfig) -> Result<Self, ProviderError> {
        let model_path = config
            .llama_cpp_model_path
            .clone()
            .ok_or_else(|| ProviderError::ConfigError("llama_cpp_model_path is not set".to_string()))?;
        let model = if config.model.is_empty() {
            model_path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| config.effective_model())
        } else {
            config.model.clone()
        };
        Ok(Self {
            binary: config.llama_cpp_binary.clone(),
            model_path,
            model,
            temperature: config.options.temperature,
            max_tokens: config.options.max_tokens,
        })
    }

    fn command(&self, prompt: &str) -> Command {
        let mut command = Command::new(&self.binary);
        command
            .arg("-m")
            .arg(&self.model_path)
            .arg("-p")
            .arg(prompt)
            .arg("-n")
            .arg(self.max_tokens.to_string())
            .arg("--temp")
            .arg(format!("{:.2}", self.temperature))
            .arg("--no-display-prompt")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    async fn run(&self, prompt: &str) -> Result<String, ProviderError> {
        let output = self.command(prompt).output().await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ProviderError::ConfigError(format!("llama.cpp binary not found: {}", self.binary.display()))
            } else {
                ProviderError::ConnectionError(format!("failed to run llama.cpp: {}", e))
            }
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProviderError::ApiError {
                status_code: 500,
                message: stderr.trim().to_string(),
            });
        }

        let text = parse_output(&String::from_utf8_lossy(&output.stdout));
        if text.is_empty() {
            return Err(ProviderError::ParseError("llama.cpp produced no output".to_string()));
        }
        Ok(text)
    }
}

/// Strip terminal escapes and anything echoed before a "Translation:" marker
pub fn parse_output(stdout: &str) -> String {
    let plain = match ANSI_ESCAPE.as_ref() {
        Some(re) => re.replace_all(stdout, "").into_owned(),
        None => stdout.to_string(),
    };
    let body = match plain.find("Translation:") {
        Some(idx) => &plain[idx + "Translation:".len()..],
        None => plain.as_str(),
    };
    clean_translation(body)
}

#[async_trait]
impl Backend for LlamaCpp {
    async fn translate(
        &self,
        text: &str,
        prompt: &Prompt,
        cancel: &CancellationToken,
    ) -> Result<String, ProviderError> {
        with_cancel(cancel, self.run(&prompt.combined(text))).await
    }

    fn provider_name(&self) -> &str {
        "llama-cpp"
    }

    fn model(&self) -> &str {
        &self.model
    }
}
