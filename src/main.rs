// Module-specific lints configuration
#![allow(clippy::uninlined_format_args)]

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::{Shell, generate};
use indicatif::{ProgressBar, ProgressStyle};
use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError, info, warn};
use tokio_util::sync::CancellationToken;

use ebook_translator::app_config::{self, Config, ProviderConfig, ProviderKind};
use ebook_translator::distributed::signing::{DEFAULT_KEY_BITS, generate_signing_keys};
use ebook_translator::{
    Book, DistributedCoordinator, Event, EventBus, EventType, LocalCoordinator, TranslationReport,
};

/// CLI wrapper for ProviderKind to implement ValueEnum
#[derive(Debug, Clone, ValueEnum)]
enum CliProvider {
    #[value(name = "openai")]
    OpenAI,
    Anthropic,
    Gemini,
    Ollama,
    Qwen,
    Zhipu,
    #[value(name = "deepseek")]
    DeepSeek,
    #[value(name = "llama-cpp")]
    LlamaCpp,
    Dictionary,
}

impl From<CliProvider> for ProviderKind {
    fn from(provider: CliProvider) -> Self {
        match provider {
            CliProvider::OpenAI => ProviderKind::OpenAI,
            CliProvider::Anthropic => ProviderKind::Anthropic,
            CliProvider::Gemini => ProviderKind::Gemini,
            CliProvider::Ollama => ProviderKind::Ollama,
            CliProvider::Qwen => ProviderKind::Qwen,
            CliProvider::Zhipu => ProviderKind::Zhipu,
            CliProvider::DeepSeek => ProviderKind::DeepSeek,
            CliProvider::LlamaCpp => ProviderKind::LlamaCpp,
            CliProvider::Dictionary => ProviderKind::Dictionary,
        }
    }
}

/// CLI wrapper for LogLevel to implement ValueEnum
#[derive(Debug, Clone, ValueEnum)]
enum CliLogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<CliLogLevel> for app_config::LogLevel {
    fn from(level: CliLogLevel) -> Self {
        match level {
            CliLogLevel::Error => app_config::LogLevel::Error,
            CliLogLevel::Warn => app_config::LogLevel::Warn,
            CliLogLevel::Info => app_config::LogLevel::Info,
            CliLogLevel::Debug => app_config::LogLevel::Debug,
            CliLogLevel::Trace => app_config::LogLevel::Trace,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Translate a book stored as JSON
    Translate(TranslateArgs),

    /// Generate an RSA key pair for signing update packages
    Keygen {
        /// Directory the key files are written to
        #[arg(value_name = "DIR")]
        dir: PathBuf,

        /// Key size in bits
        #[arg(long, default_value_t = DEFAULT_KEY_BITS)]
        bits: usize,
    },

    /// Generate shell completions for ebook-translator
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Parser, Debug)]
struct TranslateArgs {
    /// Input book as JSON
    #[arg(value_name = "INPUT")]
    input: PathBuf,

    /// Output path, defaults to `<input>.<target>.json`
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Configuration file path
    #[arg(short, long, default_value = "conf.json")]
    config: PathBuf,

    /// Translation provider to use
    #[arg(short, long, value_enum)]
    provider: Option<CliProvider>,

    /// Model name to use for translation
    #[arg(short, long)]
    model: Option<String>,

    /// Source language code (e.g., 'ru', 'en'); detected when omitted
    #[arg(short, long)]
    source_language: Option<String>,

    /// Target language code (e.g., 'sr', 'es')
    #[arg(short, long)]
    target_language: Option<String>,

    /// Set logging level
    #[arg(short, long, value_enum)]
    log_level: Option<CliLogLevel>,
}

/// Translate ebooks with LLM providers, locally or across remote workers
#[derive(Parser, Debug)]
#[command(name = "ebook-translator")]
#[command(version)]
#[command(about = "LLM-powered ebook translation")]
#[command(long_about = "Translates every title, description and section of a book with an LLM provider.

EXAMPLES:
    ebook-translator translate book.json -o book.sr.json
    ebook-translator translate book.json -p anthropic -t es
    ebook-translator keygen ~/.translator/keys
    ebook-translator completions bash > ebook-translator.bash

CONFIGURATION:
    Configuration is read from conf.json by default. If the file does not
    exist a default one is written. When the configuration lists remote
    instances, units are translated on the workers with local fallback.")]
struct CommandLineOptions {
    #[command(subcommand)]
    command: Commands,
}

// @struct: Coloured stderr logger
struct CustomLogger {
    level: LevelFilter,
}

impl CustomLogger {
    fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
        log::set_boxed_logger(Box::new(CustomLogger { level: LevelFilter::Trace }))?;
        log::set_max_level(level);
        Ok(())
    }

    // @returns: ANSI colour code and prefix for a level
    fn style(level: Level) -> (&'static str, &'static str) {
        match level {
            Level::Error => ("1;31", "❌ "),
            Level::Warn => ("1;33", "🚧 "),
            Level::Info => ("1;32", ""),
            Level::Debug => ("1;36", "🔍 "),
            Level::Trace => ("1;35", "📋 "),
        }
    }
}

impl Log for CustomLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let now = chrono::Local::now().format("%H:%M:%S.%3f");
            let (colour, prefix) = Self::style(record.level());
            let _ = writeln!(
                std::io::stderr(),
                "\x1B[{}m{} {}{}\x1B[0m",
                colour,
                now,
                prefix,
                record.args()
            );
        }
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    CustomLogger::init(LevelFilter::Info)?;

    let cli = CommandLineOptions::parse();
    match cli.command {
        Commands::Translate(args) => run_translate(args).await,
        Commands::Keygen { dir, bits } => {
            let paths = generate_signing_keys(&dir, bits)?;
            info!("Private key: {}", paths.private_key.display());
            info!("Public key: {}", paths.public_key.display());
            Ok(())
        }
        Commands::Completions { shell } => {
            let mut cmd = CommandLineOptions::command();
            generate(shell, &mut cmd, "ebook-translator", &mut std::io::stdout());
            Ok(())
        }
    }
}

fn load_config(options: &TranslateArgs) -> Result<Config> {
    let mut config = if options.config.exists() {
        Config::from_file(&options.config)?
    } else {
        warn!("Config file not found at '{}', creating default config.", options.config.display());
        let config = Config::default();
        config.save(&options.config)?;
        config
    };

    if let Some(provider) = &options.provider {
        let kind: ProviderKind = provider.clone().into();
        if kind != config.provider.kind {
            let api_key = config.provider.api_key.take();
            config.provider = ProviderConfig { api_key, ..ProviderConfig::new(kind) };
        }
    }
    if let Some(model) = &options.model {
        config.provider.model = model.clone();
    }
    if let Some(source) = &options.source_language {
        config.coordinator.source_language = Some(source.clone());
    }
    if let Some(target) = &options.target_language {
        config.coordinator.target_language = target.clone();
    }
    if let Some(level) = &options.log_level {
        config.log_level = level.clone().into();
    }

    config.validate().context("Configuration validation failed")?;
    Ok(config)
}

fn default_output(input: &Path, target_language: &str) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "book".to_string());
    input.with_file_name(format!("{}.{}.json", stem, target_language))
}

fn progress_bar(total: u64) -> ProgressBar {
    let progress_bar = ProgressBar::new(total);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} units ({percent}%) {msg} {eta}")
        .or_else(|_| ProgressStyle::default_bar().template("{spinner} [{elapsed_precise}] [{bar:40}] {pos}/{len} ({percent}%) {msg}"))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    progress_bar.set_style(style.progress_chars("█▓▒░"));
    progress_bar
}

async fn run_translate(options: TranslateArgs) -> Result<()> {
    if let Some(level) = &options.log_level {
        let level: app_config::LogLevel = level.clone().into();
        log::set_max_level(level.to_level_filter());
    }

    let config = load_config(&options)?;
    log::set_max_level(config.log_level.to_level_filter());

    let content = std::fs::read_to_string(&options.input)
        .with_context(|| format!("Failed to read book: {}", options.input.display()))?;
    let book: Book = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse book: {}", options.input.display()))?;
    let output = options
        .output
        .clone()
        .unwrap_or_else(|| default_output(&options.input, &config.coordinator.target_language));

    let events = EventBus::new();
    let total = book.units().len() as u64;
    let bar = Arc::new(progress_bar(total));
    let progress = bar.clone();
    events.subscribe(EventType::Progress, move |event: &Event| {
        if let Some(done) = event.data.get("done").and_then(|v| v.as_u64()) {
            progress.set_position(done);
        }
        if let Some(source) = event.data_str("source") {
            progress.set_message(source.to_string());
        }
    });

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling translation");
            on_signal.cancel();
        }
    });

    info!(
        "🚀 {} - {} → {}",
        config.provider.kind,
        config.provider.effective_model(),
        config.coordinator.target_language
    );
    let session_id = uuid::Uuid::new_v4().to_string();
    let report = if config.remote_instances.is_empty() {
        let coordinator = LocalCoordinator::from_config(&config, events.clone())?;
        coordinator.translate_book(&book, Some(&session_id), &cancel).await?
    } else {
        let coordinator = DistributedCoordinator::from_config(&config, events.clone())?;
        coordinator.discover_workers(&cancel).await;
        coordinator.translate_book(&book, Some(&session_id), &cancel).await?
    };
    bar.finish_with_message("done");

    write_report(&report, &output)
}

fn write_report(report: &TranslationReport, output: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(&report.book)?;
    std::fs::write(output, json).with_context(|| format!("Failed to write book: {}", output.display()))?;

    info!(
        "Translated {} of {} units in {:.1}s ({} cached, {} fallback, {} skipped)",
        report.translated,
        report.total_units,
        report.duration.as_secs_f64(),
        report.cached,
        report.fallbacks,
        report.skipped
    );
    for failed in &report.failed {
        warn!("{} kept in source language: {}", failed.path, failed.message);
    }
    if !report.is_complete() {
        return Err(anyhow!("{} units failed to translate", report.failed.len()));
    }
    info!("Success: {}", output.display());
    Ok(())
}
