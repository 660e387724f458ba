/*!
 * Book traversal shared by the local and distributed coordinators.
 *
 * The walker flattens a `Book` into units, translates metadata units first
 * and then everything else with bounded concurrency, and writes each result
 * back at its original path. The output traversal order therefore always
 * matches the input, however the units were scheduled.
 */

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::book::{Book, TranslationUnit, UnitPath};
use crate::errors::{ErrorKind, TranslationError};
use crate::events::{Event, EventBus, EventType};
use crate::providers::Prompt;

/// Where a unit's final text came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitSource {
    Cache,
    Backend,
    Remote,
    Fallback,
    /// Blank text, copied through
    Passthrough,
    /// Translation failed, source text kept
    Original,
}

impl UnitSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cache => "cache",
            Self::Backend => "backend",
            Self::Remote => "remote",
            Self::Fallback => "fallback",
            Self::Passthrough => "passthrough",
            Self::Original => "original",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnitOutcome {
    pub text: String,
    pub source: UnitSource,
}

impl UnitOutcome {
    pub fn new(text: impl Into<String>, source: UnitSource) -> Self {
        Self {
            text: text.into(),
            source,
        }
    }
}

/// Translates one non-blank unit
#[async_trait]
pub trait UnitTranslator: Send + Sync {
    async fn translate_unit(
        &self,
        unit: &TranslationUnit,
        prompt: &Prompt,
        cancel: &CancellationToken,
    ) -> Result<UnitOutcome, TranslationError>;
}

/// Languages and session for one job
#[derive(Debug, Clone, PartialEq)]
pub struct JobContext {
    pub session_id: Option<String>,
    /// `None` lets the model detect the source language
    pub source_language: Option<String>,
    pub target_language: String,
}

impl JobContext {
    pub fn new(session_id: Option<&str>, source_language: Option<&str>, target_language: &str) -> Self {
        Self {
            session_id: session_id.map(str::to_string),
            source_language: source_language.map(str::to_string),
            target_language: target_language.to_string(),
        }
    }

    pub fn prompt_for(&self, unit: &TranslationUnit) -> Prompt {
        Prompt::new(self.source_language.as_deref(), &self.target_language, &unit.context_hint)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedUnit {
    pub path: String,
    pub error_kind: ErrorKind,
    pub message: String,
}

/// Result of translating a whole book
#[derive(Debug, Clone)]
pub struct TranslationReport {
    pub book: Book,
    pub total_units: usize,
    pub translated: usize,
    pub cached: usize,
    pub fallbacks: usize,
    pub skipped: usize,
    pub failed: Vec<FailedUnit>,
    pub source_language: Option<String>,
    pub duration: Duration,
}

impl TranslationReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Drives a `UnitTranslator` over a book
#[derive(Debug, Clone)]
pub struct BookWalker {
    events: EventBus,
    max_concurrent: usize,
}

impl BookWalker {
    pub fn new(events: EventBus, max_concurrent: usize) -> Self {
        Self {
            events,
            max_concurrent: max_concurrent.max(1),
        }
    }

    pub async fn translate_book<T>(
        &self,
        translator: &T,
        book: &Book,
        job: &JobContext,
        cancel: &CancellationToken,
    ) -> Result<TranslationReport, TranslationError>
    where
        T: UnitTranslator + ?Sized,
    {
        let started = Instant::now();
        let units = book.units();
        let total = units.len();
        let session = job.session_id.as_deref();

        info!(
            "Translating {} units ({} -> {})",
            total,
            job.source_language.as_deref().unwrap_or("auto"),
            job.target_language
        );
        self.events.publish(
            Event::new(EventType::TranslationStarted, "Translation started")
                .with_session(session)
                .with_data("total_units", total as u64)
                .with_data("source_language", job.source_language.clone().unwrap_or_default())
                .with_data("target_language", job.target_language.as_str()),
        );

        let (metadata, body): (Vec<(usize, TranslationUnit)>, Vec<(usize, TranslationUnit)>) =
            units.into_iter().enumerate().partition(|(_, u)| u.path.is_metadata());

        let done = Arc::new(AtomicUsize::new(0));
        let mut results = self.run_phase(translator, metadata, job, total, &done, cancel).await;
        results.extend(self.run_phase(translator, body, job, total, &done, cancel).await);

        if cancel.is_cancelled() {
            self.events.publish(
                Event::new(EventType::TranslationError, "Translation cancelled")
                    .with_session(session)
                    .with_error(&TranslationError::Cancelled),
            );
            return Err(TranslationError::Cancelled);
        }

        let mut report = TranslationReport {
            book: book.clone(),
            total_units: total,
            translated: 0,
            cached: 0,
            fallbacks: 0,
            skipped: 0,
            failed: Vec::new(),
            source_language: job.source_language.clone(),
            duration: Duration::ZERO,
        };

        results.sort_by_key(|(index, _, _)| *index);
        for (_, path, result) in results {
            match result {
                Ok(outcome) => {
                    match outcome.source {
                        UnitSource::Cache => report.cached += 1,
                        UnitSource::Fallback => report.fallbacks += 1,
                        UnitSource::Passthrough => report.skipped += 1,
                        UnitSource::Backend | UnitSource::Remote | UnitSource::Original => {}
                    }
                    if !matches!(outcome.source, UnitSource::Passthrough | UnitSource::Original) {
                        report.translated += 1;
                    }
                    if !report.book.set(path, outcome.text) {
                        warn!("Unit path {} no longer exists in the output book", path);
                    }
                }
                Err(e) => report.failed.push(FailedUnit {
                    path: path.to_string(),
                    error_kind: e.kind(),
                    message: e.to_string(),
                }),
            }
        }
        report.duration = started.elapsed();

        info!(
            "Translation finished: {} translated, {} cached, {} failed in {:?}",
            report.translated,
            report.cached,
            report.failed.len(),
            report.duration
        );
        self.events.publish(
            Event::new(EventType::TranslationCompleted, "Translation completed")
                .with_session(session)
                .with_data("total_units", total as u64)
                .with_data("translated", report.translated as u64)
                .with_data("cached", report.cached as u64)
                .with_data("failed", report.failed.len() as u64)
                .with_data("duration_ms", report.duration.as_millis() as u64),
        );
        Ok(report)
    }

    /// Translate a group of units concurrently. Each result carries its
    /// traversal index so the caller can restore order.
    async fn run_phase<T>(
        &self,
        translator: &T,
        units: Vec<(usize, TranslationUnit)>,
        job: &JobContext,
        total: usize,
        done: &Arc<AtomicUsize>,
        cancel: &CancellationToken,
    ) -> Vec<(usize, UnitPath, Result<UnitOutcome, TranslationError>)>
    where
        T: UnitTranslator + ?Sized,
    {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));

        stream::iter(units)
            .map(|(index, unit)| {
                let semaphore = semaphore.clone();
                let done = done.clone();
                async move {
                    let result = match semaphore.acquire().await {
                        Ok(_permit) => self.translate_one(translator, &unit, job, cancel).await,
                        Err(_) => Err(TranslationError::Cancelled),
                    };
                    let completed = done.fetch_add(1, Ordering::SeqCst) + 1;
                    self.report_unit(&unit, &result, job, completed, total);
                    (index, unit.path, result)
                }
            })
            .buffer_unordered(self.max_concurrent)
            .collect()
            .await
    }

    async fn translate_one<T>(
        &self,
        translator: &T,
        unit: &TranslationUnit,
        job: &JobContext,
        cancel: &CancellationToken,
    ) -> Result<UnitOutcome, TranslationError>
    where
        T: UnitTranslator + ?Sized,
    {
        if unit.is_blank() {
            return Ok(UnitOutcome::new(unit.text.clone(), UnitSource::Passthrough));
        }
        if cancel.is_cancelled() {
            return Err(TranslationError::Cancelled);
        }
        let prompt = job.prompt_for(unit);
        match translator.translate_unit(unit, &prompt, cancel).await {
            Ok(outcome) => Ok(outcome),
            Err(e) if e.is_cancelled() => Err(e),
            Err(e) => {
                warn!("Unit {} failed, keeping source text: {}", unit.path, e);
                self.events.publish(
                    Event::new(EventType::UnitFailed, format!("Failed to translate {}", unit.path))
                        .with_session(job.session_id.as_deref())
                        .with_data("path", unit.path.to_string())
                        .with_error(&e),
                );
                Err(e)
            }
        }
    }

    fn report_unit(
        &self,
        unit: &TranslationUnit,
        result: &Result<UnitOutcome, TranslationError>,
        job: &JobContext,
        done: usize,
        total: usize,
    ) {
        let source = match result {
            Ok(outcome) => outcome.source.as_str(),
            Err(_) => UnitSource::Original.as_str(),
        };
        debug!("{}/{} {} ({})", done, total, unit.path, source);
        self.events.publish(
            Event::new(EventType::Progress, format!("Translated {} of {} units", done, total))
                .with_session(job.session_id.as_deref())
                .with_data("session_id", job.session_id.clone().unwrap_or_default())
                .with_data("path", unit.path.to_string())
                .with_data("done", done as u64)
                .with_data("total", total as u64)
                .with_data("source", source),
        );
    }
}
