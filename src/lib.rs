/*!
 * # ebook-translator
 *
 * Core of an LLM-driven ebook translation pipeline.
 *
 * ## Features
 *
 * - Translate every title, description and section of a book through an LLM backend
 * - Backends: OpenAI-compatible APIs (OpenAI, Zhipu, DeepSeek), Anthropic, Gemini,
 *   Ollama, Qwen (with OAuth refresh), a local llama.cpp binary and a dictionary
 * - Content-addressed translation cache with TTL
 * - Circuit breakers, retries with jittered backoff and ordered fallbacks
 * - Distribution over remote workers with version gating, drift alerts,
 *   signed updates and rollback
 *
 * ## Architecture
 *
 * - `app_config`: Configuration management
 * - `events`: Event types and the publish/subscribe bus
 * - `book`: In-memory book tree and translation units
 * - `providers`: Backend clients behind the `Backend` trait
 * - `resilience`: Circuit breaker, retry policy and fallback manager
 * - `translation`: Cache, book traversal and the local coordinator
 * - `distributed`: Worker pool, pairing, versions and the distributed coordinator
 * - `language_utils`: ISO language code utilities
 * - `errors`: Error types for the application
 */

// Global lints configuration
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::redundant_closure_for_method_calls)]

pub mod app_config;
pub mod book;
pub mod distributed;
pub mod errors;
pub mod events;
pub mod language_utils;
pub mod providers;
pub mod resilience;
pub mod translation;

// Re-export main types for easier usage
pub use app_config::Config;
pub use book::{Book, Chapter, Metadata, Section, TranslationUnit, UnitPath};
pub use distributed::DistributedCoordinator;
pub use errors::{AppError, ErrorKind, ProviderError, TranslationError};
pub use events::{Event, EventBus, EventType};
pub use language_utils::{get_language_name, language_codes_match, normalize_to_part2t};
pub use providers::{Backend, Prompt, ProviderBackend};
pub use translation::{LocalCoordinator, TranslationCache, TranslationReport};
