/*!
 * Translation pipeline: caching, book traversal and the local coordinator.
 *
 * - `cache`: content-addressed TTL cache and request fingerprints
 * - `walker`: ordered, bounded-concurrency traversal of a `Book`
 * - `coordinator`: translation against a single in-process backend
 * - `detection`: source language detection
 */

pub mod cache;
pub mod coordinator;
pub mod detection;
pub mod walker;

pub use self::cache::{CacheKey, CacheStats, TranslationCache};
pub use self::coordinator::{LocalCoordinator, UnitFallback};
pub use self::detection::{LanguageDetector, LlmLanguageDetector};
pub use self::walker::{
    BookWalker, FailedUnit, JobContext, TranslationReport, UnitOutcome, UnitSource, UnitTranslator,
};
