/*!
 * Tests for the translation cache
 */

use std::time::Duration;

use ebook_translator::translation::cache::{CacheKey, TranslationCache, fingerprint};

#[test]
fn test_fingerprint_withDifferentFields_shouldDiffer() {
    let base = fingerprint("Hello", "Book title", "openai", "gpt-4");
    assert_eq!(base.len(), 64);
    assert_ne!(base, fingerprint("Hello", "Chapter title", "openai", "gpt-4"));
    assert_ne!(base, fingerprint("Hello", "Book title", "anthropic", "gpt-4"));
    assert_ne!(base, fingerprint("Hello", "Book title", "openai", "gpt-4o"));
    assert_eq!(base, CacheKey::new("Hello", "Book title", "openai", "gpt-4").fingerprint());
}

#[test]
fn test_fingerprint_withShiftedBoundaries_shouldDiffer() {
    assert_ne!(
        fingerprint("ab", "c", "openai", "gpt-4"),
        fingerprint("a", "bc", "openai", "gpt-4")
    );
}

#[test]
fn test_get_afterSet_shouldReturnValueAndCountHit() {
    let cache = TranslationCache::new(Duration::from_secs(60), true);
    cache.set("key", "Hola");
    assert_eq!(cache.get("key").as_deref(), Some("Hola"));
    assert_eq!(cache.get("other"), None);

    let stats = cache.stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.valid, 1);
}

#[test]
fn test_get_afterTtl_shouldMissUntilPurged() {
    let cache = TranslationCache::new(Duration::from_millis(20), true);
    cache.set("key", "Hola");
    std::thread::sleep(Duration::from_millis(40));

    assert_eq!(cache.get("key"), None);
    assert_eq!(cache.size(), 1);
    assert_eq!(cache.stats().expired, 1);
    assert_eq!(cache.purge_expired(), 1);
    assert_eq!(cache.size(), 0);
}

#[test]
fn test_disabledCache_shouldNeverStore() {
    let cache = TranslationCache::new(Duration::from_secs(60), false);
    cache.set("key", "Hola");
    assert_eq!(cache.get("key"), None);
    assert_eq!(cache.size(), 0);
    assert!(!cache.is_enabled());
}

#[test]
fn test_clones_shouldShareEntries() {
    let cache = TranslationCache::new(Duration::from_secs(60), true);
    let other = cache.clone();
    cache.set("key", "Hola");
    assert_eq!(other.get("key").as_deref(), Some("Hola"));
    other.delete("key");
    assert_eq!(cache.get("key"), None);
}

#[tokio::test]
async fn test_sweeper_shouldRemoveExpiredEntries() {
    let cache = TranslationCache::with_sweeper(Duration::from_millis(10), true, Duration::from_millis(20));
    cache.set("a", "1");
    cache.set("b", "2");
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(cache.size(), 0);
}
