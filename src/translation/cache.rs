/*!
 * Translation caching functionality.
 *
 * A content-addressed, TTL-bounded store from request fingerprints to prior
 * translations. Reads share a read lock; writes are exclusive. Expired
 * entries are invisible immediately and physically removed by the sweeper.
 */

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use log::debug;
use parking_lot::RwLock;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;

/// Separator between fingerprint fields (ASCII unit separator)
const FIELD_SEPARATOR: u8 = 0x1F;

/// Default sweep interval
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// The request fields that identify a translation for caching
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Source text to translate
    pub text: String,

    /// Role of the text in the book ("Book title", "Section content", ...)
    pub context_hint: String,

    /// Stable provider identifier
    pub provider: String,

    /// Model name
    pub model: String,
}

impl CacheKey {
    pub fn new(text: &str, context_hint: &str, provider: &str, model: &str) -> Self {
        Self {
            text: text.to_string(),
            context_hint: context_hint.to_string(),
            provider: provider.to_string(),
            model: model.to_string(),
        }
    }

    /// SHA-256 over `text 0x1F context_hint 0x1F provider 0x1F model`, hex encoded
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.text, &self.context_hint, &self.provider, &self.model)
    }
}

/// Build the request fingerprint without allocating a `CacheKey`
pub fn fingerprint(text: &str, context_hint: &str, provider: &str, model: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hasher.update([FIELD_SEPARATOR]);
    hasher.update(context_hint.as_bytes());
    hasher.update([FIELD_SEPARATOR]);
    hasher.update(provider.as_bytes());
    hasher.update([FIELD_SEPARATOR]);
    hasher.update(model.as_bytes());
    hex::encode(hasher.finalize())
}

/// Hash an arbitrary cache key to a fixed-width (64 hex chars) index key
pub fn hash_key(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now > self.expires_at
    }
}

/// Snapshot of cache occupancy
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub total: usize,
    pub valid: usize,
    pub expired: usize,
    pub enabled: bool,
    pub ttl_secs: u64,
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

struct CacheInner {
    entries: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
    enabled: bool,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheInner {
    fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        before - entries.len()
    }
}

/// Translation cache shared between coordinators
#[derive(Clone)]
pub struct TranslationCache {
    inner: Arc<CacheInner>,
}

impl TranslationCache {
    pub fn new(ttl: Duration, enabled: bool) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                entries: RwLock::new(HashMap::new()),
                ttl,
                enabled,
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
            }),
        }
    }

    /// Create a cache and start its background sweeper on the current runtime
    pub fn with_sweeper(ttl: Duration, enabled: bool, interval: Duration) -> Self {
        let cache = Self::new(ttl, enabled);
        if enabled {
            cache.spawn_sweeper(interval);
        }
        cache
    }

    /// Start the periodic sweeper. The task ends once every handle to the
    /// cache has been dropped.
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<CacheInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                let removed = inner.purge_expired();
                if removed > 0 {
                    debug!("Cache sweeper removed {} expired entries", removed);
                }
            }
        })
    }

    pub fn get(&self, key: &str) -> Option<String> {
        if !self.inner.enabled {
            return None;
        }
        let hashed = hash_key(key);
        let entries = self.inner.entries.read();
        match entries.get(&hashed) {
            Some(entry) if !entry.is_expired(Instant::now()) => {
                self.inner.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value.clone())
            }
            _ => {
                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store a value; replaces any previous entry for the key
    pub fn set(&self, key: &str, value: &str) {
        if !self.inner.enabled {
            return;
        }
        let entry = CacheEntry {
            value: value.to_string(),
            expires_at: Instant::now() + self.inner.ttl,
        };
        self.inner.entries.write().insert(hash_key(key), entry);
    }

    pub fn delete(&self, key: &str) {
        if !self.inner.enabled {
            return;
        }
        self.inner.entries.write().remove(&hash_key(key));
    }

    pub fn clear(&self) {
        self.inner.entries.write().clear();
        self.inner.hits.store(0, Ordering::Relaxed);
        self.inner.misses.store(0, Ordering::Relaxed);
        debug!("Translation cache cleared");
    }

    /// Raw entry count, including expired entries not yet swept
    pub fn size(&self) -> usize {
        self.inner.entries.read().len()
    }

    /// Remove expired entries now, returning how many were dropped
    pub fn purge_expired(&self) -> usize {
        self.inner.purge_expired()
    }

    pub fn stats(&self) -> CacheStats {
        let now = Instant::now();
        let entries = self.inner.entries.read();
        let expired = entries.values().filter(|e| e.is_expired(now)).count();
        CacheStats {
            total: entries.len(),
            valid: entries.len() - expired,
            expired,
            enabled: self.inner.enabled,
            ttl_secs: self.inner.ttl.as_secs(),
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled
    }

    pub fn ttl(&self) -> Duration {
        self.inner.ttl
    }
}

impl Default for TranslationCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(24 * 60 * 60), true)
    }
}

impl std::fmt::Debug for TranslationCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranslationCache")
            .field("enabled", &self.inner.enabled)
            .field("ttl", &self.inner.ttl)
            .field("size", &self.size())
            .finish()
    }
}
