//! Credential cache with TTL expiry and bounded capacity
//!
//! Decoding a PKCS#12 bundle runs a password KDF and several ciphers, so the
//! decoded material is memoized per `(bundle, passphrase)` pair. Keys are the
//! SHA-256 digest of `bundle || 0x00 || passphrase`; the passphrase itself is
//! never stored.
//!
//! One mutex guards lookup, sweep, eviction and insert. Decoding happens
//! outside of it, so two cold lookups for the same key may both decode; the
//! later insert wins.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::bundle::{BundleDecoder, CertificateMaterial, DecodeError};

/// Expiry and capacity settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    /// Entry lifetime; `None` disables caching entirely
    pub ttl: Option<Duration>,
    /// Maximum number of live entries (at least 1)
    pub max_entries: usize,
}

impl CachePolicy {
    /// Build a policy from configuration values.
    ///
    /// A TTL of zero or less disables caching.
    #[must_use]
    pub fn from_config(ttl_seconds: i64, max_entries: usize) -> Self {
        let ttl = u64::try_from(ttl_seconds)
            .ok()
            .filter(|s| *s > 0)
            .map(Duration::from_secs);
        Self {
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    /// Whether decoded material is retained at all
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.ttl.is_some()
    }
}

struct CacheEntry {
    material: Arc<CertificateMaterial>,
    expires_at: Instant,
}

/// Counters tracked atomically
#[derive(Debug, Default)]
struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    decodes: AtomicU64,
    evictions: AtomicU64,
    expired: AtomicU64,
}

/// Snapshot of cache statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStatsSnapshot {
    /// Whether caching is enabled
    pub enabled: bool,
    /// Lookups served from the cache
    pub hits: u64,
    /// Lookups that had to decode
    pub misses: u64,
    /// Decoder invocations (successful or not)
    pub decodes: u64,
    /// Entries removed to make room
    pub evictions: u64,
    /// Entries removed by the expiry sweep
    pub expired: u64,
    /// Current number of entries
    pub size: usize,
}

/// Memoizing front for a [`BundleDecoder`].
pub struct CredentialCache {
    decoder: Arc<dyn BundleDecoder>,
    policy: CachePolicy,
    entries: Mutex<HashMap<String, CacheEntry>>,
    stats: CacheStats,
}

impl CredentialCache {
    /// Create an empty cache
    pub fn new(decoder: Arc<dyn BundleDecoder>, policy: CachePolicy) -> Self {
        Self {
            decoder,
            policy,
            entries: Mutex::new(HashMap::new()),
            stats: CacheStats::default(),
        }
    }

    /// Return the decoded material for a bundle, decoding on a miss.
    ///
    /// Failed decodes are never cached.
    pub fn resolve(
        &self,
        bundle: &[u8],
        passphrase: &str,
    ) -> Result<Arc<CertificateMaterial>, DecodeError> {
        let Some(ttl) = self.policy.ttl else {
            return self.decode(bundle, passphrase);
        };

        let key = cache_key(bundle, passphrase);

        {
            let entries = self.entries.lock();
            if let Some(entry) = entries.get(&key) {
                if Instant::now() < entry.expires_at {
                    self.stats.hits.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %&key[..12], "Credential cache hit");
                    return Ok(Arc::clone(&entry.material));
                }
            }
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        debug!(key = %&key[..12], "Credential cache miss");
        let material = self.decode(bundle, passphrase)?;

        let now = Instant::now();
        let mut entries = self.entries.lock();

        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        let swept = before - entries.len();
        if swept > 0 {
            self.stats
                .expired
                .fetch_add(swept as u64, Ordering::Relaxed);
        }

        // A racing decode may already have inserted this key; replacing it
        // does not grow the map.
        if !entries.contains_key(&key) && entries.len() >= self.policy.max_entries {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.expires_at)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(key = %&oldest[..12], "Credential cache eviction");
            }
        }

        entries.insert(
            key,
            CacheEntry {
                material: Arc::clone(&material),
                expires_at: now + ttl,
            },
        );

        Ok(material)
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            enabled: self.policy.is_enabled(),
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            decodes: self.stats.decodes.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            expired: self.stats.expired.load(Ordering::Relaxed),
            size: self.entries.lock().len(),
        }
    }

    /// Configured policy
    #[must_use]
    pub fn policy(&self) -> CachePolicy {
        self.policy
    }

    fn decode(
        &self,
        bundle: &[u8],
        passphrase: &str,
    ) -> Result<Arc<CertificateMaterial>, DecodeError> {
        self.stats.decodes.fetch_add(1, Ordering::Relaxed);
        self.decoder.decode(bundle, passphrase).map(Arc::new)
    }
}

/// Digest key for a bundle/passphrase pair (lowercase hex SHA-256).
#[must_use]
pub fn cache_key(bundle: &[u8], passphrase: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bundle);
    hasher.update([0u8]);
    hasher.update(passphrase.as_bytes());
    hex::encode(hasher.finalize())
}
