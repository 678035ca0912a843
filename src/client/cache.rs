//! Result cache for the security client
//!
//! Entries are keyed by the full peer identity (subject and issuer) and
//! bounded twice: by the configured
//! residency TTL and by the result's own `notAfter`. A TTL-expired entry is a
//! plain miss; an entry whose credential expired is reported as such so the
//! caller can refuse instead of silently refetching.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::mtls::Identity;
use crate::token::{current_time_millis, is_expired_at};

/// Cached result with metadata
#[derive(Debug, Clone)]
struct CachedResult<T> {
    value: T,
    not_after: i64,
    cached_at: Instant,
}

/// Outcome of a cache lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<T> {
    /// Fresh entry
    Hit(T),
    /// Entry present but its credential has expired (already evicted)
    Expired,
    /// No usable entry
    Miss,
}

/// Cache statistics
#[derive(Debug, Default)]
struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl CacheStats {
    #[allow(clippy::cast_precision_loss)]
    fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let total = hits + self.misses.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

/// Identity-keyed cache of security service results
pub struct ResultCache<T> {
    entries: DashMap<Identity, CachedResult<T>>,
    ttl: Duration,
    stats: CacheStats,
}

impl<T: Clone> ResultCache<T> {
    /// Create a cache with the given residency bound
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            stats: CacheStats::default(),
        }
    }

    /// Look up an identity, evicting stale entries on the way
    pub fn get(&self, identity: &Identity) -> Lookup<T> {
        self.get_at(identity, current_time_millis())
    }

    fn get_at(&self, identity: &Identity, now_millis: i64) -> Lookup<T> {
        let Some(entry) = self.entries.get(identity) else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            return Lookup::Miss;
        };

        let credential_expired = is_expired_at(entry.not_after, now_millis);
        let resident_too_long = entry.cached_at.elapsed() > self.ttl;
        if !credential_expired && !resident_too_long {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Lookup::Hit(entry.value.clone());
        }

        // Release the read guard before removing
        drop(entry);
        self.entries.remove(identity);
        self.stats.evictions.fetch_add(1, Ordering::Relaxed);

        if credential_expired {
            Lookup::Expired
        } else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            Lookup::Miss
        }
    }

    /// Store a result with its credential expiry
    pub fn insert(&self, identity: &Identity, value: T, not_after: i64) {
        self.entries.insert(
            identity.clone(),
            CachedResult {
                value,
                not_after,
                cached_at: Instant::now(),
            },
        );
    }

    /// Drop every entry
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Evict entries whose credential or residency has expired
    pub fn evict_expired(&self) {
        let now = current_time_millis();
        let before = self.entries.len();
        self.entries.retain(|_, entry| {
            !is_expired_at(entry.not_after, now) && entry.cached_at.elapsed() <= self.ttl
        });
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            self.stats
                .evictions
                .fetch_add(removed as u64, Ordering::Relaxed);
        }
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            size: self.entries.len(),
            hit_rate: self.stats.hit_rate(),
        }
    }
}

/// Snapshot of cache statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStatsSnapshot {
    /// Total cache hits
    pub hits: u64,
    /// Total cache misses
    pub misses: u64,
    /// Total evictions
    pub evictions: u64,
    /// Current number of entries
    pub size: usize,
    /// Hit rate (0.0-1.0)
    pub hit_rate: f64,
}
