//! Size-bounded TTL store
//!
//! Entries live in insertion order. When the summed entry size exceeds the
//! budget, the earliest-inserted entries are evicted first. Re-setting a key
//! moves it to the back. Expired entries are kept until pruned or evicted so
//! callers can serve them while a refresh is in flight.

use crate::error::CacheError;
use crate::pattern::KeyPattern;
use crate::policy::{CachePriority, TtlPolicy};
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Default size budget: 50 MiB
pub const DEFAULT_MAX_SIZE: usize = 50 * 1024 * 1024;

/// Function measuring the size of a value in bytes
pub type Sizer<V> = Arc<dyn Fn(&V) -> usize + Send + Sync>;

/// One cached value
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    /// Key
    pub key: String,
    /// Value
    pub value: V,
    /// Write time
    pub stored_at: Instant,
    /// Freshness window
    pub ttl: Duration,
    /// Measured size in bytes
    pub size: usize,
}

impl<V> CacheEntry<V> {
    /// Age at `now`
    #[must_use]
    pub fn age_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.stored_at)
    }

    /// Fresh iff strictly younger than the TTL
    #[must_use]
    pub fn is_fresh_at(&self, now: Instant) -> bool {
        self.age_at(now) < self.ttl
    }

    /// Instant the entry turns stale
    #[must_use]
    pub fn expires_at(&self) -> Instant {
        self.stored_at + self.ttl
    }
}

/// Freshness of a lookup result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Freshness {
    /// Within TTL
    Fresh,
    /// Past TTL but still held
    Stale,
}

/// Lookup result with freshness and age
#[derive(Debug, Clone, PartialEq)]
pub struct CacheLookup<V> {
    /// Cached value
    pub value: V,
    /// Freshness at lookup time
    pub freshness: Freshness,
    /// Age at lookup time
    pub age: Duration,
}

impl<V> CacheLookup<V> {
    /// Whether the value is within TTL
    #[inline]
    #[must_use]
    pub fn is_fresh(&self) -> bool {
        self.freshness == Freshness::Fresh
    }
}

/// Store counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    /// Lookups that found a fresh value
    pub hits: u64,
    /// Lookups that found only a stale value
    pub stale_hits: u64,
    /// Lookups that found nothing
    pub misses: u64,
    /// Entries removed to satisfy the size budget
    pub evictions: u64,
    /// Entries currently held
    pub entries: usize,
    /// Summed entry size
    pub total_size: usize,
    /// Size budget
    pub max_size: usize,
}

impl CacheStats {
    /// Fresh hits over all lookups
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.stale_hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let rate = self.hits as f64 / total as f64;
        rate
    }
}

struct Inner<V> {
    entries: IndexMap<String, CacheEntry<V>>,
    total_size: usize,
    hits: u64,
    stale_hits: u64,
    misses: u64,
    evictions: u64,
}

/// TTL cache with priority tiers and a size budget
pub struct CacheStore<V> {
    inner: Mutex<Inner<V>>,
    policy: RwLock<TtlPolicy>,
    max_size: usize,
    sizer: Sizer<V>,
}

impl<V: Serialize + 'static> CacheStore<V> {
    /// Store sizing values by their JSON length.
    ///
    /// # Errors
    /// `CacheError::ZeroBudget` for a zero budget
    pub fn new(max_size: usize, policy: TtlPolicy) -> Result<Self, CacheError> {
        Self::with_sizer(max_size, policy, Arc::new(json_size::<V>))
    }
}

impl<V> CacheStore<V> {
    /// Store with a custom size function.
    ///
    /// # Errors
    /// `CacheError::ZeroBudget` for a zero budget
    pub fn with_sizer(max_size: usize, policy: TtlPolicy, sizer: Sizer<V>) -> Result<Self, CacheError> {
        if max_size == 0 {
            return Err(CacheError::ZeroBudget);
        }
        Ok(Self {
            inner: Mutex::new(Inner {
                entries: IndexMap::new(),
                total_size: 0,
                hits: 0,
                stale_hits: 0,
                misses: 0,
                evictions: 0,
            }),
            policy: RwLock::new(policy),
            max_size,
            sizer,
        })
    }

    /// Insert or replace `key`; returns the keys evicted to stay in budget.
    ///
    /// `ttl` overrides the TTL resolved from the key's priority.
    pub fn set(&self, key: impl Into<String>, value: V, ttl: Option<Duration>) -> Vec<String> {
        let key = key.into();
        let ttl = self.policy.read().ttl_for(&key, ttl);
        let size = (self.sizer)(&value);
        let entry = CacheEntry {
            key: key.clone(),
            value,
            stored_at: Instant::now(),
            ttl,
            size,
        };

        let mut inner = self.inner.lock();
        if let Some(previous) = inner.entries.shift_remove(&key) {
            inner.total_size -= previous.size;
        }
        inner.total_size += size;
        inner.entries.insert(key.clone(), entry);
        trace!(key = %key, size, ttl_ms = ttl.as_millis(), "cache set");

        let mut evicted = Vec::new();
        while inner.total_size > self.max_size {
            let Some((old_key, old)) = inner.entries.shift_remove_index(0) else {
                break;
            };
            inner.total_size -= old.size;
            inner.evictions += 1;
            evicted.push(old_key);
        }
        if !evicted.is_empty() {
            debug!(count = evicted.len(), total_size = inner.total_size, "cache evicted entries");
        }
        evicted
    }

    /// Remove one key
    pub fn remove(&self, key: &str) -> Option<V> {
        let mut inner = self.inner.lock();
        let entry = inner.entries.shift_remove(key)?;
        inner.total_size -= entry.size;
        Some(entry.value)
    }

    /// Remove every key matching `pattern`; returns the count removed.
    /// An empty pattern removes nothing.
    pub fn invalidate(&self, pattern: &str) -> usize {
        let Ok(pattern) = KeyPattern::parse(pattern) else {
            return 0;
        };
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        let mut freed = 0;
        inner.entries.retain(|key, entry| {
            let keep = !pattern.matches(key);
            if !keep {
                freed += entry.size;
            }
            keep
        });
        inner.total_size -= freed;
        let removed = before - inner.entries.len();
        debug!(pattern = %pattern, removed, "cache invalidated");
        removed
    }

    /// Drop entries past their TTL; returns the count removed
    pub fn prune_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        let mut freed = 0;
        inner.entries.retain(|_, entry| {
            let keep = entry.is_fresh_at(now);
            if !keep {
                freed += entry.size;
            }
            keep
        });
        inner.total_size -= freed;
        before - inner.entries.len()
    }

    /// Remove everything; returns the count removed
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let removed = inner.entries.len();
        inner.entries.clear();
        inner.total_size = 0;
        removed
    }

    /// Whether `key` is held, fresh or stale
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().entries.contains_key(key)
    }

    /// Keys in insertion order
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.inner.lock().entries.keys().cloned().collect()
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// No entries held
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Summed entry size
    #[must_use]
    pub fn total_size(&self) -> usize {
        self.inner.lock().total_size
    }

    /// Size budget
    #[inline]
    #[must_use]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Counter snapshot
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            hits: inner.hits,
            stale_hits: inner.stale_hits,
            misses: inner.misses,
            evictions: inner.evictions,
            entries: inner.entries.len(),
            total_size: inner.total_size,
            max_size: self.max_size,
        }
    }

    /// Declare the priority of a key or `*` pattern for later writes.
    ///
    /// # Errors
    /// `CacheError::EmptyPattern` for an empty pattern
    pub fn declare_priority(&self, pattern: &str, priority: CachePriority) -> Result<(), CacheError> {
        self.policy.write().declare(pattern, priority)
    }

    /// Priority `key` resolves to
    #[must_use]
    pub fn priority_for(&self, key: &str) -> CachePriority {
        self.policy.read().priority_for(key)
    }

    /// TTL a write of `key` would get
    #[must_use]
    pub fn ttl_for(&self, key: &str, explicit: Option<Duration>) -> Duration {
        self.policy.read().ttl_for(key, explicit)
    }

    /// Poll interval of a tier
    #[must_use]
    pub fn poll_interval(&self, priority: CachePriority) -> Option<Duration> {
        self.policy.read().poll_interval(priority)
    }
}

impl<V: Clone> CacheStore<V> {
    /// Value for `key`, fresh or stale
    #[must_use]
    pub fn get(&self, key: &str) -> Option<V> {
        self.lookup(key).map(|hit| hit.value)
    }

    /// Value for `key` only when within TTL
    #[must_use]
    pub fn get_fresh(&self, key: &str) -> Option<V> {
        self.lookup(key).filter(CacheLookup::is_fresh).map(|hit| hit.value)
    }

    /// Value with freshness and age
    #[must_use]
    pub fn lookup(&self, key: &str) -> Option<CacheLookup<V>> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let hit = inner.entries.get(key).map(|entry| CacheLookup {
            value: entry.value.clone(),
            freshness: if entry.is_fresh_at(now) {
                Freshness::Fresh
            } else {
                Freshness::Stale
            },
            age: entry.age_at(now),
        });
        match &hit {
            Some(h) if h.is_fresh() => inner.hits += 1,
            Some(_) => inner.stale_hits += 1,
            None => inner.misses += 1,
        }
        hit
    }

    /// Full entry for `key`
    #[must_use]
    pub fn entry(&self, key: &str) -> Option<CacheEntry<V>> {
        self.inner.lock().entries.get(key).cloned()
    }
}

impl<V> std::fmt::Debug for CacheStore<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CacheStore")
            .field("entries", &inner.entries.len())
            .field("total_size", &inner.total_size)
            .field("max_size", &self.max_size)
            .finish_non_exhaustive()
    }
}

fn json_size<V: Serialize>(value: &V) -> usize {
    serde_json::to_vec(value).map_or(0, |bytes| bytes.len())
}
