//! Insertion-ordered evicting cache.
//!
//! Entries live in a `HashMap` keyed by work key; insertion order is tracked
//! in a `VecDeque` of `(key, sequence)` pairs. Overwrites and removals leave
//! stale pairs in the queue, which are skipped when evicting and compacted
//! once they outnumber live entries. Eviction is therefore O(1) amortized.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use super::CacheConfig;
use crate::resilience::LoadShedder;

/// Host-supplied check deciding whether a stored value is still alive.
///
/// Probes run on a clone of the value with the cache lock released, so a
/// probe may itself read from the cache.
pub type LivenessProbe<V> = Arc<dyn Fn(&V) -> bool + Send + Sync>;

/// Slack kept in the order queue before compaction kicks in.
const ORDER_COMPACTION_SLACK: usize = 32;

/// A stored result and its bookkeeping.
#[derive(Debug)]
struct CacheEntry<V> {
    value: V,
    created_at: Instant,
    ttl: Option<Duration>,
    /// Insertion sequence; matches exactly one pair in the order queue.
    seq: u64,
    /// Cleared by `mark_dead`.
    alive: bool,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        match self.ttl {
            Some(ttl) => now.duration_since(self.created_at) >= ttl,
            None => false,
        }
    }
}

#[derive(Debug)]
struct CacheInner<K, V> {
    entries: HashMap<K, CacheEntry<V>>,
    order: VecDeque<(K, u64)>,
    next_seq: u64,
}

impl<K, V> CacheInner<K, V>
where
    K: Eq + Hash + Clone,
{
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity.min(4096)),
            order: VecDeque::with_capacity(capacity.min(4096)),
            next_seq: 0,
        }
    }

    /// Remove the oldest live entry, returning its key.
    fn evict_oldest(&mut self) -> Option<K> {
        while let Some((key, seq)) = self.order.pop_front() {
            let current = self.entries.get(&key).map(|entry| entry.seq);
            if current == Some(seq) {
                self.entries.remove(&key);
                return Some(key);
            }
        }
        None
    }

    /// Remove `key` only if it still holds the entry written as `seq`.
    fn remove_if_current(&mut self, key: &K, seq: u64) -> bool {
        if self.entries.get(key).map(|entry| entry.seq) == Some(seq) {
            self.entries.remove(key);
            true
        } else {
            false
        }
    }

    fn compact_order(&mut self) {
        if self.order.len() <= self.entries.len() * 2 + ORDER_COMPACTION_SLACK {
            return;
        }
        let entries = &self.entries;
        self.order
            .retain(|(key, seq)| entries.get(key).map(|e| e.seq) == Some(*seq));
    }
}

/// Counters for cache observability.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Entries removed by capacity pressure or load shedding.
    pub evictions: u64,
    /// Entries removed because their TTL elapsed or they lost liveness.
    pub expirations: u64,
    pub entries: usize,
    pub capacity: usize,
}

impl CacheStats {
    /// `hits / (hits + misses)`, or `0.0` with no accesses.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Result of a bulk [`EvictingCache::cleanup`] pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CleanupReport {
    /// Entries whose TTL had elapsed.
    pub expired: usize,
    /// Entries marked dead or rejected by the liveness probe.
    pub dead: usize,
    /// Entries left afterwards.
    pub remaining: usize,
}

impl CleanupReport {
    /// Total entries removed.
    pub fn removed(&self) -> usize {
        self.expired + self.dead
    }
}

impl fmt::Display for CleanupReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cleanup: {} expired, {} dead, {} remaining",
            self.expired, self.dead, self.remaining
        )
    }
}

/// Bounded key/value store with TTL, liveness and hit/miss accounting.
///
/// All methods take `&self`; the entry map sits behind a `parking_lot`
/// mutex that is never held across an `.await`, and counters are atomics.
pub struct EvictingCache<K, V> {
    inner: Mutex<CacheInner<K, V>>,
    capacity: usize,
    default_ttl: Option<Duration>,
    liveness: Option<LivenessProbe<V>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl<K, V> fmt::Debug for EvictingCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvictingCache")
            .field("capacity", &self.capacity)
            .field("default_ttl", &self.default_ttl)
            .field("has_liveness_probe", &self.liveness.is_some())
            .finish_non_exhaustive()
    }
}

impl<K, V> EvictingCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create a cache from configuration.
    ///
    /// A zero capacity is raised to 1 so that `set` followed by `get` always
    /// works; [`crate::config::EngineConfig::validate`] rejects it earlier.
    pub fn new(config: &CacheConfig) -> Self {
        let capacity = config.capacity.max(1);
        Self {
            inner: Mutex::new(CacheInner::new(capacity)),
            capacity,
            default_ttl: config.default_ttl,
            liveness: None,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    /// Cache with the given capacity and no TTL.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::new(&CacheConfig::with_capacity(capacity))
    }

    /// Attach a liveness probe consulted on every `get` and `cleanup`.
    pub fn with_liveness(mut self, probe: LivenessProbe<V>) -> Self {
        self.liveness = Some(probe);
        self
    }

    fn probe_passes(&self, value: &V) -> bool {
        self.liveness.as_ref().map_or(true, |probe| probe(value))
    }

    /// Look up a value.
    ///
    /// Expired or dead entries count as a miss and are removed on the spot.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let lookup = inner.entries.get(key).map(|entry| {
            if !entry.is_expired(now) && entry.alive {
                Ok((entry.value.clone(), entry.seq))
            } else {
                Err(entry.seq)
            }
        });
        drop(inner);

        let stale = match lookup {
            None => None,
            Some(Err(seq)) => Some(seq),
            Some(Ok((value, seq))) => {
                if self.probe_passes(&value) {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(value);
                }
                Some(seq)
            }
        };

        if let Some(seq) = stale {
            if self.inner.lock().remove_if_current(key, seq) {
                self.expirations.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Check presence without touching hit/miss counters or removing
    /// stale entries.
    pub fn contains(&self, key: &K) -> bool {
        self.inner.lock().entries.contains_key(key)
    }

    /// Insert or overwrite using the default TTL.
    ///
    /// Returns the key evicted to make room, if any.
    pub fn set(&self, key: K, value: V) -> Option<K> {
        self.set_with_ttl(key, value, self.default_ttl)
    }

    /// Insert or overwrite with an explicit TTL (`None` = no expiry).
    ///
    /// An overwrite restarts the TTL clock and moves the key to the newest
    /// insertion position. At most one entry is evicted per call.
    pub fn set_with_ttl(&self, key: K, value: V, ttl: Option<Duration>) -> Option<K> {
        let mut inner = self.inner.lock();

        let seq = inner.next_seq;
        inner.next_seq += 1;

        inner.entries.insert(
            key.clone(),
            CacheEntry {
                value,
                created_at: Instant::now(),
                ttl,
                seq,
                alive: true,
            },
        );
        inner.order.push_back((key, seq));

        let evicted = if inner.entries.len() > self.capacity {
            inner.evict_oldest()
        } else {
            None
        };
        inner.compact_order();
        drop(inner);

        if evicted.is_some() {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        evicted
    }

    /// Remove a key. Returns whether it was present.
    pub fn delete(&self, key: &K) -> bool {
        let mut inner = self.inner.lock();
        let removed = inner.entries.remove(key).is_some();
        inner.compact_order();
        removed
    }

    /// Mark an entry as no longer alive.
    ///
    /// The entry stays in place until the next `get` or `cleanup` removes it.
    /// This is the portable substitute for weak-reference liveness.
    pub fn mark_dead(&self, key: &K) -> bool {
        match self.inner.lock().entries.get_mut(key) {
            Some(entry) => {
                entry.alive = false;
                true
            }
            None => false,
        }
    }

    /// Remove every expired or dead entry.
    pub fn cleanup(&self) -> CleanupReport {
        let now = Instant::now();
        let mut report = CleanupReport::default();
        let mut inner = self.inner.lock();

        inner.entries.retain(|_, entry| {
            if entry.is_expired(now) {
                report.expired += 1;
                false
            } else if !entry.alive {
                report.dead += 1;
                false
            } else {
                true
            }
        });
        let candidates: Vec<(K, u64, V)> = if self.liveness.is_some() {
            inner
                .entries
                .iter()
                .map(|(key, entry)| (key.clone(), entry.seq, entry.value.clone()))
                .collect()
        } else {
            Vec::new()
        };
        drop(inner);

        let rejected: Vec<(K, u64)> = candidates
            .into_iter()
            .filter(|(_, _, value)| !self.probe_passes(value))
            .map(|(key, seq, _)| (key, seq))
            .collect();

        let mut inner = self.inner.lock();
        for (key, seq) in &rejected {
            if inner.remove_if_current(key, *seq) {
                report.dead += 1;
            }
        }
        inner.compact_order();
        report.remaining = inner.entries.len();
        drop(inner);

        self.expirations
            .fetch_add(report.removed() as u64, Ordering::Relaxed);
        if report.removed() > 0 {
            tracing::debug!(
                expired = report.expired,
                dead = report.dead,
                remaining = report.remaining,
                "Cache cleanup"
            );
        }
        report
    }

    /// Evict the oldest `fraction` of entries (rounded up).
    pub fn shed_oldest(&self, fraction: f64) -> usize {
        let fraction = fraction.clamp(0.0, 1.0);
        let mut inner = self.inner.lock();
        let target = (inner.entries.len() as f64 * fraction).ceil() as usize;

        let mut shed = 0;
        while shed < target && inner.evict_oldest().is_some() {
            shed += 1;
        }
        drop(inner);

        self.evictions.fetch_add(shed as u64, Ordering::Relaxed);
        shed
    }

    /// Drop every entry. Counters are kept.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.order.clear();
    }

    /// `hits / (hits + misses)`, `0.0` before any access.
    pub fn hit_rate(&self) -> f64 {
        self.stats().hit_rate()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            entries: self.len(),
            capacity: self.capacity,
        }
    }
}

impl<K, V> LoadShedder for EvictingCache<K, V>
where
    K: Eq + Hash + Clone + Send,
    V: Clone + Send,
{
    fn name(&self) -> &str {
        "result_cache"
    }

    fn shed(&self, fraction: f64) -> usize {
        self.shed_oldest(fraction)
    }
}
