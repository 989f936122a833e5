//! Second-level cache trait and statistics.
//!
//! This module defines the contract every second-level cache backend
//! implements, plus the generation marker that lets loaders populate the
//! cache without racing concurrent invalidations.

use cachet_core::{CacheResult, Namespace, Predicate, Record, RecordKey};
use std::collections::HashMap;

use super::entry::CacheEntry;

/// Invalidation generation of one cache namespace.
///
/// Every eviction, clear or write-through replacement in a namespace moves
/// its generation forward. Generations never repeat for the lifetime of a
/// cache instance, including across `shutdown`/`init` cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Generation(pub u64);

impl Generation {
    /// Raw sequence value.
    pub fn value(&self) -> u64 {
        self.0
    }
}

/// Process-wide, cross-transaction record cache.
///
/// Implementations must be thread-safe. Every single-key `put` and `evict`
/// is atomic; batch operations are atomic per namespace.
///
/// # Availability
///
/// A cache that is shut down answers every call with
/// [`CacheError::Unavailable`](cachet_core::CacheError::Unavailable).
/// Callers treat that as "store-only mode": reads miss, writes skip the
/// cache.
pub trait SecondLevelCache: Send + Sync {
    /// Get a cached record.
    fn get(&self, namespace: &Namespace, key: &RecordKey) -> CacheResult<Option<Record>>;

    /// Get a cached entry with its version and cache time.
    fn get_entry(&self, namespace: &Namespace, key: &RecordKey)
        -> CacheResult<Option<CacheEntry>>;

    /// Probe many keys at once. Only hits are returned.
    fn get_many(
        &self,
        namespace: &Namespace,
        keys: &[RecordKey],
    ) -> CacheResult<HashMap<RecordKey, Record>>;

    /// Unconditionally cache `record` under `key`, replacing any entry.
    ///
    /// This is a write-through replacement and advances the generation.
    fn put(&self, namespace: &Namespace, key: RecordKey, record: Record) -> CacheResult<()>;

    /// Populate the cache with freshly fetched records.
    ///
    /// Nothing is inserted unless the namespace generation still equals
    /// `observed`. Returns the number of records inserted.
    fn put_batch(
        &self,
        namespace: &Namespace,
        records: Vec<Record>,
        observed: Generation,
    ) -> CacheResult<usize>;

    /// Evict one entry. Returns whether an entry was present.
    fn evict(&self, namespace: &Namespace, key: &RecordKey) -> CacheResult<bool>;

    /// Evict many entries. Returns the keys that were present.
    fn evict_many(&self, namespace: &Namespace, keys: &[RecordKey]) -> CacheResult<Vec<RecordKey>>;

    /// Evict every cached record the predicate matches.
    ///
    /// Predicates that cannot be evaluated in-process clear the namespace.
    fn evict_where(
        &self,
        namespace: &Namespace,
        predicate: &Predicate,
    ) -> CacheResult<Vec<RecordKey>>;

    /// Drop every entry of a namespace. Returns how many were dropped.
    fn clear(&self, namespace: &Namespace) -> CacheResult<usize>;

    /// Number of entries in a namespace.
    fn size(&self, namespace: &Namespace) -> CacheResult<usize>;

    /// Current invalidation generation of a namespace.
    fn generation(&self, namespace: &Namespace) -> CacheResult<Generation>;

    /// Cached keys of a namespace, in key order.
    fn keys(&self, namespace: &Namespace) -> CacheResult<Vec<RecordKey>>;

    /// Namespaces that currently have a region.
    fn namespaces(&self) -> CacheResult<Vec<Namespace>>;

    /// Get cache statistics.
    fn stats(&self) -> CacheResult<CacheStats>;
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of entries currently in cache.
    pub entry_count: u64,
    /// Number of evictions due to capacity.
    pub evictions: u64,
    /// Number of batch populations dropped because the generation moved.
    pub stale_populations: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_stats_hit_rate() {
        let stats = CacheStats {
            hits: 80,
            misses: 20,
            ..Default::default()
        };
        assert!((stats.hit_rate() - 0.8).abs() < 0.001);

        let empty_stats = CacheStats::default();
        assert!((empty_stats.hit_rate() - 0.0).abs() < 0.001);
    }

    #[test]
    fn test_generation_order() {
        assert!(Generation(2) > Generation(1));
        assert_eq!(Generation::default().value(), 0);
    }
}
