//! Write-through invalidation.
//!
//! Every mutation goes to the store first. Only after the store write
//! succeeds is the cache brought in line, before the call returns, so a
//! cached entry is never older than the last committed write to its key.
//!
//! Writes to the same key are serialized from the store write through the
//! cache step. Bulk deletes hold their namespace exclusively.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use cachet_core::{
    CacheError, CacheResult, CachetConfig, CachetError, CachetResult, Namespace, Predicate,
    Record, RecordKey, UpdatePolicy,
};

use crate::cache::{SecondLevelCache, UpdateWatermarks};
use crate::stats::Statistics;
use crate::BackingStore;

/// What a bulk delete did to the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvictionScope {
    /// Exactly these cached keys were evicted.
    Keys(Vec<RecordKey>),
    /// The deleted keys were unknown, so the whole namespace was cleared.
    Namespace { evicted: usize },
    /// The cache was unavailable; nothing was cached to evict.
    Skipped,
}

/// Result of a bulk delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkDeleteOutcome {
    /// Rows the store removed.
    pub deleted: u64,
    pub evicted: EvictionScope,
}

const NAMESPACE_STRIPES: usize = 16;
const KEY_STRIPES: usize = 64;

/// Striped write locks.
///
/// A single-key write holds its namespace stripe shared and its key stripe
/// exclusively; a bulk delete holds its namespace stripe exclusively.
/// Stripes are always taken namespace first.
#[derive(Debug)]
struct WriteLocks {
    namespaces: Vec<RwLock<()>>,
    keys: Vec<Mutex<()>>,
}

type KeyGuard<'a> = (RwLockReadGuard<'a, ()>, MutexGuard<'a, ()>);

impl WriteLocks {
    fn new() -> Self {
        Self {
            namespaces: (0..NAMESPACE_STRIPES).map(|_| RwLock::new(())).collect(),
            keys: (0..KEY_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    fn stripe(value: impl Hash, stripes: usize) -> usize {
        let mut hasher = DefaultHasher::new();
        value.hash(&mut hasher);
        (hasher.finish() % stripes as u64) as usize
    }

    // The guarded data is `()`, so a poisoned stripe is still usable.
    fn key(&self, namespace: &Namespace, key: &RecordKey) -> KeyGuard<'_> {
        let shared = self.namespaces[Self::stripe(namespace, NAMESPACE_STRIPES)]
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let exclusive = self.keys[Self::stripe((namespace, key), KEY_STRIPES)]
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        (shared, exclusive)
    }

    fn namespace(&self, namespace: &Namespace) -> RwLockWriteGuard<'_, ()> {
        self.namespaces[Self::stripe(namespace, NAMESPACE_STRIPES)]
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Applies writes to the store and synchronously updates the cache.
///
/// Clones share their write locks; independently constructed invalidators
/// over the same cache do not.
pub struct WriteThroughInvalidator<S: ?Sized, C: ?Sized> {
    store: Arc<S>,
    cache: Arc<C>,
    stats: Arc<Statistics>,
    watermarks: Arc<UpdateWatermarks>,
    locks: Arc<WriteLocks>,
    policy: UpdatePolicy,
}

impl<S: ?Sized, C: ?Sized> Clone for WriteThroughInvalidator<S, C> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            cache: Arc::clone(&self.cache),
            stats: Arc::clone(&self.stats),
            watermarks: Arc::clone(&self.watermarks),
            locks: Arc::clone(&self.locks),
            policy: self.policy,
        }
    }
}

impl<S, C> WriteThroughInvalidator<S, C>
where
    S: BackingStore + ?Sized,
    C: SecondLevelCache + ?Sized,
{
    /// Create an invalidator with the default update policy.
    pub fn new(
        store: Arc<S>,
        cache: Arc<C>,
        stats: Arc<Statistics>,
        watermarks: Arc<UpdateWatermarks>,
    ) -> Self {
        Self {
            store,
            cache,
            stats,
            watermarks,
            locks: Arc::new(WriteLocks::new()),
            policy: UpdatePolicy::default(),
        }
    }

    /// Set the update policy.
    pub fn with_policy(mut self, policy: UpdatePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Apply the update policy from configuration.
    pub fn with_config(self, config: &CachetConfig) -> Self {
        self.with_policy(config.update_policy)
    }

    pub fn policy(&self) -> UpdatePolicy {
        self.policy
    }

    /// Write an updated record through to store and cache.
    ///
    /// `record.key` must equal `key`; a mismatch is rejected before the
    /// store is touched.
    pub fn on_update(&self, namespace: &Namespace, key: &RecordKey, record: Record) -> CachetResult<()> {
        if record.key != *key {
            return Err(CachetError::KeyMismatch {
                namespace: namespace.clone(),
                expected: key.clone(),
                found: record.key,
            });
        }

        let _guard = self.locks.key(namespace, key);
        Statistics::incr(&self.stats.statement);
        self.store.update(namespace, &record)?;
        Statistics::incr(&self.stats.entity_update);

        self.advance(namespace, key)?;
        self.refresh(namespace, record)?;
        tracing::debug!(namespace = %namespace, key = %key, policy = ?self.policy, "Update written through");
        Ok(())
    }

    /// Insert a new record into the store and warm the cache.
    pub fn on_insert(&self, namespace: &Namespace, record: Record) -> CachetResult<()> {
        let _guard = self.locks.key(namespace, &record.key);
        Statistics::incr(&self.stats.statement);
        self.store.insert(namespace, &record)?;
        Statistics::incr(&self.stats.entity_insert);

        let key = record.key.clone();
        self.advance(namespace, &key)?;
        self.refresh(namespace, record)?;
        tracing::debug!(namespace = %namespace, key = %key, "Insert written through");
        Ok(())
    }

    /// Delete one record and evict its cache entry.
    ///
    /// Returns whether the store held the record. Evicting a key that is
    /// not cached is a no-op.
    pub fn on_delete(&self, namespace: &Namespace, key: &RecordKey) -> CachetResult<bool> {
        let _guard = self.locks.key(namespace, key);
        Statistics::incr(&self.stats.statement);
        let existed = self.store.delete(namespace, key)?;
        if existed {
            Statistics::incr(&self.stats.entity_delete);
        }

        self.advance(namespace, key)?;
        let evicted = self
            .cache_step(namespace, key, self.cache.evict(namespace, key))?
            .unwrap_or(false);
        tracing::debug!(namespace = %namespace, key = %key, existed, evicted, "Delete written through");
        Ok(existed)
    }

    /// Delete every record the predicate selects and evict accordingly.
    ///
    /// - key-equality predicates evict exactly their keys
    /// - other evaluable predicates evict the cached records they match,
    ///   plus any keys the store reports
    /// - native statements evict the keys the store reports, or clear the
    ///   whole namespace when it reports none
    pub fn on_bulk_delete(
        &self,
        namespace: &Namespace,
        predicate: &Predicate,
    ) -> CachetResult<BulkDeleteOutcome> {
        let _guard = self.locks.namespace(namespace);
        Statistics::incr(&self.stats.statement);
        let outcome = self.store.delete_where(namespace, predicate)?;
        Statistics::add(&self.stats.bulk_delete_rows, outcome.count);

        let target = Target::Predicate(predicate);
        self.advance(namespace, &target)?;

        let scope = if let Some(keys) = predicate.resolved_keys() {
            let keys: Vec<RecordKey> = keys.into_iter().collect();
            self.cache_step(namespace, &target, self.cache.evict_many(namespace, &keys))?
                .map(EvictionScope::Keys)
        } else if predicate.is_evaluable() {
            self.evict_matching(namespace, predicate, outcome.keys.as_deref())?
                .map(EvictionScope::Keys)
        } else if let Some(keys) = outcome.keys.as_deref() {
            self.cache_step(namespace, &target, self.cache.evict_many(namespace, keys))?
                .map(EvictionScope::Keys)
        } else {
            tracing::info!(
                namespace = %namespace,
                predicate = %predicate,
                "Deleted keys unknown, clearing namespace"
            );
            self.cache_step(namespace, &Target::Namespace, self.cache.clear(namespace))?
                .map(|evicted| EvictionScope::Namespace { evicted })
        };
        let evicted = scope.unwrap_or(EvictionScope::Skipped);

        tracing::info!(
            namespace = %namespace,
            predicate = %predicate,
            deleted = outcome.count,
            evicted = ?evicted,
            "Bulk delete written through"
        );
        Ok(BulkDeleteOutcome {
            deleted: outcome.count,
            evicted,
        })
    }

    /// Evict cached records matching `predicate`, unioned with `reported`.
    fn evict_matching(
        &self,
        namespace: &Namespace,
        predicate: &Predicate,
        reported: Option<&[RecordKey]>,
    ) -> CachetResult<Option<Vec<RecordKey>>> {
        let target = Target::Predicate(predicate);
        let Some(matched) =
            self.cache_step(namespace, &target, self.cache.evict_where(namespace, predicate))?
        else {
            return Ok(None);
        };
        let mut evicted: BTreeSet<RecordKey> = matched.into_iter().collect();
        if let Some(reported) = reported {
            if let Some(extra) =
                self.cache_step(namespace, &target, self.cache.evict_many(namespace, reported))?
            {
                evicted.extend(extra);
            }
        }
        Ok(Some(evicted.into_iter().collect()))
    }

    /// Replace or evict the entry of a freshly written record.
    fn refresh(&self, namespace: &Namespace, record: Record) -> CachetResult<()> {
        let key = record.key.clone();
        let result = match self.policy {
            UpdatePolicy::Replace => self.cache.put(namespace, key.clone(), record),
            UpdatePolicy::Evict => self.cache.evict(namespace, &key).map(|_| ()),
        };
        self.cache_step(namespace, &key, result)?;
        Ok(())
    }

    fn advance(&self, namespace: &Namespace, target: &dyn fmt::Display) -> CachetResult<()> {
        self.cache_step(namespace, target, self.watermarks.advance(namespace))?;
        Ok(())
    }

    /// Interpret the result of a cache step that follows a store write.
    ///
    /// An unavailable cache holds nothing and is skipped. Any other failure
    /// means the cache may now disagree with the store.
    fn cache_step<T>(
        &self,
        namespace: &Namespace,
        target: &dyn fmt::Display,
        result: CacheResult<T>,
    ) -> CachetResult<Option<T>> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(CacheError::Unavailable) => {
                tracing::debug!(namespace = %namespace, target = %target, "Cache unavailable, write applied to store only");
                Ok(None)
            }
            Err(e) => {
                tracing::error!(namespace = %namespace, target = %target, error = %e, "Cache invalidation failed after store write");
                Err(CachetError::InvalidationFailed {
                    namespace: namespace.clone(),
                    target: target.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }
}

/// Display form of what an invalidation was aimed at.
enum Target<'a> {
    Predicate(&'a Predicate),
    Namespace,
}

impl fmt::Display for Target<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Predicate(predicate) => write!(f, "{}", predicate),
            Self::Namespace => f.write_str("*"),
        }
    }
}
