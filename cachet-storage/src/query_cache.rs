//! Key-list query result cache.
//!
//! Cached results are ordered key lists, never records. Hits are
//! materialized through the [`BatchedLoader`], so record-level changes and
//! deletes show up without touching the query cache. Membership changes
//! (inserts, bulk deletes) are caught by the update watermarks of every
//! namespace a query reads.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use cachet_core::{
    CacheError, CachetConfig, CachetResult, Namespace, Predicate, Record, RecordKey, Timestamp,
};
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::cache::{SecondLevelCache, UpdateWatermarks, WatermarkSnapshot};
use crate::loader::BatchedLoader;
use crate::stats::Statistics;
use crate::BackingStore;

/// Identity of a cached query: its shape plus bound parameters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryKey {
    shape: String,
    params: BTreeMap<String, Value>,
}

impl QueryKey {
    pub fn new(shape: impl Into<String>) -> Self {
        Self {
            shape: shape.into(),
            params: BTreeMap::new(),
        }
    }

    /// Bind a parameter.
    pub fn param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn shape(&self) -> &str {
        &self.shape
    }

    /// Stable SHA-256 hex digest of shape and parameters.
    ///
    /// Parameters are hashed in name order, so binding order is irrelevant.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.shape.as_bytes());
        hasher.update([0u8]);
        // BTreeMap and serde_json maps both serialize in key order.
        let params = serde_json::to_vec(&self.params).unwrap_or_default();
        hasher.update(&params);
        hex::encode(hasher.finalize())
    }
}

/// A key query against one namespace.
#[derive(Debug, Clone)]
pub struct KeyQuery {
    key: QueryKey,
    namespace: Namespace,
    predicate: Predicate,
    spaces: BTreeSet<Namespace>,
}

impl KeyQuery {
    /// Query `namespace` for keys matching `predicate`.
    ///
    /// `key` must identify the predicate: two queries with equal keys are
    /// assumed to select the same records.
    pub fn new(key: QueryKey, namespace: Namespace, predicate: Predicate) -> Self {
        let spaces = BTreeSet::from([namespace.clone()]);
        Self {
            key,
            namespace,
            predicate,
            spaces,
        }
    }

    /// Declare another namespace whose writes invalidate this query.
    pub fn also_reads(mut self, namespace: Namespace) -> Self {
        self.spaces.insert(namespace);
        self
    }

    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn predicate(&self) -> &Predicate {
        &self.predicate
    }

    /// Every namespace this query reads.
    pub fn spaces(&self) -> &BTreeSet<Namespace> {
        &self.spaces
    }
}

/// Materialized result of [`QueryCache::execute`].
#[derive(Debug, Clone)]
pub struct QueryResult {
    /// Keys in query order, including keys whose record has since been deleted.
    pub keys: Vec<RecordKey>,
    /// Records that still exist, in query order.
    pub records: Vec<Record>,
    /// Whether the key list came from the cache.
    pub from_cache: bool,
}

#[derive(Debug, Clone)]
struct CachedQuery {
    keys: Vec<RecordKey>,
    watermarks: WatermarkSnapshot,
    cached_at: Timestamp,
}

/// Cache of key-list query results.
#[derive(Debug)]
pub struct QueryCache {
    entries: RwLock<HashMap<String, CachedQuery>>,
    watermarks: Arc<UpdateWatermarks>,
    stats: Arc<Statistics>,
    enabled: bool,
}

impl QueryCache {
    /// Create an enabled query cache.
    pub fn new(watermarks: Arc<UpdateWatermarks>, stats: Arc<Statistics>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            watermarks,
            stats,
            enabled: true,
        }
    }

    /// Apply `query_cache_enabled` from configuration.
    pub fn with_config(self, config: &CachetConfig) -> Self {
        self.with_enabled(config.query_cache_enabled)
    }

    /// Enable or disable caching. A disabled cache executes every query.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Cached keys for `query`, unless a namespace it reads was written since.
    ///
    /// A stale entry is dropped.
    pub fn get(&self, query: &KeyQuery) -> CachetResult<Option<Vec<RecordKey>>> {
        let fingerprint = query.key.fingerprint();
        let cached = {
            let entries = self.entries.read().map_err(|_| CacheError::LockPoisoned)?;
            match entries.get(&fingerprint) {
                Some(cached) => cached.clone(),
                None => return Ok(None),
            }
        };

        if self.watermarks.is_stale(&cached.watermarks)? {
            let mut entries = self.entries.write().map_err(|_| CacheError::LockPoisoned)?;
            entries.remove(&fingerprint);
            tracing::debug!(
                shape = query.key.shape(),
                fingerprint = %fingerprint,
                cached_at = %cached.cached_at,
                "Stale query result discarded"
            );
            return Ok(None);
        }
        Ok(Some(cached.keys))
    }

    /// Cache keys for `query`, valid as of `watermarks`.
    pub fn put(
        &self,
        query: &KeyQuery,
        keys: Vec<RecordKey>,
        watermarks: WatermarkSnapshot,
    ) -> CachetResult<()> {
        let mut entries = self.entries.write().map_err(|_| CacheError::LockPoisoned)?;
        entries.insert(
            query.key.fingerprint(),
            CachedQuery {
                keys,
                watermarks,
                cached_at: Utc::now(),
            },
        );
        Statistics::incr(&self.stats.query_cache_put);
        Ok(())
    }

    /// Drop every result that reads `namespace`.
    pub fn invalidate_namespace(&self, namespace: &Namespace) -> CachetResult<usize> {
        let mut entries = self.entries.write().map_err(|_| CacheError::LockPoisoned)?;
        let before = entries.len();
        entries.retain(|_, cached| !cached.watermarks.contains_key(namespace));
        Ok(before - entries.len())
    }

    /// Drop every result.
    pub fn clear(&self) -> CachetResult<usize> {
        let mut entries = self.entries.write().map_err(|_| CacheError::LockPoisoned)?;
        let dropped = entries.len();
        entries.clear();
        Ok(dropped)
    }

    /// Number of cached results.
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run a key query through the cache and materialize the records.
    ///
    /// On a hit no query statement is issued. On a miss the store runs the
    /// query once and the key list is cached with the watermarks taken
    /// before it ran, so a write racing the query leaves the result stale.
    pub fn execute<S, C>(
        &self,
        loader: &BatchedLoader<S, C>,
        query: &KeyQuery,
    ) -> CachetResult<QueryResult>
    where
        S: BackingStore + ?Sized + 'static,
        C: SecondLevelCache + ?Sized,
    {
        if self.enabled {
            if let Some(keys) = self.get(query)? {
                Statistics::incr(&self.stats.query_cache_hit);
                let records = loader.materialize(&query.namespace, &keys)?;
                tracing::debug!(
                    shape = query.key.shape(),
                    keys = keys.len(),
                    records = records.len(),
                    "Query cache hit"
                );
                return Ok(QueryResult {
                    keys,
                    records,
                    from_cache: true,
                });
            }
            Statistics::incr(&self.stats.query_cache_miss);
        }

        let snapshot = self.watermarks.snapshot(&query.spaces)?;
        let keys = loader.select_keys(&query.namespace, &query.predicate)?;
        if self.enabled {
            self.put(query, keys.clone(), snapshot)?;
        }
        let records = loader.materialize(&query.namespace, &keys)?;
        Ok(QueryResult {
            keys,
            records,
            from_cache: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;
    use crate::invalidator::WriteThroughInvalidator;
    use crate::MockStore;

    struct Harness {
        store: Arc<MockStore>,
        stats: Arc<Statistics>,
        loader: BatchedLoader<MockStore, InMemoryCache>,
        invalidator: WriteThroughInvalidator<MockStore, InMemoryCache>,
        queries: QueryCache,
    }

    fn harness() -> Harness {
        let store = Arc::new(MockStore::new());
        let cache = Arc::new(InMemoryCache::default());
        let stats = Arc::new(Statistics::new());
        let watermarks = Arc::new(UpdateWatermarks::new());
        store
            .seed(
                &ns(),
                (1..=6i64).map(|id| Record::new(id).with_field("parity", id % 2)),
            )
            .unwrap();
        Harness {
            loader: BatchedLoader::new(Arc::clone(&store), Arc::clone(&cache), Arc::clone(&stats)),
            invalidator: WriteThroughInvalidator::new(
                Arc::clone(&store),
                cache,
                Arc::clone(&stats),
                Arc::clone(&watermarks),
            ),
            queries: QueryCache::new(watermarks, Arc::clone(&stats)),
            store,
            stats,
        }
    }

    fn ns() -> Namespace {
        Namespace::new("CachedEntity")
    }

    fn odd_query() -> KeyQuery {
        KeyQuery::new(
            QueryKey::new("CachedEntity by parity").param("parity", 1),
            ns(),
            Predicate::field_eq("parity", 1),
        )
    }

    fn ids(records: &[Record]) -> Vec<RecordKey> {
        records.iter().map(|r| r.key.clone()).collect()
    }

    #[test]
    fn test_fingerprint_ignores_param_order() {
        let a = QueryKey::new("q").param("x", 1).param("y", "two");
        let b = QueryKey::new("q").param("y", "two").param("x", 1);
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);
        assert_ne!(a.fingerprint(), QueryKey::new("q").param("x", 2).fingerprint());
        assert_ne!(a.fingerprint(), QueryKey::new("r").param("x", 1).fingerprint());
    }

    #[test]
    fn test_repeated_query_runs_once() {
        let h = harness();
        let first = h.queries.execute(&h.loader, &odd_query()).unwrap();
        let second = h.queries.execute(&h.loader, &odd_query()).unwrap();

        assert!(!first.from_cache);
        assert!(second.from_cache);
        assert_eq!(ids(&second.records), ids(&first.records));
        let snapshot = h.stats.snapshot();
        assert_eq!(snapshot.query_execution_count, 1);
        assert_eq!(snapshot.query_cache_hit_count, 1);
        assert_eq!(snapshot.query_cache_miss_count, 1);
        assert_eq!(snapshot.query_cache_put_count, 1);
        // Materialization of the hit was served by the record cache.
        assert_eq!(h.store.load_calls(), 1);
    }

    #[test]
    fn test_write_forces_reexecution() {
        let h = harness();
        h.queries.execute(&h.loader, &odd_query()).unwrap();
        h.invalidator
            .on_insert(&ns(), Record::new(7i64).with_field("parity", 1))
            .unwrap();

        let result = h.queries.execute(&h.loader, &odd_query()).unwrap();
        assert!(!result.from_cache);
        assert_eq!(
            ids(&result.records),
            vec![RecordKey::id(1), RecordKey::id(3), RecordKey::id(5), RecordKey::id(7)]
        );
        assert_eq!(h.stats.snapshot().query_execution_count, 2);
    }

    #[test]
    fn test_deleted_record_drops_out_of_cached_result() {
        let h = harness();
        h.queries.execute(&h.loader, &odd_query()).unwrap();

        // Remove a record behind the query cache's back.
        h.store.delete(&ns(), &RecordKey::id(3)).unwrap();
        h.loader.cache().evict(&ns(), &RecordKey::id(3)).unwrap();

        let result = h.queries.execute(&h.loader, &odd_query()).unwrap();
        assert!(result.from_cache);
        assert_eq!(result.keys.len(), 3);
        assert_eq!(ids(&result.records), vec![RecordKey::id(1), RecordKey::id(5)]);
    }

    #[test]
    fn test_unrelated_write_keeps_result() {
        let h = harness();
        h.queries.execute(&h.loader, &odd_query()).unwrap();
        h.invalidator
            .on_insert(&Namespace::new("CachedChild"), Record::new(1i64))
            .unwrap();
        assert!(h.queries.execute(&h.loader, &odd_query()).unwrap().from_cache);

        let joined = odd_query().also_reads(Namespace::new("CachedChild"));
        h.queries.execute(&h.loader, &joined).unwrap();
        h.invalidator
            .on_insert(&Namespace::new("CachedChild"), Record::new(2i64))
            .unwrap();
        assert!(!h.queries.execute(&h.loader, &joined).unwrap().from_cache);
    }

    #[test]
    fn test_disabled_cache_always_executes() {
        let mut h = harness();
        h.queries = QueryCache::new(Arc::new(UpdateWatermarks::new()), Arc::clone(&h.stats))
            .with_enabled(false);
        h.queries.execute(&h.loader, &odd_query()).unwrap();
        let second = h.queries.execute(&h.loader, &odd_query()).unwrap();
        assert!(!second.from_cache);
        assert!(h.queries.is_empty());
        assert_eq!(h.stats.snapshot().query_execution_count, 2);
    }

    #[test]
    fn test_invalidate_namespace_and_clear() {
        let h = harness();
        h.queries.execute(&h.loader, &odd_query()).unwrap();
        assert_eq!(h.queries.invalidate_namespace(&Namespace::new("Other")).unwrap(), 0);
        assert_eq!(h.queries.invalidate_namespace(&ns()).unwrap(), 1);

        h.queries.execute(&h.loader, &odd_query()).unwrap();
        assert_eq!(h.queries.clear().unwrap(), 1);
        assert!(h.queries.is_empty());
    }
}
