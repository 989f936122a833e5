//! Batched, cache-aware record loading.
//!
//! The loader splits a key set into second-level cache hits and misses,
//! fetches all misses in one store call, populates the cache and returns
//! the union. Relation traversal is explicit: request a key set, then
//! resolve relations through the loader, so a prefetch of the related
//! namespace turns N per-record fetches into one batch.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::AddAssign;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cachet_core::{
    CacheError, CachetConfig, CachetError, CachetResult, Entity, Namespace, Predicate, Record,
    RecordKey, StoreError,
};

use crate::cache::{Generation, SecondLevelCache};
use crate::stats::Statistics;
use crate::BackingStore;

/// Per-call counts reported by the loader.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadStats {
    /// Keys answered from the cache.
    pub hits: usize,
    /// Keys the cache did not hold.
    pub misses: usize,
    /// Bulk store fetches issued.
    pub store_calls: usize,
}

impl AddAssign for LoadStats {
    fn add_assign(&mut self, other: Self) {
        self.hits += other.hits;
        self.misses += other.misses;
        self.store_calls += other.store_calls;
    }
}

/// Result of one batched load.
#[derive(Debug, Clone, Default)]
pub struct BatchLoad {
    /// Found records by key. Keys with no backing record are absent.
    pub records: BTreeMap<RecordKey, Record>,
    pub stats: LoadStats,
}

impl BatchLoad {
    /// Number of records found.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True if no record was found.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Look up one loaded record.
    pub fn get(&self, key: &RecordKey) -> Option<&Record> {
        self.records.get(key)
    }

    /// Loaded records in key order.
    pub fn into_records(self) -> Vec<Record> {
        self.records.into_values().collect()
    }
}

/// Deferred reference to a record, loaded on demand through a loader.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordRef {
    namespace: Namespace,
    key: RecordKey,
}

impl RecordRef {
    /// Reference `key` in `namespace`.
    pub fn new(namespace: Namespace, key: RecordKey) -> Self {
        Self { namespace, key }
    }

    /// Reference an entity of type `T`.
    pub fn of<T: Entity>(key: impl Into<RecordKey>) -> Self {
        Self::new(T::namespace(), key.into())
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// The referenced key. Reading it never touches the store.
    pub fn key(&self) -> &RecordKey {
        &self.key
    }

    /// Load the referenced record.
    pub fn load<S, C>(&self, loader: &BatchedLoader<S, C>) -> CachetResult<Option<Record>>
    where
        S: BackingStore + ?Sized + 'static,
        C: SecondLevelCache + ?Sized,
    {
        loader.find(&self.namespace, &self.key)
    }
}

/// Cache-aware batched loader.
///
/// Cheap to clone; clones share the store, cache and statistics.
///
/// # Degraded mode
///
/// If the cache cannot be read the loader serves every key from the store
/// and skips population. Store errors always propagate.
pub struct BatchedLoader<S: ?Sized, C: ?Sized> {
    store: Arc<S>,
    cache: Arc<C>,
    stats: Arc<Statistics>,
    store_timeout: Option<Duration>,
    timed_fetches: Arc<AtomicUsize>,
    max_timed_fetches: usize,
}

/// Default bound on timed fetch threads that may run at once.
pub const DEFAULT_MAX_TIMED_FETCHES: usize = 32;

/// One running timed fetch; released when the fetch thread finishes.
struct FetchSlot(Arc<AtomicUsize>);

impl Drop for FetchSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<S: ?Sized, C: ?Sized> Clone for BatchedLoader<S, C> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            cache: Arc::clone(&self.cache),
            stats: Arc::clone(&self.stats),
            store_timeout: self.store_timeout,
            timed_fetches: Arc::clone(&self.timed_fetches),
            max_timed_fetches: self.max_timed_fetches,
        }
    }
}

impl<S, C> BatchedLoader<S, C>
where
    S: BackingStore + ?Sized + 'static,
    C: SecondLevelCache + ?Sized,
{
    /// Create a loader with no store timeout.
    pub fn new(store: Arc<S>, cache: Arc<C>, stats: Arc<Statistics>) -> Self {
        Self {
            store,
            cache,
            stats,
            store_timeout: None,
            timed_fetches: Arc::new(AtomicUsize::new(0)),
            max_timed_fetches: DEFAULT_MAX_TIMED_FETCHES,
        }
    }

    /// Apply the store timeout from configuration.
    pub fn with_config(mut self, config: &CachetConfig) -> Self {
        self.store_timeout = config.store_timeout;
        self
    }

    /// Bound every bulk store fetch. `None` waits indefinitely.
    ///
    /// A timed fetch runs on its own thread, and a fetch that times out
    /// keeps that thread until the store call returns. At most
    /// [`BatchedLoader::with_max_timed_fetches`] such threads exist across
    /// clones of this loader; beyond that, fetches fail fast with
    /// `StoreError::Unavailable` instead of spawning.
    pub fn with_store_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// Cap the timed fetch threads that may run at once (at least one).
    pub fn with_max_timed_fetches(mut self, max: usize) -> Self {
        self.max_timed_fetches = max.max(1);
        self
    }

    /// Timed fetch threads currently running, including abandoned ones.
    pub fn timed_fetches_in_flight(&self) -> usize {
        self.timed_fetches.load(Ordering::SeqCst)
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn cache(&self) -> &Arc<C> {
        &self.cache
    }

    pub fn statistics(&self) -> &Arc<Statistics> {
        &self.stats
    }

    /// Load a batch of keys with the configured timeout.
    ///
    /// Duplicate keys collapse. An empty key set returns an empty result
    /// without touching cache or store.
    pub fn load_batch(&self, namespace: &Namespace, keys: &[RecordKey]) -> CachetResult<BatchLoad> {
        self.load_batch_with_timeout(namespace, keys, self.store_timeout)
    }

    /// Load a batch of keys, bounding the store fetch by `timeout`.
    ///
    /// At most one store call is made. If it fails or times out, nothing
    /// fetched by it reaches the cache.
    pub fn load_batch_with_timeout(
        &self,
        namespace: &Namespace,
        keys: &[RecordKey],
        timeout: Option<Duration>,
    ) -> CachetResult<BatchLoad> {
        let requested: BTreeSet<RecordKey> = keys.iter().cloned().collect();
        if requested.is_empty() {
            return Ok(BatchLoad::default());
        }
        let requested: Vec<RecordKey> = requested.into_iter().collect();

        let (mut records, observed) = self.probe(namespace, &requested);
        let hits = records.len();
        let missing: Vec<RecordKey> = requested
            .iter()
            .filter(|key| !records.contains_key(*key))
            .cloned()
            .collect();
        Statistics::add(&self.stats.cache_hit, hits as u64);
        Statistics::add(&self.stats.cache_miss, missing.len() as u64);

        let mut store_calls = 0;
        if !missing.is_empty() {
            store_calls = 1;
            let wanted: BTreeSet<&RecordKey> = missing.iter().collect();
            let fetched: Vec<Record> = self
                .fetch(namespace, &missing, timeout)?
                .into_iter()
                .filter(|(key, _)| wanted.contains(key))
                .map(|(_, record)| record)
                .collect();

            if let Some(generation) = observed {
                self.populate(namespace, fetched.clone(), generation);
            }
            records.extend(fetched.into_iter().map(|r| (r.key.clone(), r)));
        }

        Statistics::add(&self.stats.entity_load, records.len() as u64);
        let stats = LoadStats {
            hits,
            misses: missing.len(),
            store_calls,
        };
        tracing::debug!(
            namespace = %namespace,
            requested = requested.len(),
            hits = stats.hits,
            misses = stats.misses,
            loaded = records.len(),
            store_calls = stats.store_calls,
            "Batch loaded"
        );
        Ok(BatchLoad { records, stats })
    }

    /// Probe the cache. Returns the hits and the generation observed
    /// before probing, or `None` when the cache cannot be used.
    fn probe(
        &self,
        namespace: &Namespace,
        keys: &[RecordKey],
    ) -> (BTreeMap<RecordKey, Record>, Option<Generation>) {
        let generation = match self.cache.generation(namespace) {
            Ok(generation) => generation,
            Err(e) => {
                self.log_degraded(namespace, &e);
                return (BTreeMap::new(), None);
            }
        };
        match self.cache.get_many(namespace, keys) {
            Ok(hits) => (hits.into_iter().collect(), Some(generation)),
            Err(e) => {
                self.log_degraded(namespace, &e);
                (BTreeMap::new(), None)
            }
        }
    }

    fn log_degraded(&self, namespace: &Namespace, error: &CacheError) {
        match error {
            CacheError::Unavailable => {
                tracing::debug!(namespace = %namespace, "Cache unavailable, reading from store only")
            }
            other => {
                tracing::warn!(namespace = %namespace, error = %other, "Cache read failed, reading from store only")
            }
        }
    }

    /// Insert fetched records unless an invalidation happened since `observed`.
    fn populate(&self, namespace: &Namespace, records: Vec<Record>, observed: Generation) {
        match self.cache.put_batch(namespace, records, observed) {
            Ok(inserted) => Statistics::add(&self.stats.cache_put, inserted as u64),
            Err(e) => {
                tracing::warn!(namespace = %namespace, error = %e, "Cache population failed")
            }
        }
    }

    /// One bulk store fetch, bounded by `timeout`.
    ///
    /// With a timeout the fetch runs on its own thread; a result that
    /// arrives after the deadline is discarded.
    fn fetch(
        &self,
        namespace: &Namespace,
        keys: &[RecordKey],
        timeout: Option<Duration>,
    ) -> CachetResult<HashMap<RecordKey, Record>> {
        let Some(limit) = timeout else {
            Statistics::incr(&self.stats.store_call);
            Statistics::incr(&self.stats.statement);
            return self.store.load_many(namespace, keys).map_err(|e| {
                tracing::warn!(namespace = %namespace, keys = keys.len(), error = %e, "Store fetch failed");
                CachetError::from(e)
            });
        };

        let slot = self.acquire_fetch_slot(namespace)?;
        Statistics::incr(&self.stats.store_call);
        Statistics::incr(&self.stats.statement);

        let (tx, rx) = mpsc::channel();
        let store = Arc::clone(&self.store);
        let owned_namespace = namespace.clone();
        let owned_keys = keys.to_vec();
        let started = Instant::now();
        std::thread::Builder::new()
            .name("cachet-store-fetch".to_string())
            .spawn(move || {
                let _slot = slot;
                let _ = tx.send(store.load_many(&owned_namespace, &owned_keys));
            })
            .map_err(|e| StoreError::Backend {
                reason: format!("failed to spawn fetch thread: {}", e),
            })?;

        match rx.recv_timeout(limit) {
            Ok(result) => result.map_err(|e| {
                tracing::warn!(namespace = %namespace, keys = keys.len(), error = %e, "Store fetch failed");
                CachetError::from(e)
            }),
            Err(RecvTimeoutError::Timeout) => {
                let elapsed = started.elapsed();
                tracing::warn!(
                    namespace = %namespace,
                    keys = keys.len(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    limit_ms = limit.as_millis() as u64,
                    "Store fetch timed out"
                );
                Err(StoreError::Timeout {
                    namespace: namespace.clone(),
                    elapsed,
                    limit,
                }
                .into())
            }
            Err(RecvTimeoutError::Disconnected) => Err(StoreError::Backend {
                reason: "store fetch thread exited without a result".to_string(),
            }
            .into()),
        }
    }

    fn acquire_fetch_slot(&self, namespace: &Namespace) -> CachetResult<FetchSlot> {
        let max = self.max_timed_fetches;
        self.timed_fetches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < max).then_some(n + 1))
            .map_err(|running| {
                tracing::warn!(namespace = %namespace, running, "Too many timed store fetches in flight");
                StoreError::Unavailable {
                    reason: format!("{} timed store fetches still running", running),
                }
            })?;
        Ok(FetchSlot(Arc::clone(&self.timed_fetches)))
    }

    /// Load a single record.
    pub fn find(&self, namespace: &Namespace, key: &RecordKey) -> CachetResult<Option<Record>> {
        let mut batch = self.load_batch(namespace, std::slice::from_ref(key))?;
        Ok(batch.records.remove(key))
    }

    /// Load a single typed entity.
    pub fn find_entity<T: Entity>(&self, key: impl Into<RecordKey>) -> CachetResult<Option<T>> {
        self.find(&T::namespace(), &key.into())?
            .map(|record| record.to_entity())
            .transpose()
    }

    /// Load typed entities, in key order.
    pub fn load_entities<T: Entity>(&self, keys: &[RecordKey]) -> CachetResult<Vec<T>> {
        self.load_batch(&T::namespace(), keys)?
            .records
            .values()
            .map(Record::to_entity)
            .collect()
    }

    /// Resolve one relation of a record, in key order.
    ///
    /// Costs one store call if any referenced record is not cached; those
    /// calls are counted as relation fetches.
    pub fn resolve(&self, record: &Record, relation: &str) -> CachetResult<Vec<Record>> {
        let reference = record
            .relation(relation)
            .ok_or_else(|| CachetError::UnknownRelation {
                key: record.key.clone(),
                relation: relation.to_string(),
            })?;
        let keys: Vec<RecordKey> = reference.keys().into_iter().collect();
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let batch = self.load_batch(reference.target(), &keys)?;
        if batch.stats.store_calls > 0 {
            Statistics::incr(&self.stats.relation_fetch);
        }
        Ok(batch.into_records())
    }

    /// Resolve a single-valued relation.
    pub fn resolve_one(&self, record: &Record, relation: &str) -> CachetResult<Option<Record>> {
        Ok(self.resolve(record, relation)?.into_iter().next())
    }

    /// Batch-load everything the given relation paths reach from `records`.
    ///
    /// A path is a dot-separated chain of relation names, e.g.
    /// `"city.state"`. Each level costs at most one store call per target
    /// namespace. Records without a relation of that name are skipped.
    pub fn prefetch_relations(&self, records: &[Record], paths: &[&str]) -> CachetResult<LoadStats> {
        let mut total = LoadStats::default();
        for path in paths {
            let mut frontier: Vec<Record> = records.to_vec();
            for segment in path.split('.').filter(|s| !s.is_empty()) {
                let mut targets: BTreeMap<Namespace, BTreeSet<RecordKey>> = BTreeMap::new();
                for record in &frontier {
                    if let Some(relation) = record.relation(segment) {
                        targets
                            .entry(relation.target().clone())
                            .or_default()
                            .extend(relation.keys());
                    }
                }

                let mut next = Vec::new();
                for (namespace, keys) in targets {
                    let keys: Vec<RecordKey> = keys.into_iter().collect();
                    let batch = self.load_batch(&namespace, &keys)?;
                    total += batch.stats;
                    next.extend(batch.into_records());
                }
                frontier = next;
            }
        }
        tracing::debug!(
            roots = records.len(),
            paths = ?paths,
            store_calls = total.store_calls,
            "Relations prefetched"
        );
        Ok(total)
    }

    /// Fetch-join: load a batch, then batch-load the named relation paths.
    ///
    /// The returned stats cover every load the call made.
    pub fn load_with(
        &self,
        namespace: &Namespace,
        keys: &[RecordKey],
        relations: &[&str],
    ) -> CachetResult<BatchLoad> {
        let mut batch = self.load_batch(namespace, keys)?;
        let roots: Vec<Record> = batch.records.values().cloned().collect();
        let related = self.prefetch_relations(&roots, relations)?;
        batch.stats += related;
        Ok(batch)
    }

    /// Keys matching a predicate, as one store statement, in key order.
    pub fn select_keys(
        &self,
        namespace: &Namespace,
        predicate: &Predicate,
    ) -> CachetResult<Vec<RecordKey>> {
        Statistics::incr(&self.stats.statement);
        Statistics::incr(&self.stats.query_execution);
        let keys = self.store.select_keys(namespace, predicate)?;
        tracing::debug!(
            namespace = %namespace,
            predicate = %predicate,
            matched = keys.len(),
            "Key query executed"
        );
        Ok(keys)
    }

    /// Records matching a predicate, in key order.
    ///
    /// Selects keys in the store, then materializes them through
    /// [`BatchedLoader::load_batch`] so cached records are reused.
    pub fn query(&self, namespace: &Namespace, predicate: &Predicate) -> CachetResult<Vec<Record>> {
        let keys = self.select_keys(namespace, predicate)?;
        self.materialize(namespace, &keys)
    }

    /// Load `keys` and return the records in the order given. Keys whose
    /// record no longer exists are skipped.
    pub fn materialize(&self, namespace: &Namespace, keys: &[RecordKey]) -> CachetResult<Vec<Record>> {
        let mut batch = self.load_batch(namespace, keys)?;
        Ok(keys
            .iter()
            .filter_map(|key| batch.records.remove(key))
            .collect())
    }
}
