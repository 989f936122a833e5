//! In-memory second-level cache with explicit lifecycle.
//!
//! One process-wide instance is shared (through `Arc`) by every loader and
//! invalidator. The cache owns no background tasks: entries leave only
//! through explicit invalidation, capacity eviction, or `shutdown`.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use cachet_core::{
    CacheError, CacheResult, CapacityPolicy, Namespace, Predicate, Record, RecordKey,
};

use super::entry::CacheEntry;
use super::traits::{CacheStats, Generation, SecondLevelCache};

/// Entries of one namespace.
#[derive(Debug)]
struct Region {
    entries: HashMap<RecordKey, CacheEntry>,
    /// Entry version to key, oldest first.
    by_version: BTreeMap<u64, RecordKey>,
    generation: Generation,
    next_version: u64,
}

impl Region {
    fn new(generation: Generation) -> Self {
        Self {
            entries: HashMap::new(),
            by_version: BTreeMap::new(),
            generation,
            next_version: 1,
        }
    }

    /// Insert or replace an entry. Returns true if admitting a new key
    /// forced the oldest entry out.
    fn insert(&mut self, key: RecordKey, record: Record, limit: Option<usize>) -> bool {
        let mut evicted = false;
        if let Some(limit) = limit {
            if !self.entries.contains_key(&key) && self.entries.len() >= limit {
                evicted = self.pop_oldest();
            }
        }
        let version = self.next_version;
        self.next_version += 1;
        if let Some(previous) = self.entries.insert(key.clone(), CacheEntry::new(record, version)) {
            self.by_version.remove(&previous.version());
        }
        self.by_version.insert(version, key);
        evicted
    }

    fn remove(&mut self, key: &RecordKey) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                self.by_version.remove(&entry.version());
                true
            }
            None => false,
        }
    }

    fn pop_oldest(&mut self) -> bool {
        match self.by_version.pop_first() {
            Some((_, key)) => self.entries.remove(&key).is_some(),
            None => false,
        }
    }

    /// Drop every entry. Returns how many there were.
    fn clear(&mut self) -> usize {
        let dropped = self.entries.len();
        self.entries.clear();
        self.by_version.clear();
        dropped
    }

    /// Drop oldest entries until at most `limit` remain.
    fn trim(&mut self, limit: usize) -> u64 {
        let mut dropped = 0;
        while self.entries.len() > limit && self.pop_oldest() {
            dropped += 1;
        }
        dropped
    }
}

/// Live state, present between `init` and `shutdown`.
#[derive(Debug)]
struct CacheState {
    policy: CapacityPolicy,
    /// Generation reported for namespaces that have no region yet.
    base: Generation,
    regions: HashMap<Namespace, Region>,
}

impl CacheState {
    fn region_mut(&mut self, namespace: &Namespace) -> &mut Region {
        let base = self.base;
        self.regions
            .entry(namespace.clone())
            .or_insert_with(|| Region::new(base))
    }

    fn generation(&self, namespace: &Namespace) -> Generation {
        self.regions
            .get(namespace)
            .map(|region| region.generation)
            .unwrap_or(self.base)
    }
}

/// Thread-safe in-memory [`SecondLevelCache`].
///
/// # Example
///
/// ```ignore
/// let cache = Arc::new(InMemoryCache::new(CapacityPolicy::Unbounded));
/// let loader = BatchedLoader::new(store, Arc::clone(&cache), stats);
/// // ...
/// cache.shutdown();
/// ```
#[derive(Debug)]
pub struct InMemoryCache {
    state: RwLock<Option<CacheState>>,
    /// Source of generations. Survives shutdown so generations never repeat.
    clock: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    stale_populations: AtomicU64,
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new(CapacityPolicy::Unbounded)
    }
}

impl InMemoryCache {
    /// Create a running cache.
    pub fn new(policy: CapacityPolicy) -> Self {
        Self {
            state: RwLock::new(Some(CacheState {
                policy,
                base: Generation(0),
                regions: HashMap::new(),
            })),
            clock: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            stale_populations: AtomicU64::new(0),
        }
    }

    /// Create a cache that stays unavailable until [`InMemoryCache::init`].
    pub fn stopped() -> Self {
        let cache = Self::default();
        if let Ok(mut state) = cache.state.write() {
            *state = None;
        }
        cache
    }

    /// Start the cache, or change the capacity policy of a running cache.
    ///
    /// A cache started after `shutdown` comes back empty. Tightening the
    /// capacity of a running cache drops the oldest entries at once.
    pub fn init(&self, policy: CapacityPolicy) -> CacheResult<()> {
        let mut guard = self.state.write().map_err(|_| CacheError::LockPoisoned)?;
        match guard.as_mut() {
            Some(state) => {
                state.policy = policy;
                if let Some(limit) = policy.limit() {
                    let dropped: u64 = state
                        .regions
                        .values_mut()
                        .map(|region| region.trim(limit))
                        .sum();
                    self.evictions.fetch_add(dropped, Ordering::Relaxed);
                }
                tracing::debug!(?policy, "Second-level cache policy changed");
            }
            None => {
                *guard = Some(CacheState {
                    policy,
                    base: self.tick(),
                    regions: HashMap::new(),
                });
                tracing::info!(?policy, "Second-level cache started");
            }
        }
        Ok(())
    }

    /// Stop the cache and drop every entry. Returns how many were dropped.
    ///
    /// Calling `shutdown` on a stopped cache is a no-op.
    pub fn shutdown(&self) -> CacheResult<usize> {
        let mut guard = self.state.write().map_err(|_| CacheError::LockPoisoned)?;
        let dropped = guard
            .take()
            .map(|state| state.regions.values().map(|r| r.entries.len()).sum())
            .unwrap_or(0);
        self.tick();
        tracing::info!(dropped, "Second-level cache shut down");
        Ok(dropped)
    }

    /// Whether the cache is between `init` and `shutdown`.
    pub fn is_running(&self) -> bool {
        self.state.read().map(|s| s.is_some()).unwrap_or(false)
    }

    fn tick(&self) -> Generation {
        Generation(self.clock.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn with_state<R>(&self, f: impl FnOnce(&CacheState) -> R) -> CacheResult<R> {
        let guard = self.state.read().map_err(|_| CacheError::LockPoisoned)?;
        guard.as_ref().map(f).ok_or(CacheError::Unavailable)
    }

    fn with_state_mut<R>(&self, f: impl FnOnce(&mut CacheState) -> R) -> CacheResult<R> {
        let mut guard = self.state.write().map_err(|_| CacheError::LockPoisoned)?;
        guard.as_mut().map(f).ok_or(CacheError::Unavailable)
    }

    fn count_probe(&self, hit: bool) {
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl SecondLevelCache for InMemoryCache {
    fn get(&self, namespace: &Namespace, key: &RecordKey) -> CacheResult<Option<Record>> {
        Ok(self.get_entry(namespace, key)?.map(CacheEntry::into_record))
    }

    fn get_entry(
        &self,
        namespace: &Namespace,
        key: &RecordKey,
    ) -> CacheResult<Option<CacheEntry>> {
        let entry = self.with_state(|state| {
            state
                .regions
                .get(namespace)
                .and_then(|region| region.entries.get(key))
                .cloned()
        })?;
        self.count_probe(entry.is_some());
        Ok(entry)
    }

    fn get_many(
        &self,
        namespace: &Namespace,
        keys: &[RecordKey],
    ) -> CacheResult<HashMap<RecordKey, Record>> {
        let found = self.with_state(|state| {
            let Some(region) = state.regions.get(namespace) else {
                return HashMap::new();
            };
            keys.iter()
                .filter_map(|key| {
                    region
                        .entries
                        .get(key)
                        .map(|entry| (key.clone(), entry.record().clone()))
                })
                .collect::<HashMap<_, _>>()
        })?;
        self.hits.fetch_add(found.len() as u64, Ordering::Relaxed);
        self.misses
            .fetch_add((keys.len() - found.len()) as u64, Ordering::Relaxed);
        Ok(found)
    }

    fn put(&self, namespace: &Namespace, key: RecordKey, record: Record) -> CacheResult<()> {
        let evicted = self.with_state_mut(|state| {
            let limit = state.policy.limit();
            let generation = self.tick();
            let region = state.region_mut(namespace);
            region.generation = generation;
            region.insert(key, record, limit)
        })?;
        if evicted {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn put_batch(
        &self,
        namespace: &Namespace,
        records: Vec<Record>,
        observed: Generation,
    ) -> CacheResult<usize> {
        let (inserted, evicted) = self.with_state_mut(|state| {
            if state.generation(namespace) != observed {
                return None;
            }
            let limit = state.policy.limit();
            let region = state.region_mut(namespace);
            let inserted = records.len();
            let evicted = records
                .into_iter()
                .map(|record| region.insert(record.key.clone(), record, limit))
                .filter(|evicted| *evicted)
                .count();
            Some((inserted, evicted))
        })?
        .unwrap_or_else(|| {
            self.stale_populations.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                namespace = %namespace,
                observed = observed.value(),
                "Generation moved during fetch, cache population skipped"
            );
            (0, 0)
        });
        self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
        Ok(inserted)
    }

    fn evict(&self, namespace: &Namespace, key: &RecordKey) -> CacheResult<bool> {
        self.with_state_mut(|state| {
            let generation = self.tick();
            let region = state.region_mut(namespace);
            region.generation = generation;
            region.remove(key)
        })
    }

    fn evict_many(
        &self,
        namespace: &Namespace,
        keys: &[RecordKey],
    ) -> CacheResult<Vec<RecordKey>> {
        self.with_state_mut(|state| {
            let generation = self.tick();
            let region = state.region_mut(namespace);
            region.generation = generation;
            keys.iter()
                .filter(|key| region.remove(key))
                .cloned()
                .collect()
        })
    }

    fn evict_where(
        &self,
        namespace: &Namespace,
        predicate: &Predicate,
    ) -> CacheResult<Vec<RecordKey>> {
        self.with_state_mut(|state| {
            let generation = self.tick();
            let region = state.region_mut(namespace);
            region.generation = generation;
            let mut matched: Vec<RecordKey> = region
                .entries
                .iter()
                .filter(|(_, entry)| predicate.matches(entry.record()).unwrap_or(true))
                .map(|(key, _)| key.clone())
                .collect();
            matched.sort();
            for key in &matched {
                region.remove(key);
            }
            matched
        })
    }

    fn clear(&self, namespace: &Namespace) -> CacheResult<usize> {
        let dropped = self.with_state_mut(|state| {
            let generation = self.tick();
            let region = state.region_mut(namespace);
            region.generation = generation;
            region.clear()
        })?;
        tracing::debug!(namespace = %namespace, dropped, "Cache namespace cleared");
        Ok(dropped)
    }

    fn size(&self, namespace: &Namespace) -> CacheResult<usize> {
        self.with_state(|state| {
            state
                .regions
                .get(namespace)
                .map(|region| region.entries.len())
                .unwrap_or(0)
        })
    }

    fn generation(&self, namespace: &Namespace) -> CacheResult<Generation> {
        self.with_state(|state| state.generation(namespace))
    }

    fn keys(&self, namespace: &Namespace) -> CacheResult<Vec<RecordKey>> {
        self.with_state(|state| {
            let mut keys: Vec<RecordKey> = state
                .regions
                .get(namespace)
                .map(|region| region.entries.keys().cloned().collect())
                .unwrap_or_default();
            keys.sort();
            keys
        })
    }

    fn namespaces(&self) -> CacheResult<Vec<Namespace>> {
        self.with_state(|state| {
            let mut namespaces: Vec<Namespace> = state.regions.keys().cloned().collect();
            namespaces.sort();
            namespaces
        })
    }

    fn stats(&self) -> CacheResult<CacheStats> {
        let entry_count = self
            .with_state(|state| {
                state
                    .regions
                    .values()
                    .map(|region| region.entries.len() as u64)
                    .sum()
            })
            .unwrap_or(0);
        Ok(CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entry_count,
            evictions: self.evictions.load(Ordering::Relaxed),
            stale_populations: self.stale_populations.load(Ordering::Relaxed),
        })
    }
}
