//! Cachet Storage - Backing Store Trait, Cache, Loader and Invalidator
//!
//! Defines the backing-store abstraction and a mock implementation, the
//! process-wide second-level cache, the batched loader that fronts the
//! store with that cache, the write-through invalidator that keeps the
//! cache in line with committed writes, and the key-list query cache.

pub mod cache;
pub mod invalidator;
pub mod lmdb_store;
pub mod loader;
pub mod query_cache;
pub mod service;
pub mod stats;
pub mod store_key;

pub use cache::{
    CacheEntry, CacheStats, Generation, InMemoryCache, SecondLevelCache, UpdateWatermarks,
    WatermarkSnapshot,
};
pub use invalidator::{BulkDeleteOutcome, EvictionScope, WriteThroughInvalidator};
pub use lmdb_store::LmdbStore;
pub use loader::{BatchLoad, BatchedLoader, LoadStats, RecordRef, DEFAULT_MAX_TIMED_FETCHES};
pub use query_cache::{KeyQuery, QueryCache, QueryKey, QueryResult};
pub use service::CachetService;
pub use stats::{Statistics, StatisticsSnapshot};
pub use store_key::NamespacedKey;

use cachet_core::{Entity, Namespace, Predicate, Record, RecordKey, StoreError, StoreResult};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;

// ============================================================================
// BACKING STORE TRAIT
// ============================================================================

/// Result of a predicate delete.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteOutcome {
    /// Rows removed.
    pub count: u64,
    /// Removed keys, when the store can report them.
    pub keys: Option<Vec<RecordKey>>,
}

/// Durable record store the loader and invalidator sit in front of.
///
/// Every method is one statement against the store. Implementations must
/// be thread-safe.
pub trait BackingStore: Send + Sync {
    /// Fetch many keys in one call. Keys with no record are absent.
    fn load_many(
        &self,
        namespace: &Namespace,
        keys: &[RecordKey],
    ) -> StoreResult<HashMap<RecordKey, Record>>;

    /// Insert a new record. Fails with `Conflict` if the key exists.
    fn insert(&self, namespace: &Namespace, record: &Record) -> StoreResult<()>;

    /// Replace an existing record. Fails with `WriteFailed` if it is missing.
    fn update(&self, namespace: &Namespace, record: &Record) -> StoreResult<()>;

    /// Delete one record. Returns whether it existed.
    fn delete(&self, namespace: &Namespace, key: &RecordKey) -> StoreResult<bool>;

    /// Delete every record the predicate selects.
    fn delete_where(
        &self,
        namespace: &Namespace,
        predicate: &Predicate,
    ) -> StoreResult<DeleteOutcome>;

    /// Keys of every record the predicate selects, in key order.
    fn select_keys(
        &self,
        namespace: &Namespace,
        predicate: &Predicate,
    ) -> StoreResult<Vec<RecordKey>>;
}

// ============================================================================
// MOCK STORE (for testing)
// ============================================================================

fn poisoned<T>(_: PoisonError<T>) -> StoreError {
    StoreError::Backend {
        reason: "store lock poisoned".to_string(),
    }
}

/// In-memory backing store for tests.
///
/// Counts calls, records every bulk fetch, and can be told to fail or to
/// stall. `Native` statements must be registered with an equivalent
/// predicate before use.
#[derive(Debug)]
pub struct MockStore {
    tables: RwLock<HashMap<Namespace, BTreeMap<RecordKey, Record>>>,
    native: RwLock<HashMap<String, Predicate>>,
    load_calls: AtomicU64,
    statements: AtomicU64,
    load_log: Mutex<Vec<(Namespace, Vec<RecordKey>)>>,
    available: AtomicBool,
    failing_loads: AtomicU64,
    latency: Mutex<Option<Duration>>,
    report_native_keys: AtomicBool,
}

impl Default for MockStore {
    fn default() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            native: RwLock::new(HashMap::new()),
            load_calls: AtomicU64::new(0),
            statements: AtomicU64::new(0),
            load_log: Mutex::new(Vec::new()),
            available: AtomicBool::new(true),
            failing_loads: AtomicU64::new(0),
            latency: Mutex::new(None),
            report_native_keys: AtomicBool::new(false),
        }
    }
}

impl MockStore {
    /// Create a new mock store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Put records straight into the store without counting statements.
    pub fn seed(
        &self,
        namespace: &Namespace,
        records: impl IntoIterator<Item = Record>,
    ) -> StoreResult<()> {
        let mut tables = self.tables.write().map_err(poisoned)?;
        let table = tables.entry(namespace.clone()).or_default();
        for record in records {
            table.insert(record.key.clone(), record);
        }
        Ok(())
    }

    /// Seed typed entities into their namespace.
    pub fn seed_entities<T: Entity>(&self, entities: &[T]) -> cachet_core::CachetResult<()> {
        let records = entities
            .iter()
            .map(Record::from_entity)
            .collect::<cachet_core::CachetResult<Vec<_>>>()?;
        self.seed(&T::namespace(), records)?;
        Ok(())
    }

    /// Teach the store what a `Native` statement selects.
    pub fn register_native(&self, statement: impl Into<String>, equivalent: Predicate) {
        if let Ok(mut native) = self.native.write() {
            native.insert(statement.into(), equivalent);
        }
    }

    /// Whether native deletes report the keys they removed.
    pub fn set_report_native_keys(&self, report: bool) {
        self.report_native_keys.store(report, Ordering::SeqCst);
    }

    /// Make every call fail with `Unavailable`, or bring the store back.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Fail the next `n` bulk fetches.
    pub fn fail_next_loads(&self, n: u64) {
        self.failing_loads.store(n, Ordering::SeqCst);
    }

    /// Stall every bulk fetch for `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        if let Ok(mut guard) = self.latency.lock() {
            *guard = latency;
        }
    }

    /// Number of `load_many` calls, failed ones included.
    pub fn load_calls(&self) -> u64 {
        self.load_calls.load(Ordering::SeqCst)
    }

    /// Number of statements of any kind.
    pub fn statements(&self) -> u64 {
        self.statements.load(Ordering::SeqCst)
    }

    /// Every bulk fetch so far, with the keys it asked for.
    pub fn load_log(&self) -> Vec<(Namespace, Vec<RecordKey>)> {
        self.load_log
            .lock()
            .map(|log| log.clone())
            .unwrap_or_default()
    }

    /// Zero the call counters and the fetch log.
    pub fn reset_counters(&self) {
        self.load_calls.store(0, Ordering::SeqCst);
        self.statements.store(0, Ordering::SeqCst);
        if let Ok(mut log) = self.load_log.lock() {
            log.clear();
        }
    }

    /// Number of records in a namespace.
    pub fn count(&self, namespace: &Namespace) -> usize {
        self.tables
            .read()
            .map(|tables| tables.get(namespace).map(BTreeMap::len).unwrap_or(0))
            .unwrap_or(0)
    }

    /// Read a record without counting a statement.
    pub fn peek(&self, namespace: &Namespace, key: &RecordKey) -> Option<Record> {
        self.tables
            .read()
            .ok()
            .and_then(|tables| tables.get(namespace).and_then(|t| t.get(key)).cloned())
    }

    fn begin_statement(&self) -> StoreResult<()> {
        self.statements.fetch_add(1, Ordering::SeqCst);
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable {
                reason: "mock store offline".to_string(),
            });
        }
        Ok(())
    }

    /// Resolve a predicate into one the store can evaluate row by row.
    fn evaluable(&self, predicate: &Predicate) -> StoreResult<Predicate> {
        match predicate {
            Predicate::Native { statement } => self
                .native
                .read()
                .map_err(poisoned)?
                .get(statement)
                .cloned()
                .ok_or_else(|| StoreError::Backend {
                    reason: format!("unknown statement: {}", statement),
                }),
            other => Ok(other.clone()),
        }
    }
}

impl BackingStore for MockStore {
    fn load_many(
        &self,
        namespace: &Namespace,
        keys: &[RecordKey],
    ) -> StoreResult<HashMap<RecordKey, Record>> {
        self.load_calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut log) = self.load_log.lock() {
            log.push((namespace.clone(), keys.to_vec()));
        }
        self.begin_statement()?;

        let latency = self.latency.lock().map(|l| *l).unwrap_or(None);
        if let Some(latency) = latency {
            std::thread::sleep(latency);
        }

        let failing = self
            .failing_loads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(StoreError::Unavailable {
                reason: "injected load failure".to_string(),
            });
        }

        let tables = self.tables.read().map_err(poisoned)?;
        let Some(table) = tables.get(namespace) else {
            return Ok(HashMap::new());
        };
        Ok(keys
            .iter()
            .filter_map(|key| table.get(key).map(|r| (key.clone(), r.clone())))
            .collect())
    }

    fn insert(&self, namespace: &Namespace, record: &Record) -> StoreResult<()> {
        self.begin_statement()?;
        let mut tables = self.tables.write().map_err(poisoned)?;
        let table = tables.entry(namespace.clone()).or_default();
        if table.contains_key(&record.key) {
            return Err(StoreError::Conflict {
                namespace: namespace.clone(),
                key: record.key.clone(),
            });
        }
        table.insert(record.key.clone(), record.clone());
        Ok(())
    }

    fn update(&self, namespace: &Namespace, record: &Record) -> StoreResult<()> {
        self.begin_statement()?;
        let mut tables = self.tables.write().map_err(poisoned)?;
        let existing = tables
            .get_mut(namespace)
            .and_then(|table| table.get_mut(&record.key))
            .ok_or_else(|| StoreError::WriteFailed {
                namespace: namespace.clone(),
                key: record.key.clone(),
                reason: "no such record".to_string(),
            })?;
        *existing = record.clone();
        Ok(())
    }

    fn delete(&self, namespace: &Namespace, key: &RecordKey) -> StoreResult<bool> {
        self.begin_statement()?;
        let mut tables = self.tables.write().map_err(poisoned)?;
        Ok(tables
            .get_mut(namespace)
            .is_some_and(|table| table.remove(key).is_some()))
    }

    fn delete_where(
        &self,
        namespace: &Namespace,
        predicate: &Predicate,
    ) -> StoreResult<DeleteOutcome> {
        self.begin_statement()?;
        let evaluable = self.evaluable(predicate)?;
        let mut tables = self.tables.write().map_err(poisoned)?;
        let Some(table) = tables.get_mut(namespace) else {
            return Ok(DeleteOutcome::default());
        };
        let doomed: Vec<RecordKey> = table
            .values()
            .filter(|record| evaluable.matches(record).unwrap_or(false))
            .map(|record| record.key.clone())
            .collect();
        for key in &doomed {
            table.remove(key);
        }

        let report = predicate.is_evaluable() || self.report_native_keys.load(Ordering::SeqCst);
        Ok(DeleteOutcome {
            count: doomed.len() as u64,
            keys: report.then_some(doomed),
        })
    }

    fn select_keys(
        &self,
        namespace: &Namespace,
        predicate: &Predicate,
    ) -> StoreResult<Vec<RecordKey>> {
        self.begin_statement()?;
        let evaluable = self.evaluable(predicate)?;
        let tables = self.tables.read().map_err(poisoned)?;
        Ok(tables
            .get(namespace)
            .map(|table| {
                table
                    .values()
                    .filter(|record| evaluable.matches(record).unwrap_or(false))
                    .map(|record| record.key.clone())
                    .collect()
            })
            .unwrap_or_default())
    }
}

// ============================================================================
// TESTS
// ============================================================================
