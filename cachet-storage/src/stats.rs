//! Statistics collector.
//!
//! Passive counters incremented by the loader, invalidator and query
//! cache. Tests read them to verify call counts; nothing in the crate
//! branches on them.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for loader, invalidator and query cache activity.
#[derive(Debug, Default)]
pub struct Statistics {
    /// Records returned by loads (hits plus fetched).
    pub entity_load: AtomicU64,
    /// Bulk fetches issued to the backing store.
    pub store_call: AtomicU64,
    /// Every statement sent to the store: fetches, writes, deletes, queries.
    pub statement: AtomicU64,
    /// Keys answered from the second-level cache.
    pub cache_hit: AtomicU64,
    /// Keys the second-level cache did not hold.
    pub cache_miss: AtomicU64,
    /// Records put into the second-level cache.
    pub cache_put: AtomicU64,
    /// Inserts written through.
    pub entity_insert: AtomicU64,
    /// Updates written through.
    pub entity_update: AtomicU64,
    /// Single-key deletes written through.
    pub entity_delete: AtomicU64,
    /// Rows removed by bulk deletes.
    pub bulk_delete_rows: AtomicU64,
    /// Relation resolutions that went to the store.
    pub relation_fetch: AtomicU64,
    /// Key queries executed against the store.
    pub query_execution: AtomicU64,
    /// Key queries answered from the query cache.
    pub query_cache_hit: AtomicU64,
    /// Key queries not in the query cache or stale.
    pub query_cache_miss: AtomicU64,
    /// Key query results stored in the query cache.
    pub query_cache_put: AtomicU64,
}

impl Statistics {
    /// Create a zeroed collector.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn counters(&self) -> [&AtomicU64; 15] {
        [
            &self.entity_load,
            &self.store_call,
            &self.statement,
            &self.cache_hit,
            &self.cache_miss,
            &self.cache_put,
            &self.entity_insert,
            &self.entity_update,
            &self.entity_delete,
            &self.bulk_delete_rows,
            &self.relation_fetch,
            &self.query_execution,
            &self.query_cache_hit,
            &self.query_cache_miss,
            &self.query_cache_put,
        ]
    }

    /// Get current snapshot of all counters.
    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            entity_load_count: self.entity_load.load(Ordering::Relaxed),
            store_call_count: self.store_call.load(Ordering::Relaxed),
            statement_count: self.statement.load(Ordering::Relaxed),
            cache_hit_count: self.cache_hit.load(Ordering::Relaxed),
            cache_miss_count: self.cache_miss.load(Ordering::Relaxed),
            cache_put_count: self.cache_put.load(Ordering::Relaxed),
            entity_insert_count: self.entity_insert.load(Ordering::Relaxed),
            entity_update_count: self.entity_update.load(Ordering::Relaxed),
            entity_delete_count: self.entity_delete.load(Ordering::Relaxed),
            bulk_delete_row_count: self.bulk_delete_rows.load(Ordering::Relaxed),
            relation_fetch_count: self.relation_fetch.load(Ordering::Relaxed),
            query_execution_count: self.query_execution.load(Ordering::Relaxed),
            query_cache_hit_count: self.query_cache_hit.load(Ordering::Relaxed),
            query_cache_miss_count: self.query_cache_miss.load(Ordering::Relaxed),
            query_cache_put_count: self.query_cache_put.load(Ordering::Relaxed),
        }
    }

    /// Zero every counter.
    pub fn reset(&self) {
        for counter in self.counters() {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Snapshot of statistics at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatisticsSnapshot {
    pub entity_load_count: u64,
    pub store_call_count: u64,
    pub statement_count: u64,
    pub cache_hit_count: u64,
    pub cache_miss_count: u64,
    pub cache_put_count: u64,
    pub entity_insert_count: u64,
    pub entity_update_count: u64,
    pub entity_delete_count: u64,
    pub bulk_delete_row_count: u64,
    pub relation_fetch_count: u64,
    pub query_execution_count: u64,
    pub query_cache_hit_count: u64,
    pub query_cache_miss_count: u64,
    pub query_cache_put_count: u64,
}

impl fmt::Display for StatisticsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "loads={} store_calls={} statements={} hits={} misses={} puts={} \
             inserts={} updates={} deletes={} bulk_rows={} relation_fetches={} \
             queries={} query_hits={} query_misses={} query_puts={}",
            self.entity_load_count,
            self.store_call_count,
            self.statement_count,
            self.cache_hit_count,
            self.cache_miss_count,
            self.cache_put_count,
            self.entity_insert_count,
            self.entity_update_count,
            self.entity_delete_count,
            self.bulk_delete_row_count,
            self.relation_fetch_count,
            self.query_execution_count,
            self.query_cache_hit_count,
            self.query_cache_miss_count,
            self.query_cache_put_count,
        )
    }
}
