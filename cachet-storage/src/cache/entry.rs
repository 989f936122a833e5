//! Cache entries.

use cachet_core::Record;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// One cached record with its validity marker.
///
/// `version` is unique within a namespace and increases with every insert
/// or replacement, so the lowest version is the oldest entry.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    record: Record,
    version: u64,
    cached_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Create an entry cached now.
    pub fn new(record: Record, version: u64) -> Self {
        Self {
            record,
            version,
            cached_at: Utc::now(),
        }
    }

    /// The cached record.
    pub fn record(&self) -> &Record {
        &self.record
    }

    /// Consume the entry and return the record.
    pub fn into_record(self) -> Record {
        self.record
    }

    /// Entry version within its namespace.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// When the record entered the cache.
    pub fn cached_at(&self) -> DateTime<Utc> {
        self.cached_at
    }

    /// Time since the record entered the cache.
    pub fn age(&self) -> Duration {
        Utc::now()
            .signed_duration_since(self.cached_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}
