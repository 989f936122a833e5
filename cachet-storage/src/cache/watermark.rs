//! Update watermarks for query-result invalidation.
//!
//! Every committed write to a namespace advances that namespace's
//! watermark. A cached query result remembers the watermarks of the
//! namespaces it reads from; if any of them moved, the result is stale.

use cachet_core::{CacheError, CacheResult, Namespace};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

/// Snapshot of watermarks for a set of namespaces.
pub type WatermarkSnapshot = BTreeMap<Namespace, u64>;

/// Per-namespace write watermarks, shared by invalidators and the query cache.
///
/// A watermark is a sequence number starting at 0 (no writes) and
/// incremented by every committed write.
#[derive(Debug, Default)]
pub struct UpdateWatermarks {
    marks: RwLock<HashMap<Namespace, u64>>,
}

impl UpdateWatermarks {
    /// Create an empty set of watermarks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a committed write to `namespace`.
    pub fn advance(&self, namespace: &Namespace) -> CacheResult<u64> {
        let mut marks = self.marks.write().map_err(|_| CacheError::LockPoisoned)?;
        let sequence = marks.entry(namespace.clone()).or_insert(0);
        *sequence += 1;
        Ok(*sequence)
    }

    /// Current watermark of a namespace.
    pub fn current(&self, namespace: &Namespace) -> CacheResult<u64> {
        let marks = self.marks.read().map_err(|_| CacheError::LockPoisoned)?;
        Ok(marks.get(namespace).copied().unwrap_or(0))
    }

    /// Sequences of the given namespaces, taken under one lock.
    pub fn snapshot<'a>(
        &self,
        namespaces: impl IntoIterator<Item = &'a Namespace>,
    ) -> CacheResult<WatermarkSnapshot> {
        let marks = self.marks.read().map_err(|_| CacheError::LockPoisoned)?;
        Ok(namespaces
            .into_iter()
            .map(|ns| {
                (ns.clone(), marks.get(ns).copied().unwrap_or(0))
            })
            .collect())
    }

    /// Whether any namespace in `snapshot` was written since it was taken.
    pub fn is_stale(&self, snapshot: &WatermarkSnapshot) -> CacheResult<bool> {
        let marks = self.marks.read().map_err(|_| CacheError::LockPoisoned)?;
        Ok(snapshot.iter().any(|(ns, sequence)| {
            marks.get(ns).copied().unwrap_or(0) != *sequence
        }))
    }
}
