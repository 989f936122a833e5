//! Error types for Cachet operations

use crate::{Namespace, RecordKey};
use std::time::Duration;
use thiserror::Error;

/// Backing store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Store unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Store call on {namespace} timed out after {elapsed:?} (limit {limit:?})")]
    Timeout {
        namespace: Namespace,
        elapsed: Duration,
        limit: Duration,
    },

    #[error("Write failed for {namespace} {key}: {reason}")]
    WriteFailed {
        namespace: Namespace,
        key: RecordKey,
        reason: String,
    },

    #[error("Record already exists: {namespace} {key}")]
    Conflict { namespace: Namespace, key: RecordKey },

    #[error("Store backend error: {reason}")]
    Backend { reason: String },
}

/// Second-level cache errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Cache unavailable")]
    Unavailable,

    #[error("Cache lock poisoned")]
    LockPoisoned,
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all Cachet errors.
#[derive(Debug, Clone, Error)]
pub enum CachetError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// The store write succeeded but the cache could not be brought in line.
    /// Readers may observe the previous value until the entry is evicted.
    #[error("Invalidation failed for {namespace} {target}: {reason}")]
    InvalidationFailed {
        namespace: Namespace,
        /// Affected key, or `*` for the whole namespace.
        target: String,
        reason: String,
    },

    #[error("Key mismatch in {namespace}: expected {expected}, record has {found}")]
    KeyMismatch {
        namespace: Namespace,
        expected: RecordKey,
        found: RecordKey,
    },

    #[error("Record {key} has no relation named {relation}")]
    UnknownRelation { key: RecordKey, relation: String },

    #[error("Codec error: {reason}")]
    Codec { reason: String },
}

impl CachetError {
    /// True for errors raised by the backing store.
    pub fn is_store_error(&self) -> bool {
        matches!(self, Self::Store(_))
    }
}

/// Result type alias for Cachet operations.
pub type CachetResult<T> = Result<T, CachetError>;

/// Result type alias for backing store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Result type alias for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

// =============================================================================
// TESTS
// =============================================================================
