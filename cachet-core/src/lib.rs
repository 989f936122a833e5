//! Cachet Core - Record, Key and Error Types
//!
//! Pure data structures shared by every Cachet crate: namespaces and keys,
//! record snapshots with relation references, the predicate language used
//! by bulk deletes and key queries, configuration, and the error taxonomy.
//! This crate contains no caching or storage logic.

pub mod config;
pub mod error;
pub mod identity;
pub mod predicate;
pub mod record;

pub use config::{CachetConfig, CapacityPolicy, UpdatePolicy, DEFAULT_LMDB_MAP_SIZE_MB};
pub use error::{
    CacheError, CacheResult, CachetError, CachetResult, ConfigError, StoreError, StoreResult,
};
pub use identity::{Namespace, RecordKey, Timestamp};
pub use predicate::{CustomPredicate, FieldOperator, Predicate};
pub use record::{Entity, Record, Relation};
