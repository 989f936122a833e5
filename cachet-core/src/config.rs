//! Configuration types

use crate::{CachetResult, ConfigError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default LMDB map size in megabytes.
pub const DEFAULT_LMDB_MAP_SIZE_MB: usize = 64;

/// How many entries a cache namespace may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CapacityPolicy {
    /// Entries leave only through explicit invalidation.
    #[default]
    Unbounded,
    /// Admitting a new key into a full namespace evicts its oldest entry.
    MaxEntriesPerNamespace(usize),
}

impl CapacityPolicy {
    /// Entry limit per namespace, if any.
    pub fn limit(&self) -> Option<usize> {
        match self {
            Self::Unbounded => None,
            Self::MaxEntriesPerNamespace(max) => Some(*max),
        }
    }
}

/// What write-through does to the cache entry of an updated record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum UpdatePolicy {
    /// Replace the entry with the new record.
    #[default]
    Replace,
    /// Evict the entry; the next read reloads it.
    Evict,
}

/// Master configuration struct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachetConfig {
    /// Capacity policy handed to the second-level cache at init.
    pub capacity: CapacityPolicy,
    /// Write-through behavior on update.
    pub update_policy: UpdatePolicy,
    /// Upper bound for one bulk store call. `None` waits indefinitely.
    pub store_timeout: Option<Duration>,
    /// Whether key-list query results are cached.
    pub query_cache_enabled: bool,
    /// Map size for LMDB-backed stores, in megabytes.
    pub lmdb_map_size_mb: usize,
}

impl Default for CachetConfig {
    fn default() -> Self {
        Self {
            capacity: CapacityPolicy::Unbounded,
            update_policy: UpdatePolicy::Replace,
            store_timeout: None,
            query_cache_enabled: true,
            lmdb_map_size_mb: DEFAULT_LMDB_MAP_SIZE_MB,
        }
    }
}

impl CachetConfig {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create CachetConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `CACHET_CACHE_MAX_ENTRIES`: per-namespace entry limit (default: unbounded)
    /// - `CACHET_UPDATE_POLICY`: `replace` or `evict` (default: replace)
    /// - `CACHET_STORE_TIMEOUT_MS`: bulk store call timeout (default: none)
    /// - `CACHET_QUERY_CACHE_ENABLED`: cache query results (default: true)
    /// - `CACHET_LMDB_MAP_SIZE_MB`: LMDB map size (default: 64)
    ///
    /// Unset or unparseable variables fall back to the default.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let capacity = std::env::var("CACHET_CACHE_MAX_ENTRIES")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(CapacityPolicy::MaxEntriesPerNamespace)
            .unwrap_or(defaults.capacity);

        let update_policy = match std::env::var("CACHET_UPDATE_POLICY")
            .ok()
            .map(|s| s.to_lowercase())
            .as_deref()
        {
            Some("evict") => UpdatePolicy::Evict,
            Some("replace") => UpdatePolicy::Replace,
            _ => defaults.update_policy,
        };

        let store_timeout = std::env::var("CACHET_STORE_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .or(defaults.store_timeout);

        let query_cache_enabled = std::env::var("CACHET_QUERY_CACHE_ENABLED")
            .ok()
            .map(|s| s.to_lowercase() != "false")
            .unwrap_or(defaults.query_cache_enabled);

        let lmdb_map_size_mb = std::env::var("CACHET_LMDB_MAP_SIZE_MB")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.lmdb_map_size_mb);

        Self {
            capacity,
            update_policy,
            store_timeout,
            query_cache_enabled,
            lmdb_map_size_mb,
        }
    }

    /// Set the capacity policy.
    pub fn with_capacity(mut self, capacity: CapacityPolicy) -> Self {
        self.capacity = capacity;
        self
    }

    /// Set the update policy.
    pub fn with_update_policy(mut self, policy: UpdatePolicy) -> Self {
        self.update_policy = policy;
        self
    }

    /// Set the bulk store call timeout.
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = Some(timeout);
        self
    }

    /// Enable or disable the query cache.
    pub fn with_query_cache(mut self, enabled: bool) -> Self {
        self.query_cache_enabled = enabled;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> CachetResult<()> {
        if self.capacity == CapacityPolicy::MaxEntriesPerNamespace(0) {
            return Err(ConfigError::InvalidValue {
                field: "capacity".to_string(),
                value: "0".to_string(),
                reason: "max entries per namespace must be positive".to_string(),
            }
            .into());
        }

        if self.store_timeout == Some(Duration::ZERO) {
            return Err(ConfigError::InvalidValue {
                field: "store_timeout".to_string(),
                value: "0ms".to_string(),
                reason: "timeout must be positive".to_string(),
            }
            .into());
        }

        if self.lmdb_map_size_mb == 0 {
            return Err(ConfigError::InvalidValue {
                field: "lmdb_map_size_mb".to_string(),
                value: "0".to_string(),
                reason: "map size must be positive".to_string(),
            }
            .into());
        }

        Ok(())
    }
}
