//! Cachet service.
//!
//! Bundles one store, one process-wide cache and the components that
//! share them. Reads go through the batched loader; writes pass through
//! to the store and are written through to the cache before returning.

use std::sync::Arc;

use cachet_core::{CachetConfig, CachetResult, Entity, Namespace, Record, RecordKey};

use crate::cache::{InMemoryCache, SecondLevelCache, UpdateWatermarks};
use crate::invalidator::WriteThroughInvalidator;
use crate::loader::BatchedLoader;
use crate::query_cache::{KeyQuery, QueryCache, QueryResult};
use crate::stats::{Statistics, StatisticsSnapshot};
use crate::BackingStore;

/// Store, cache, loader, invalidator and query cache wired together.
///
/// # Usage
///
/// ```ignore
/// let service = CachetService::new(Arc::new(store), CachetConfig::from_env())?;
/// let codes = service.loader().load_with(&ns, &keys, &["city.state"])?;
/// service.save(&updated_city)?;
/// service.shutdown()?;
/// ```
pub struct CachetService<S: ?Sized> {
    config: CachetConfig,
    cache: Arc<InMemoryCache>,
    stats: Arc<Statistics>,
    loader: BatchedLoader<S, InMemoryCache>,
    invalidator: WriteThroughInvalidator<S, InMemoryCache>,
    queries: QueryCache,
}

impl<S> CachetService<S>
where
    S: BackingStore + ?Sized + 'static,
{
    /// Validate `config` and build a running service around `store`.
    pub fn new(store: Arc<S>, config: CachetConfig) -> CachetResult<Self> {
        config.validate()?;

        let cache = Arc::new(InMemoryCache::new(config.capacity));
        let stats = Arc::new(Statistics::new());
        let watermarks = Arc::new(UpdateWatermarks::new());

        let loader = BatchedLoader::new(Arc::clone(&store), Arc::clone(&cache), Arc::clone(&stats))
            .with_config(&config);
        let invalidator = WriteThroughInvalidator::new(
            store,
            Arc::clone(&cache),
            Arc::clone(&stats),
            Arc::clone(&watermarks),
        )
        .with_config(&config);
        let queries = QueryCache::new(watermarks, Arc::clone(&stats)).with_config(&config);

        tracing::info!(
            capacity = ?config.capacity,
            update_policy = ?config.update_policy,
            store_timeout_ms = config.store_timeout.map(|t| t.as_millis() as u64),
            query_cache_enabled = config.query_cache_enabled,
            "Cachet service started"
        );
        Ok(Self {
            config,
            cache,
            stats,
            loader,
            invalidator,
            queries,
        })
    }

    pub fn config(&self) -> &CachetConfig {
        &self.config
    }

    pub fn loader(&self) -> &BatchedLoader<S, InMemoryCache> {
        &self.loader
    }

    pub fn invalidator(&self) -> &WriteThroughInvalidator<S, InMemoryCache> {
        &self.invalidator
    }

    pub fn queries(&self) -> &QueryCache {
        &self.queries
    }

    pub fn cache(&self) -> &Arc<InMemoryCache> {
        &self.cache
    }

    pub fn store(&self) -> &Arc<S> {
        self.loader.store()
    }

    /// Current statistics.
    pub fn statistics(&self) -> StatisticsSnapshot {
        self.stats.snapshot()
    }

    /// Zero every statistics counter.
    pub fn reset_statistics(&self) {
        self.stats.reset();
    }

    /// (Re)start the cache with the configured capacity policy.
    pub fn init(&self) -> CachetResult<()> {
        self.cache.init(self.config.capacity)?;
        Ok(())
    }

    /// Stop the cache and drop cached query results.
    ///
    /// Until [`CachetService::init`] the service runs store-only.
    pub fn shutdown(&self) -> CachetResult<usize> {
        let dropped = self.cache.shutdown()?;
        self.queries.clear()?;
        Ok(dropped)
    }

    /// Drop every cached record of a namespace.
    pub fn clear(&self, namespace: &Namespace) -> CachetResult<usize> {
        Ok(self.cache.clear(namespace)?)
    }

    /// Load a typed entity.
    pub fn find<T: Entity>(&self, key: impl Into<RecordKey>) -> CachetResult<Option<T>> {
        self.loader.find_entity(key)
    }

    /// Insert a typed entity.
    pub fn insert<T: Entity>(&self, entity: &T) -> CachetResult<()> {
        self.invalidator
            .on_insert(&T::namespace(), Record::from_entity(entity)?)
    }

    /// Update a typed entity.
    pub fn save<T: Entity>(&self, entity: &T) -> CachetResult<()> {
        self.invalidator
            .on_update(&T::namespace(), &entity.key(), Record::from_entity(entity)?)
    }

    /// Delete a typed entity by key.
    pub fn delete<T: Entity>(&self, key: impl Into<RecordKey>) -> CachetResult<bool> {
        self.invalidator.on_delete(&T::namespace(), &key.into())
    }

    /// Run a key query through the query cache.
    pub fn execute(&self, query: &KeyQuery) -> CachetResult<QueryResult> {
        self.queries.execute(&self.loader, query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MockStore;
    use cachet_core::{CapacityPolicy, CachetError, ConfigError, UpdatePolicy};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Counter {
        id: i64,
        value: i64,
    }

    impl Entity for Counter {
        fn namespace() -> Namespace {
            Namespace::new("Counter")
        }

        fn key(&self) -> RecordKey {
            RecordKey::id(self.id)
        }
    }

    fn service(config: CachetConfig) -> CachetService<MockStore> {
        CachetService::new(Arc::new(MockStore::new()), config).unwrap()
    }

    #[test]
    fn test_rejects_invalid_config() {
        let config =
            CachetConfig::default().with_capacity(CapacityPolicy::MaxEntriesPerNamespace(0));
        let err = CachetService::new(Arc::new(MockStore::new()), config)
            .err()
            .unwrap();
        assert!(matches!(err, CachetError::Config(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_typed_write_through_round_trip() {
        let service = service(CachetConfig::default());
        service.insert(&Counter { id: 1, value: 0 }).unwrap();
        service.save(&Counter { id: 1, value: 5 }).unwrap();

        let found: Option<Counter> = service.find(1i64).unwrap();
        assert_eq!(found, Some(Counter { id: 1, value: 5 }));
        // Insert warmed the cache, so the read never reached the store.
        assert_eq!(service.store().load_calls(), 0);

        assert!(service.delete::<Counter>(1i64).unwrap());
        assert_eq!(service.find::<Counter>(1i64).unwrap(), None);
        let stats = service.statistics();
        assert_eq!(stats.entity_insert_count, 1);
        assert_eq!(stats.entity_update_count, 1);
        assert_eq!(stats.entity_delete_count, 1);
    }

    #[test]
    fn test_evict_policy_from_config() {
        let service = service(CachetConfig::default().with_update_policy(UpdatePolicy::Evict));
        service.insert(&Counter { id: 1, value: 0 }).unwrap();
        assert_eq!(service.cache().size(&Counter::namespace()).unwrap(), 0);

        let found: Option<Counter> = service.find(1i64).unwrap();
        assert_eq!(found.map(|c| c.value), Some(0));
        assert_eq!(service.store().load_calls(), 1);
    }

    #[test]
    fn test_shutdown_then_init() {
        let service = service(CachetConfig::default());
        service.insert(&Counter { id: 1, value: 0 }).unwrap();
        assert_eq!(service.shutdown().unwrap(), 1);

        // Store-only while down.
        assert!(service.find::<Counter>(1i64).unwrap().is_some());
        assert_eq!(service.store().load_calls(), 1);

        service.init().unwrap();
        service.find::<Counter>(1i64).unwrap();
        service.find::<Counter>(1i64).unwrap();
        assert_eq!(service.store().load_calls(), 2);
    }
}
