//! Batched loading against the postal-code dataset.
//!
//! Counts store calls, entity loads and relation fetches for the query
//! shapes that matter: single-key finds, batched key lists, fetch-joins
//! and relation traversal with and without prefetching.

use std::sync::Arc;
use std::time::Duration;

use cachet_core::{CachetConfig, Entity, Predicate, RecordKey};
use cachet_storage::{CachetService, MockStore, RecordRef};
use cachet_test_utils::assertions::{assert_keys, assert_store_error, assert_timeout};
use cachet_test_utils::fixtures::{
    codes_across_states, codes_in_stuttgart, postal_key, GeoDataset, STUTTGART,
};
use cachet_test_utils::{init_test_tracing, City, PostalCode, State};

fn geo_service(config: CachetConfig) -> CachetService<MockStore> {
    init_test_tracing();
    let store = MockStore::new();
    for (namespace, records) in GeoDataset::new().records().unwrap() {
        store.seed(&namespace, records).unwrap();
    }
    CachetService::new(Arc::new(store), config).unwrap()
}

#[test]
fn test_sixteen_keys_one_store_call() {
    let service = geo_service(CachetConfig::default());
    let codes: Vec<PostalCode> = service
        .loader()
        .load_entities(&codes_in_stuttgart())
        .unwrap();

    assert_eq!(codes.len(), 16);
    assert!(codes.iter().all(|c| c.city_id == STUTTGART));
    assert_eq!(service.store().load_calls(), 1);

    let stats = service.statistics();
    assert_eq!(stats.entity_load_count, 16);
    assert_eq!(stats.store_call_count, 1);
    assert_eq!(stats.cache_miss_count, 16);
    assert_eq!(stats.cache_put_count, 16);
}

#[test]
fn test_second_load_served_from_cache() {
    let service = geo_service(CachetConfig::default());
    let keys = codes_in_stuttgart();
    service
        .loader()
        .load_batch(&PostalCode::namespace(), &keys)
        .unwrap();
    let again = service
        .loader()
        .load_batch(&PostalCode::namespace(), &keys)
        .unwrap();

    assert_eq!(again.len(), 16);
    assert_eq!(again.stats.hits, 16);
    assert_eq!(again.stats.store_calls, 0);
    assert_eq!(service.store().load_calls(), 1);
}

#[test]
fn test_fetch_join_same_city() {
    let service = geo_service(CachetConfig::default());
    let batch = service
        .loader()
        .load_with(&PostalCode::namespace(), &codes_in_stuttgart(), &["city.state"])
        .unwrap();

    assert_eq!(batch.len(), 16);
    // Postal codes, one city, one state.
    assert_eq!(batch.stats.store_calls, 3);
    assert_eq!(service.statistics().entity_load_count, 18);
}

#[test]
fn test_fetch_join_across_states() {
    let service = geo_service(CachetConfig::default());
    let batch = service
        .loader()
        .load_with(&PostalCode::namespace(), &codes_across_states(), &["city.state"])
        .unwrap();

    assert_eq!(batch.len(), 16);
    assert_eq!(batch.stats.store_calls, 3);
    assert_eq!(service.statistics().entity_load_count, 48);

    let log = service.store().load_log();
    assert_eq!(log.len(), 3);
    assert_eq!(log[1].0, City::namespace());
    assert_eq!(log[1].1.len(), 16);
    assert_eq!(log[2].0, State::namespace());
    assert_eq!(log[2].1.len(), 16);
}

#[test]
fn test_relation_traversal_without_prefetch_is_n_plus_one() {
    let service = geo_service(CachetConfig::default());
    let loader = service.loader();
    let codes = loader
        .load_batch(&PostalCode::namespace(), &codes_across_states())
        .unwrap();

    for record in codes.records.values() {
        let city = loader.resolve_one(record, "city").unwrap();
        assert!(city.is_some());
    }

    let stats = service.statistics();
    assert_eq!(stats.relation_fetch_count, 16);
    assert_eq!(stats.store_call_count, 17);
}

#[test]
fn test_relation_traversal_after_prefetch_hits_cache() {
    let service = geo_service(CachetConfig::default());
    let loader = service.loader();
    let codes = loader
        .load_with(&PostalCode::namespace(), &codes_across_states(), &["city"])
        .unwrap();

    for record in codes.records.values() {
        let city = loader.resolve_one(record, "city").unwrap().unwrap();
        let city: City = city.to_entity().unwrap();
        assert_eq!(Some(city.id), record.field("city_id").and_then(|v| v.as_i64()));
    }

    let stats = service.statistics();
    assert_eq!(stats.relation_fetch_count, 0);
    assert_eq!(stats.store_call_count, 2);
}

#[test]
fn test_prefetch_other_namespace_first() {
    let service = geo_service(CachetConfig::default());
    let loader = service.loader();
    let cities: Vec<RecordKey> = GeoDataset::new()
        .cities
        .iter()
        .map(Entity::key)
        .collect();
    loader.load_batch(&City::namespace(), &cities).unwrap();

    let batch = loader
        .load_with(&PostalCode::namespace(), &codes_in_stuttgart(), &["city"])
        .unwrap();
    assert_eq!(batch.stats.store_calls, 1);
    assert_eq!(service.store().load_calls(), 2);
    assert_eq!(service.statistics().relation_fetch_count, 0);
}

#[test]
fn test_record_ref_loads_lazily() {
    let service = geo_service(CachetConfig::default());
    let reference = RecordRef::of::<PostalCode>(postal_key(1067));
    assert_eq!(service.store().load_calls(), 0);

    let record = reference.load(service.loader()).unwrap().unwrap();
    assert_eq!(record.key, RecordKey::natural("01067"));
    assert_eq!(service.store().load_calls(), 1);
}

#[test]
fn test_query_materializes_in_key_order() {
    let service = geo_service(CachetConfig::default());
    let records = service
        .loader()
        .query(&City::namespace(), &Predicate::field_eq("state_id", 1))
        .unwrap();
    assert_keys(&records, &[RecordKey::id(STUTTGART)]);

    let stats = service.statistics();
    assert_eq!(stats.query_execution_count, 1);
    assert_eq!(stats.store_call_count, 1);
}

#[test]
fn test_store_failure_leaves_cache_untouched() {
    let service = geo_service(CachetConfig::default());
    service.store().fail_next_loads(1);

    let result = service
        .loader()
        .load_batch(&PostalCode::namespace(), &codes_in_stuttgart());
    assert_store_error(&result);
    assert_eq!(service.statistics().cache_put_count, 0);

    let batch = service
        .loader()
        .load_batch(&PostalCode::namespace(), &codes_in_stuttgart())
        .unwrap();
    assert_eq!(batch.stats.misses, 16);
    assert_eq!(batch.len(), 16);
}

#[test]
fn test_slow_store_times_out() {
    let service = geo_service(CachetConfig::default().with_store_timeout(Duration::from_millis(20)));
    service.store().set_latency(Some(Duration::from_millis(200)));

    let result = service
        .loader()
        .load_batch(&City::namespace(), &[RecordKey::id(STUTTGART)]);
    assert_timeout(&result);

    // The late result must not reach the cache.
    std::thread::sleep(Duration::from_millis(300));
    service.store().set_latency(None);
    let batch = service
        .loader()
        .load_batch(&City::namespace(), &[RecordKey::id(STUTTGART)])
        .unwrap();
    assert_eq!(batch.stats.hits, 0);
    assert_eq!(batch.stats.store_calls, 1);
}

#[test]
fn test_store_only_while_cache_down() {
    let service = geo_service(CachetConfig::default());
    service.shutdown().unwrap();

    let keys = codes_in_stuttgart();
    for _ in 0..2 {
        let batch = service
            .loader()
            .load_batch(&PostalCode::namespace(), &keys)
            .unwrap();
        assert_eq!(batch.len(), 16);
    }
    assert_eq!(service.store().load_calls(), 2);
    assert_eq!(service.statistics().cache_put_count, 0);
}
