//! The full service over an LMDB-backed store.

use std::sync::Arc;

use cachet_core::{CachetConfig, Entity, Predicate, RecordKey};
use cachet_storage::{CachetService, EvictionScope, KeyQuery, LmdbStore, QueryKey};
use cachet_test_utils::fixtures::{codes_across_states, postal_key, GeoDataset};
use cachet_test_utils::{init_test_tracing, City, PostalCode, State};
use tempfile::TempDir;

fn lmdb_service(dir: &TempDir) -> CachetService<LmdbStore> {
    init_test_tracing();
    let config = CachetConfig::default();
    let store = LmdbStore::from_config(dir.path(), &config).unwrap();
    CachetService::new(Arc::new(store), config).unwrap()
}

fn insert_geo(service: &CachetService<LmdbStore>) {
    let geo = GeoDataset::new();
    for state in &geo.states {
        service.insert(state).unwrap();
    }
    for city in &geo.cities {
        service.insert(city).unwrap();
    }
    for code in &geo.postal_codes {
        service.insert(code).unwrap();
    }
}

#[test]
fn test_fetch_join_over_lmdb() {
    let dir = TempDir::new().unwrap();
    {
        let service = lmdb_service(&dir);
        insert_geo(&service);
    }

    // A fresh service starts with a cold cache over the same files.
    let service = lmdb_service(&dir);
    let batch = service
        .loader()
        .load_with(&PostalCode::namespace(), &codes_across_states(), &["city.state"])
        .unwrap();
    assert_eq!(batch.len(), 16);
    assert_eq!(batch.stats.store_calls, 3);
    assert_eq!(service.statistics().entity_load_count, 48);

    let state: Option<State> = service.find(16i64).unwrap();
    assert_eq!(state.map(|s| s.name), Some("Thüringen".to_string()));
    assert_eq!(service.statistics().store_call_count, 3);
}

#[test]
fn test_write_through_over_lmdb() {
    let dir = TempDir::new().unwrap();
    let service = lmdb_service(&dir);
    insert_geo(&service);

    let mut city: City = service.find(1001i64).unwrap().unwrap();
    city.name = "Dresden (Elbe)".to_string();
    service.save(&city).unwrap();
    service.clear(&City::namespace()).unwrap();

    let reloaded: City = service.find(1001i64).unwrap().unwrap();
    assert_eq!(reloaded.name, "Dresden (Elbe)");

    let outcome = service
        .invalidator()
        .on_bulk_delete(&PostalCode::namespace(), &Predicate::field_eq("city_id", 4093))
        .unwrap();
    assert_eq!(outcome.deleted, 16);
    assert!(matches!(outcome.evicted, EvictionScope::Keys(ref keys) if keys.len() == 16));
    assert_eq!(service.find::<PostalCode>(postal_key(70173)).unwrap(), None);
    assert!(service.find::<PostalCode>(postal_key(1067)).unwrap().is_some());
}

#[test]
fn test_query_cache_over_lmdb() {
    let dir = TempDir::new().unwrap();
    let service = lmdb_service(&dir);
    insert_geo(&service);

    let query = KeyQuery::new(
        QueryKey::new("cities_by_state").param("state_id", 13),
        City::namespace(),
        Predicate::field_eq("state_id", 13),
    );
    let first = service.execute(&query).unwrap();
    assert_eq!(first.keys, vec![RecordKey::id(1001)]);
    let second = service.execute(&query).unwrap();
    assert!(second.from_cache);
    assert_eq!(service.statistics().query_execution_count, 1);
}
