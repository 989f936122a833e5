//! Property-Based Tests for the Batched Loader and Write-Through
//!
//! Properties:
//! - A batch costs at most one store call, and none once every key is cached
//! - After any delete the record is gone from both cache and store
//! - Clearing a namespace twice evicts nothing the second time

use std::collections::BTreeSet;
use std::sync::Arc;

use cachet_core::{CachetConfig, Namespace, Predicate, Record, RecordKey};
use cachet_storage::cache::SecondLevelCache;
use cachet_storage::{CachetService, MockStore};
use cachet_test_utils::generators::{arb_key_set, arb_record};
use proptest::prelude::*;

fn ns() -> Namespace {
    Namespace::new("Item")
}

/// Service over a store holding ids 0..16; the generators ask for 0..32.
fn seeded_service() -> CachetService<MockStore> {
    let store = MockStore::new();
    store
        .seed(
            &ns(),
            (0..16i64).map(|id| Record::new(id).with_field("bucket", id % 4)),
        )
        .unwrap();
    CachetService::new(Arc::new(store), CachetConfig::default()).unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    #[test]
    fn prop_one_store_call_per_batch(batches in prop::collection::vec(arb_key_set(24), 1..6)) {
        let service = seeded_service();
        let mut cached: BTreeSet<RecordKey> = BTreeSet::new();

        for keys in &batches {
            let before = service.store().load_calls();
            let batch = service.loader().load_batch(&ns(), keys).unwrap();
            let calls = service.store().load_calls() - before;

            let requested: BTreeSet<RecordKey> = keys.iter().cloned().collect();
            let expect_call = !requested.is_subset(&cached);
            prop_assert_eq!(calls, u64::from(expect_call));
            prop_assert_eq!(batch.stats.hits + batch.stats.misses, requested.len());

            // Only keys that exist in the store are returned and cached.
            let existing: BTreeSet<RecordKey> = requested
                .iter()
                .filter(|k| matches!(k.as_id(), Some(0..=15)))
                .cloned()
                .collect();
            prop_assert_eq!(batch.len(), existing.len());
            // Absent keys are never cached, so asking again costs a call.
            cached.extend(existing);
        }
    }

    #[test]
    fn prop_deleted_records_stay_gone(doomed in arb_key_set(8)) {
        let service = seeded_service();
        let all: Vec<RecordKey> = (0..16i64).map(RecordKey::id).collect();
        service.loader().load_batch(&ns(), &all).unwrap();

        let mut removed = BTreeSet::new();
        for key in &doomed {
            let existed = service.invalidator().on_delete(&ns(), key).unwrap();
            prop_assert_eq!(existed, matches!(key.as_id(), Some(0..=15)) && !removed.contains(key));
            removed.insert(key.clone());
        }

        for key in &removed {
            prop_assert!(service.cache().get(&ns(), key).unwrap().is_none());
            prop_assert!(service.store().peek(&ns(), key).is_none());
            prop_assert!(service.loader().find(&ns(), key).unwrap().is_none());
        }
        let survivors = service.loader().load_batch(&ns(), &all).unwrap();
        prop_assert_eq!(survivors.len(), 16 - removed.iter().filter(|k| matches!(k.as_id(), Some(0..=15))).count());
    }

    #[test]
    fn prop_bulk_delete_keeps_cache_and_store_aligned(bucket in 0i64..4) {
        let service = seeded_service();
        let all: Vec<RecordKey> = (0..16i64).map(RecordKey::id).collect();
        service.loader().load_batch(&ns(), &all).unwrap();

        let outcome = service
            .invalidator()
            .on_bulk_delete(&ns(), &Predicate::field_eq("bucket", bucket))
            .unwrap();
        prop_assert_eq!(outcome.deleted, 4);

        let cached = service.cache().keys(&ns()).unwrap();
        prop_assert_eq!(cached.len(), 12);
        for key in &cached {
            prop_assert!(service.store().peek(&ns(), key).is_some());
        }
    }

    #[test]
    fn prop_clear_is_idempotent(records in prop::collection::vec(arb_record(), 0..20)) {
        let service = seeded_service();
        let items = Namespace::new("Generated");
        for record in &records {
            service.cache().put(&items, record.key.clone(), record.clone()).unwrap();
        }
        let distinct: BTreeSet<&RecordKey> = records.iter().map(|r| &r.key).collect();

        prop_assert_eq!(service.clear(&items).unwrap(), distinct.len());
        prop_assert_eq!(service.clear(&items).unwrap(), 0);
        prop_assert_eq!(service.cache().size(&items).unwrap(), 0);
    }
}
