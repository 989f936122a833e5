//! Cachet Test Utilities
//!
//! Shared test infrastructure for the Cachet workspace:
//! - Proptest generators for keys and records
//! - The postal-code fixture dataset (State <- City <- PostalCode) and
//!   cached entities with children
//! - Custom assertions for Cachet error variants
//! - A tracing subscriber for tests

// Re-export core types for convenience
pub use cachet_core::{
    CachetConfig, CachetError, CachetResult, Entity, Namespace, Predicate, Record, RecordKey,
    Relation, StoreError,
};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Install a fmt subscriber that writes through the test harness.
///
/// Honors `RUST_LOG`; defaults to `warn`. Safe to call from every test.
pub fn init_test_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

// ============================================================================
// FIXTURE ENTITIES
// ============================================================================

/// A German federal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    pub id: i64,
    pub name: String,
}

impl Entity for State {
    fn namespace() -> Namespace {
        Namespace::new("State")
    }

    fn key(&self) -> RecordKey {
        RecordKey::id(self.id)
    }
}

/// A city, referencing its state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct City {
    pub id: i64,
    pub name: String,
    pub state_id: i64,
}

impl Entity for City {
    fn namespace() -> Namespace {
        Namespace::new("City")
    }

    fn key(&self) -> RecordKey {
        RecordKey::id(self.id)
    }

    fn relations(&self) -> BTreeMap<String, Relation> {
        BTreeMap::from([("state".to_string(), Relation::one("State", self.state_id))])
    }
}

/// A postal code, keyed by its five-digit code, referencing its city.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostalCode {
    pub code: String,
    pub city_id: i64,
}

impl Entity for PostalCode {
    fn namespace() -> Namespace {
        Namespace::new("PostalCode")
    }

    fn key(&self) -> RecordKey {
        RecordKey::natural(self.code.clone())
    }

    fn relations(&self) -> BTreeMap<String, Relation> {
        BTreeMap::from([("city".to_string(), Relation::one("City", self.city_id))])
    }
}

/// A parent entity owning a collection of children.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedEntity {
    pub id: i64,
    pub name: String,
    pub children: Vec<i64>,
}

impl Entity for CachedEntity {
    fn namespace() -> Namespace {
        Namespace::new("CachedEntity")
    }

    fn key(&self) -> RecordKey {
        RecordKey::id(self.id)
    }

    fn relations(&self) -> BTreeMap<String, Relation> {
        BTreeMap::from([(
            "children".to_string(),
            Relation::many("CachedChild", self.children.iter().copied()),
        )])
    }
}

/// A child entity referencing its parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedChild {
    pub id: i64,
    pub label: String,
    pub parent_id: i64,
}

impl Entity for CachedChild {
    fn namespace() -> Namespace {
        Namespace::new("CachedChild")
    }

    fn key(&self) -> RecordKey {
        RecordKey::id(self.id)
    }

    fn relations(&self) -> BTreeMap<String, Relation> {
        BTreeMap::from([("parent".to_string(), Relation::one("CachedEntity", self.parent_id))])
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for keys, records and key sets.

    use super::*;
    use proptest::prelude::*;
    use uuid::Uuid;

    /// Generate a numeric id key.
    pub fn arb_id_key() -> impl Strategy<Value = RecordKey> {
        any::<i64>().prop_map(RecordKey::id)
    }

    /// Generate a key of any variant.
    pub fn arb_record_key() -> impl Strategy<Value = RecordKey> {
        prop_oneof![
            arb_id_key(),
            "[0-9]{5}".prop_map(RecordKey::natural),
            any::<[u8; 16]>().prop_map(|b| RecordKey::from(Uuid::from_bytes(b))),
        ]
    }

    /// Generate a namespace name.
    pub fn arb_namespace() -> impl Strategy<Value = Namespace> {
        "[A-Z][a-zA-Z]{2,12}".prop_map(Namespace::new)
    }

    /// Generate a record with a few scalar fields.
    pub fn arb_record() -> impl Strategy<Value = Record> {
        (arb_record_key(), "[a-z ]{0,16}", any::<i32>(), any::<bool>()).prop_map(
            |(key, name, count, flag)| {
                Record::new(key)
                    .with_field("name", name)
                    .with_field("count", count)
                    .with_field("flag", flag)
            },
        )
    }

    /// Generate a list of small id keys, duplicates likely.
    pub fn arb_key_set(max_len: usize) -> impl Strategy<Value = Vec<RecordKey>> {
        prop::collection::vec((0i64..32).prop_map(RecordKey::id), 0..=max_len)
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! The postal-code dataset and cached-entity fixtures.

    use super::*;

    /// Id of the city of Stuttgart.
    pub const STUTTGART: i64 = 4093;

    /// Sixteen postal codes, all in Stuttgart.
    pub const CODES_IN_STUTTGART: [u32; 16] = [
        70173, 70174, 70176, 70178, 70180, 70182, 70184, 70186, 70188, 70190, 70191, 70192, 70193,
        70195, 70197, 70565,
    ];

    /// Sixteen postal codes, one per state, each in a different city.
    pub const CODES_ACROSS_STATES: [u32; 16] = [
        1067, 1945, 4600, 6108, 10115, 17033, 19273, 20095, 21465, 27568, 32049, 34117, 51598,
        63739, 70565, 66111,
    ];

    const STATES: [(i64, &str); 16] = [
        (1, "Baden-Württemberg"),
        (2, "Bayern"),
        (3, "Berlin"),
        (4, "Brandenburg"),
        (5, "Bremen"),
        (6, "Hamburg"),
        (7, "Hessen"),
        (8, "Mecklenburg-Vorpommern"),
        (9, "Niedersachsen"),
        (10, "Nordrhein-Westfalen"),
        (11, "Rheinland-Pfalz"),
        (12, "Saarland"),
        (13, "Sachsen"),
        (14, "Sachsen-Anhalt"),
        (15, "Schleswig-Holstein"),
        (16, "Thüringen"),
    ];

    /// (city id, name, state id, postal code in `CODES_ACROSS_STATES`)
    const CITIES: [(i64, &str, i64, u32); 16] = [
        (1001, "Dresden", 13, 1067),
        (1002, "Ruhland", 4, 1945),
        (1003, "Altenburg", 16, 4600),
        (1004, "Halle (Saale)", 14, 6108),
        (1005, "Berlin", 3, 10115),
        (1006, "Neubrandenburg", 8, 17033),
        (1007, "Amt Neuhaus", 9, 19273),
        (1008, "Hamburg", 6, 20095),
        (1009, "Reinbek", 15, 21465),
        (1010, "Bremerhaven", 5, 27568),
        (1011, "Herford", 10, 32049),
        (1012, "Kassel", 7, 34117),
        (1013, "Friesenhagen", 11, 51598),
        (1014, "Aschaffenburg", 2, 63739),
        (STUTTGART, "Stuttgart", 1, 70565),
        (1015, "Saarbrücken", 12, 66111),
    ];

    /// Five-digit natural key of a postal code.
    pub fn postal_key(code: u32) -> RecordKey {
        RecordKey::natural(format!("{:05}", code))
    }

    /// Keys of [`CODES_IN_STUTTGART`].
    pub fn codes_in_stuttgart() -> Vec<RecordKey> {
        CODES_IN_STUTTGART.iter().copied().map(postal_key).collect()
    }

    /// Keys of [`CODES_ACROSS_STATES`].
    pub fn codes_across_states() -> Vec<RecordKey> {
        CODES_ACROSS_STATES.iter().copied().map(postal_key).collect()
    }

    /// States, cities and postal codes of both code lists.
    #[derive(Debug, Clone)]
    pub struct GeoDataset {
        pub states: Vec<State>,
        pub cities: Vec<City>,
        pub postal_codes: Vec<PostalCode>,
    }

    impl GeoDataset {
        /// Build the dataset.
        pub fn new() -> Self {
            let states = STATES
                .iter()
                .map(|(id, name)| State {
                    id: *id,
                    name: name.to_string(),
                })
                .collect();
            let cities = CITIES
                .iter()
                .map(|(id, name, state_id, _)| City {
                    id: *id,
                    name: name.to_string(),
                    state_id: *state_id,
                })
                .collect();

            let mut postal_codes: Vec<PostalCode> = CITIES
                .iter()
                .map(|(city_id, _, _, code)| PostalCode {
                    code: format!("{:05}", code),
                    city_id: *city_id,
                })
                .collect();
            // 70565 is already present from the per-state list.
            postal_codes.extend(
                CODES_IN_STUTTGART
                    .iter()
                    .filter(|code| !CODES_ACROSS_STATES.contains(code))
                    .map(|code| PostalCode {
                        code: format!("{:05}", code),
                        city_id: STUTTGART,
                    }),
            );

            Self {
                states,
                cities,
                postal_codes,
            }
        }

        /// Every record, grouped by namespace.
        pub fn records(&self) -> CachetResult<Vec<(Namespace, Vec<Record>)>> {
            Ok(vec![
                (State::namespace(), to_records(&self.states)?),
                (City::namespace(), to_records(&self.cities)?),
                (PostalCode::namespace(), to_records(&self.postal_codes)?),
            ])
        }
    }

    impl Default for GeoDataset {
        fn default() -> Self {
            Self::new()
        }
    }

    /// Three parents (ids 1, 2, 3) and their children.
    pub fn cached_entities() -> (Vec<CachedEntity>, Vec<CachedChild>) {
        let layout: [(i64, &[i64]); 3] = [(1, &[10, 11]), (2, &[20, 21]), (3, &[30])];
        let mut parents = Vec::new();
        let mut children = Vec::new();
        for (id, child_ids) in layout {
            parents.push(CachedEntity {
                id,
                name: format!("entity {}", id),
                children: child_ids.to_vec(),
            });
            children.extend(child_ids.iter().map(|child_id| CachedChild {
                id: *child_id,
                label: format!("child {}", child_id),
                parent_id: id,
            }));
        }
        (parents, children)
    }

    /// Snapshot many entities.
    pub fn to_records<T: Entity>(entities: &[T]) -> CachetResult<Vec<Record>> {
        entities.iter().map(Record::from_entity).collect()
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertion functions for Cachet error variants.

    use super::*;

    /// Assert that a CachetResult is Ok.
    #[track_caller]
    pub fn assert_ok<T: std::fmt::Debug>(result: &CachetResult<T>) {
        assert!(result.is_ok(), "Expected Ok, got Err: {:?}", result);
    }

    /// Assert that a CachetResult is a Store error.
    #[track_caller]
    pub fn assert_store_error<T: std::fmt::Debug>(result: &CachetResult<T>) {
        match result {
            Err(CachetError::Store(_)) => {}
            other => panic!("Expected Store error, got: {:?}", other),
        }
    }

    /// Assert that a CachetResult is a store timeout.
    #[track_caller]
    pub fn assert_timeout<T: std::fmt::Debug>(result: &CachetResult<T>) {
        match result {
            Err(CachetError::Store(StoreError::Timeout { .. })) => {}
            other => panic!("Expected Timeout error, got: {:?}", other),
        }
    }

    /// Assert that a CachetResult is an InvalidationFailed error.
    #[track_caller]
    pub fn assert_invalidation_failed<T: std::fmt::Debug>(result: &CachetResult<T>) {
        match result {
            Err(CachetError::InvalidationFailed { .. }) => {}
            other => panic!("Expected InvalidationFailed error, got: {:?}", other),
        }
    }

    /// Assert that a CachetResult is a KeyMismatch error.
    #[track_caller]
    pub fn assert_key_mismatch<T: std::fmt::Debug>(result: &CachetResult<T>) {
        match result {
            Err(CachetError::KeyMismatch { .. }) => {}
            other => panic!("Expected KeyMismatch error, got: {:?}", other),
        }
    }

    /// Assert that records carry exactly `expected` keys, in order.
    #[track_caller]
    pub fn assert_keys(records: &[Record], expected: &[RecordKey]) {
        let actual: Vec<&RecordKey> = records.iter().map(|r| &r.key).collect();
        let expected: Vec<&RecordKey> = expected.iter().collect();
        assert_eq!(actual, expected, "Record keys differ");
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_geo_dataset_shape() {
        let geo = fixtures::GeoDataset::new();
        assert_eq!(geo.states.len(), 16);
        assert_eq!(geo.cities.len(), 16);
        assert_eq!(geo.postal_codes.len(), 31);

        let states: BTreeSet<i64> = geo.cities.iter().map(|c| c.state_id).collect();
        assert_eq!(states.len(), 16);
    }

    #[test]
    fn test_postal_code_relations() {
        let geo = fixtures::GeoDataset::new();
        let stuttgart = geo
            .postal_codes
            .iter()
            .find(|p| p.code == "70173")
            .unwrap();
        let record = Record::from_entity(stuttgart).unwrap();
        assert_eq!(record.key, fixtures::postal_key(70173));
        assert_eq!(
            record.relation("city"),
            Some(&Relation::one("City", fixtures::STUTTGART))
        );
        assert_eq!(fixtures::postal_key(1067), RecordKey::natural("01067"));
    }

    #[test]
    fn test_cached_entities_layout() {
        let (parents, children) = fixtures::cached_entities();
        assert_eq!(parents.len(), 3);
        assert_eq!(children.len(), 5);
        let record = Record::from_entity(&parents[0]).unwrap();
        assert_eq!(
            record.relation("children").map(Relation::keys),
            Some(BTreeSet::from([RecordKey::id(10), RecordKey::id(11)]))
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        #[test]
        fn prop_generated_record_round_trips_through_json(record in generators::arb_record()) {
            let json = serde_json::to_string(&record).unwrap();
            let back: Record = serde_json::from_str(&json).unwrap();
            prop_assert_eq!(back, record);
        }

        #[test]
        fn prop_key_sets_stay_small(keys in generators::arb_key_set(40)) {
            prop_assert!(keys.len() <= 40);
            prop_assert!(keys.iter().all(|k| matches!(k.as_id(), Some(0..=31))));
        }
    }
}
