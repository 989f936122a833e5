//! Record snapshots and the typed entity view over them

use crate::{CachetError, CachetResult, Namespace, RecordKey};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

/// Reference from a record to records of another namespace.
///
/// Relations hold keys, never embedded records, so cyclic object graphs
/// cannot form inside the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relation {
    /// Many-to-one / one-to-one reference. `None` is a null reference.
    One {
        target: Namespace,
        key: Option<RecordKey>,
    },
    /// One-to-many / many-to-many reference.
    Many {
        target: Namespace,
        keys: BTreeSet<RecordKey>,
    },
}

impl Relation {
    /// Single reference to `key` in `target`.
    pub fn one(target: impl Into<Namespace>, key: impl Into<RecordKey>) -> Self {
        Self::One {
            target: target.into(),
            key: Some(key.into()),
        }
    }

    /// Null single reference.
    pub fn none(target: impl Into<Namespace>) -> Self {
        Self::One {
            target: target.into(),
            key: None,
        }
    }

    /// Collection reference.
    pub fn many<K: Into<RecordKey>>(
        target: impl Into<Namespace>,
        keys: impl IntoIterator<Item = K>,
    ) -> Self {
        Self::Many {
            target: target.into(),
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }

    /// Namespace the relation points into.
    pub fn target(&self) -> &Namespace {
        match self {
            Self::One { target, .. } | Self::Many { target, .. } => target,
        }
    }

    /// Every key referenced by this relation.
    pub fn keys(&self) -> BTreeSet<RecordKey> {
        match self {
            Self::One { key, .. } => key.iter().cloned().collect(),
            Self::Many { keys, .. } => keys.clone(),
        }
    }
}

/// Immutable snapshot of one entity's state plus its relation references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Identity of the record within its namespace.
    pub key: RecordKey,
    /// Entity state as a JSON object.
    pub fields: Map<String, Value>,
    /// Named relations to other namespaces.
    #[serde(default)]
    pub relations: BTreeMap<String, Relation>,
}

impl Record {
    /// Empty record with the given key.
    pub fn new(key: impl Into<RecordKey>) -> Self {
        Self {
            key: key.into(),
            fields: Map::new(),
            relations: BTreeMap::new(),
        }
    }

    /// Set a field.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Set a relation.
    pub fn with_relation(mut self, name: impl Into<String>, relation: Relation) -> Self {
        self.relations.insert(name.into(), relation);
        self
    }

    /// Read a field.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Read a relation.
    pub fn relation(&self, name: &str) -> Option<&Relation> {
        self.relations.get(name)
    }

    /// Snapshot a typed entity.
    ///
    /// The entity must serialize to a JSON object.
    pub fn from_entity<T: Entity>(entity: &T) -> CachetResult<Self> {
        let fields = match serde_json::to_value(entity) {
            Ok(Value::Object(map)) => map,
            Ok(other) => {
                return Err(CachetError::Codec {
                    reason: format!("{} did not serialize to an object: {}", T::namespace(), other),
                })
            }
            Err(e) => return Err(CachetError::Codec { reason: e.to_string() }),
        };
        Ok(Self {
            key: entity.key(),
            fields,
            relations: entity.relations(),
        })
    }

    /// Rebuild a typed entity from this snapshot.
    pub fn to_entity<T: Entity>(&self) -> CachetResult<T> {
        serde_json::from_value(Value::Object(self.fields.clone())).map_err(|e| CachetError::Codec {
            reason: format!("{} {}: {}", T::namespace(), self.key, e),
        })
    }
}

/// A Rust type that is persisted and cached as a [`Record`].
///
/// # Implementation Requirements
///
/// - `namespace()` must return the same value for all instances
/// - `key()` must be stable for the lifetime of the entity
/// - the type must serialize to a JSON object
pub trait Entity: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Namespace this entity type lives in.
    fn namespace() -> Namespace;

    /// Key of this instance.
    fn key(&self) -> RecordKey;

    /// Relation references of this instance.
    fn relations(&self) -> BTreeMap<String, Relation> {
        BTreeMap::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct City {
        id: i64,
        name: String,
        state_id: i64,
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

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Scalar(i64);

    impl Entity for Scalar {
        fn namespace() -> Namespace {
            Namespace::new("Scalar")
        }

        fn key(&self) -> RecordKey {
            RecordKey::id(self.0)
        }
    }

    #[test]
    fn test_entity_snapshot_carries_relations() {
        let city = City {
            id: 4093,
            name: "Stuttgart".to_string(),
            state_id: 8,
        };
        let record = Record::from_entity(&city).unwrap();
        assert_eq!(record.key, RecordKey::id(4093));
        assert_eq!(record.field("name"), Some(&Value::from("Stuttgart")));
        assert_eq!(
            record.relation("state").map(Relation::keys),
            Some(BTreeSet::from([RecordKey::id(8)]))
        );
        assert_eq!(record.to_entity::<City>().unwrap(), city);
    }

    #[test]
    fn test_non_object_entity_is_codec_error() {
        let err = Record::from_entity(&Scalar(1)).unwrap_err();
        assert!(matches!(err, CachetError::Codec { .. }));
    }

    #[test]
    fn test_to_entity_with_missing_field_fails() {
        let record = Record::new(1i64).with_field("id", 1);
        assert!(matches!(
            record.to_entity::<City>(),
            Err(CachetError::Codec { .. })
        ));
    }

    #[test]
    fn test_relation_keys() {
        assert!(Relation::none("State").keys().is_empty());
        let many = Relation::many("Child", [3i64, 1, 3]);
        assert_eq!(many.keys().len(), 2);
        assert_eq!(many.target(), &Namespace::new("Child"));
    }
}
