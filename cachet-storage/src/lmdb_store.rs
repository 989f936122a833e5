//! LMDB-backed record store.
//!
//! Uses the heed crate (Rust bindings for LMDB) to provide a durable,
//! memory-mapped [`BackingStore`]. Records are stored as serde_json bytes
//! under [`NamespacedKey`] binary keys.
//!
//! # Transactions
//!
//! - `load_many` and `select_keys` run in one read transaction, so a bulk
//!   fetch sees one consistent snapshot
//! - every write runs in one write transaction and commits before returning

use std::collections::HashMap;
use std::path::Path;

use cachet_core::{CachetConfig, Namespace, Predicate, Record, RecordKey, StoreError, StoreResult};
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions, RoTxn};

use crate::store_key::NamespacedKey;
use crate::{BackingStore, DeleteOutcome};

/// Error type for LMDB store operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbStoreError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open the database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    /// Transaction error.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LmdbStoreError> for StoreError {
    fn from(e: LmdbStoreError) -> Self {
        StoreError::Backend {
            reason: e.to_string(),
        }
    }
}

fn txn_err(e: heed::Error) -> LmdbStoreError {
    LmdbStoreError::Transaction(e.to_string())
}

/// LMDB-backed [`BackingStore`].
///
/// `Native` predicates are rejected: this store only evaluates predicates
/// it can test record by record.
///
/// # Example
///
/// ```ignore
/// let store = LmdbStore::open("/var/lib/cachet", 64)?;
/// store.insert(&Namespace::new("State"), &record)?;
/// let found = store.load_many(&Namespace::new("State"), &keys)?;
/// ```
pub struct LmdbStore {
    /// The LMDB environment.
    env: Env,
    /// The main database (single unnamed database).
    db: Database<Bytes, Bytes>,
}

impl std::fmt::Debug for LmdbStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LmdbStore")
            .field("path", &self.env.path())
            .finish_non_exhaustive()
    }
}

impl LmdbStore {
    /// Open (or create) a store.
    ///
    /// # Arguments
    ///
    /// * `path` - Directory where LMDB files will be stored
    /// * `map_size_mb` - Maximum size of the database in megabytes
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory cannot be created
    /// - LMDB environment cannot be opened
    /// - Database cannot be created
    pub fn open<P: AsRef<Path>>(path: P, map_size_mb: usize) -> Result<Self, LmdbStoreError> {
        std::fs::create_dir_all(&path)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size_mb * 1024 * 1024)
                .max_dbs(1)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbStoreError::EnvOpen(e.to_string()))?;

        let mut wtxn = env.write_txn().map_err(txn_err)?;
        let db: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, None)
            .map_err(|e| LmdbStoreError::DbOpen(e.to_string()))?;
        wtxn.commit().map_err(txn_err)?;

        tracing::info!(path = %path.as_ref().display(), map_size_mb, "LMDB store opened");
        Ok(Self { env, db })
    }

    /// Open a store sized from configuration.
    pub fn from_config<P: AsRef<Path>>(
        path: P,
        config: &CachetConfig,
    ) -> Result<Self, LmdbStoreError> {
        Self::open(path, config.lmdb_map_size_mb)
    }

    fn encode_record(record: &Record) -> Result<Vec<u8>, LmdbStoreError> {
        serde_json::to_vec(record).map_err(|e| LmdbStoreError::Serialization(e.to_string()))
    }

    fn decode_record(bytes: &[u8]) -> Result<Record, LmdbStoreError> {
        serde_json::from_slice(bytes).map_err(|e| LmdbStoreError::Deserialization(e.to_string()))
    }

    /// Every record of a namespace, in key order.
    fn scan(&self, txn: &RoTxn, namespace: &Namespace) -> Result<Vec<Record>, LmdbStoreError> {
        let prefix = NamespacedKey::namespace_prefix(namespace);
        let mut records = Vec::new();
        for result in self.db.iter(txn).map_err(txn_err)? {
            let (key, value) = result.map_err(txn_err)?;
            if key.starts_with(&prefix) {
                records.push(Self::decode_record(value)?);
            }
        }
        Ok(records)
    }

    fn reject_native(predicate: &Predicate) -> StoreResult<()> {
        match predicate {
            Predicate::Native { statement } => Err(StoreError::Backend {
                reason: format!("LMDB store cannot evaluate native statement: {}", statement),
            }),
            _ => Ok(()),
        }
    }
}

impl BackingStore for LmdbStore {
    fn load_many(
        &self,
        namespace: &Namespace,
        keys: &[RecordKey],
    ) -> StoreResult<HashMap<RecordKey, Record>> {
        let rtxn = self.env.read_txn().map_err(txn_err)?;
        let mut found = HashMap::with_capacity(keys.len());
        for key in keys {
            let encoded = NamespacedKey::new(namespace.clone(), key.clone()).encode();
            if let Some(bytes) = self.db.get(&rtxn, &encoded).map_err(txn_err)? {
                found.insert(key.clone(), Self::decode_record(bytes)?);
            }
        }
        Ok(found)
    }

    fn insert(&self, namespace: &Namespace, record: &Record) -> StoreResult<()> {
        let encoded = NamespacedKey::new(namespace.clone(), record.key.clone()).encode();
        let bytes = Self::encode_record(record)?;

        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        if self.db.get(&wtxn, &encoded).map_err(txn_err)?.is_some() {
            return Err(StoreError::Conflict {
                namespace: namespace.clone(),
                key: record.key.clone(),
            });
        }
        self.db.put(&mut wtxn, &encoded, &bytes).map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(())
    }

    fn update(&self, namespace: &Namespace, record: &Record) -> StoreResult<()> {
        let encoded = NamespacedKey::new(namespace.clone(), record.key.clone()).encode();
        let bytes = Self::encode_record(record)?;

        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        if self.db.get(&wtxn, &encoded).map_err(txn_err)?.is_none() {
            return Err(StoreError::WriteFailed {
                namespace: namespace.clone(),
                key: record.key.clone(),
                reason: "no such record".to_string(),
            });
        }
        self.db.put(&mut wtxn, &encoded, &bytes).map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(())
    }

    fn delete(&self, namespace: &Namespace, key: &RecordKey) -> StoreResult<bool> {
        let encoded = NamespacedKey::new(namespace.clone(), key.clone()).encode();
        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let existed = self.db.delete(&mut wtxn, &encoded).map_err(txn_err)?;
        wtxn.commit().map_err(txn_err)?;
        Ok(existed)
    }

    fn delete_where(
        &self,
        namespace: &Namespace,
        predicate: &Predicate,
    ) -> StoreResult<DeleteOutcome> {
        Self::reject_native(predicate)?;

        let mut wtxn = self.env.write_txn().map_err(txn_err)?;
        let doomed: Vec<RecordKey> = self
            .scan(&wtxn, namespace)?
            .into_iter()
            .filter(|record| predicate.matches(record).unwrap_or(false))
            .map(|record| record.key)
            .collect();

        for key in &doomed {
            let encoded = NamespacedKey::new(namespace.clone(), key.clone()).encode();
            self.db.delete(&mut wtxn, &encoded).map_err(txn_err)?;
        }
        wtxn.commit().map_err(txn_err)?;

        tracing::debug!(
            namespace = %namespace,
            predicate = %predicate,
            deleted = doomed.len(),
            "LMDB bulk delete"
        );
        Ok(DeleteOutcome {
            count: doomed.len() as u64,
            keys: Some(doomed),
        })
    }

    fn select_keys(
        &self,
        namespace: &Namespace,
        predicate: &Predicate,
    ) -> StoreResult<Vec<RecordKey>> {
        Self::reject_native(predicate)?;

        let rtxn = self.env.read_txn().map_err(txn_err)?;
        Ok(self
            .scan(&rtxn, namespace)?
            .into_iter()
            .filter(|record| predicate.matches(record).unwrap_or(false))
            .map(|record| record.key)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_store() -> (LmdbStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = LmdbStore::open(dir.path(), 10).unwrap();
        (store, dir)
    }

    fn state(id: i64, name: &str) -> Record {
        Record::new(id).with_field("name", name)
    }

    #[test]
    fn test_insert_and_load_many() {
        let (store, _dir) = create_test_store();
        let ns = Namespace::new("State");
        store.insert(&ns, &state(1, "Baden-Württemberg")).unwrap();
        store.insert(&ns, &state(2, "Bayern")).unwrap();

        let found = store
            .load_many(&ns, &[RecordKey::id(1), RecordKey::id(2), RecordKey::id(3)])
            .unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[&RecordKey::id(2)], state(2, "Bayern"));
    }

    #[test]
    fn test_insert_conflict() {
        let (store, _dir) = create_test_store();
        let ns = Namespace::new("State");
        store.insert(&ns, &state(1, "Bayern")).unwrap();
        let err = store.insert(&ns, &state(1, "Bayern")).unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
    }

    #[test]
    fn test_update_requires_existing_record() {
        let (store, _dir) = create_test_store();
        let ns = Namespace::new("State");
        let err = store.update(&ns, &state(1, "Bayern")).unwrap_err();
        assert!(matches!(err, StoreError::WriteFailed { .. }));

        store.insert(&ns, &state(1, "Bayern")).unwrap();
        store.update(&ns, &state(1, "Freistaat Bayern")).unwrap();
        let found = store.load_many(&ns, &[RecordKey::id(1)]).unwrap();
        assert_eq!(found[&RecordKey::id(1)], state(1, "Freistaat Bayern"));
    }

    #[test]
    fn test_namespace_isolation() {
        let (store, _dir) = create_test_store();
        let states = Namespace::new("State");
        let cities = Namespace::new("City");
        store.insert(&states, &state(1, "Bayern")).unwrap();
        store.insert(&cities, &state(1, "München")).unwrap();

        let outcome = store
            .delete_where(&states, &Predicate::key_at_most(10i64))
            .unwrap();
        assert_eq!(outcome.count, 1);
        assert_eq!(outcome.keys, Some(vec![RecordKey::id(1)]));
        assert_eq!(store.load_many(&cities, &[RecordKey::id(1)]).unwrap().len(), 1);
    }

    #[test]
    fn test_select_keys_in_key_order() {
        let (store, _dir) = create_test_store();
        let ns = Namespace::new("PostalCode");
        for id in [70195i64, 1067, 70173, -4] {
            store.insert(&ns, &Record::new(id)).unwrap();
        }
        let keys = store
            .select_keys(&ns, &Predicate::key_at_most(70173i64))
            .unwrap();
        assert_eq!(
            keys,
            vec![RecordKey::id(-4), RecordKey::id(1067), RecordKey::id(70173)]
        );
    }

    #[test]
    fn test_native_statements_rejected() {
        let (store, _dir) = create_test_store();
        let err = store
            .delete_where(&Namespace::new("State"), &Predicate::native("DELETE FROM State"))
            .unwrap_err();
        assert!(matches!(err, StoreError::Backend { .. }));
    }

    #[test]
    fn test_delete_single() {
        let (store, _dir) = create_test_store();
        let ns = Namespace::new("State");
        store.insert(&ns, &state(1, "Bayern")).unwrap();
        assert!(store.delete(&ns, &RecordKey::id(1)).unwrap());
        assert!(!store.delete(&ns, &RecordKey::id(1)).unwrap());
    }

    #[test]
    fn test_records_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let ns = Namespace::new("State");
        {
            let store = LmdbStore::from_config(dir.path(), &CachetConfig::default()).unwrap();
            store.insert(&ns, &state(16, "Thüringen")).unwrap();
        }
        let store = LmdbStore::from_config(dir.path(), &CachetConfig::default()).unwrap();
        let found = store.load_many(&ns, &[RecordKey::id(16)]).unwrap();
        assert_eq!(found[&RecordKey::id(16)], state(16, "Thüringen"));
    }
}
