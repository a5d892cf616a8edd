//! Persistent fileset records backed by redb.
//!
//! A record is either a primitive layer (refs to its additive and deletive
//! index streams) or a composite (ordered layer list, oldest first).
//! Records are write-once: `create` is a compare-and-set inside one write
//! transaction, so concurrent readers never observe partial state.

use crate::tables;
use redb::{Database, ReadableTable};
use sediment_chunk::DataRef;
use sediment_common::{Error, FileSetId, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A sealed primitive layer: refs to its serialized index streams
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Primitive {
    pub additive: Vec<DataRef>,
    pub deletive: Vec<DataRef>,
}

/// Persisted form of a fileset
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileSetRecord {
    Primitive(Primitive),
    Composite { layers: Vec<FileSetId> },
}

/// Write-once fileset record store
#[derive(Clone)]
pub struct MetaStore {
    db: Arc<Database>,
}

impl MetaStore {
    pub fn new(db: Arc<Database>) -> Result<Self> {
        // Create the table eagerly so later read txns don't fail
        let write_txn = db.begin_write().map_err(storage_err)?;
        {
            let _t = write_txn.open_table(tables::FILESETS).map_err(storage_err)?;
        }
        write_txn.commit().map_err(storage_err)?;
        Ok(Self { db })
    }

    /// Register a new record. Write-once: creating an existing ID fails
    /// unless the stored record is identical (idempotent re-create).
    pub fn create(&self, id: FileSetId, record: &FileSetRecord) -> Result<()> {
        let key = id.to_string();
        let bytes = bincode::serialize(record).map_err(|e| Error::serialization(e.to_string()))?;
        let write_txn = self.db.begin_write().map_err(storage_err)?;
        {
            let mut table = write_txn.open_table(tables::FILESETS).map_err(storage_err)?;
            let existing = table
                .get(key.as_str())
                .map_err(storage_err)?
                .map(|v| v.value().to_vec());
            match existing {
                Some(old) if old == bytes => {}
                Some(_) => {
                    return Err(Error::invalid_argument(format!(
                        "fileset record {id} already exists"
                    )));
                }
                None => {
                    table
                        .insert(key.as_str(), bytes.as_slice())
                        .map_err(storage_err)?;
                }
            }
        }
        write_txn.commit().map_err(storage_err)?;
        Ok(())
    }

    /// Fetch a record, with a distinct not-found kind for collected or
    /// never-written IDs.
    pub fn get(&self, id: FileSetId) -> Result<FileSetRecord> {
        let read_txn = self.db.begin_read().map_err(storage_err)?;
        let table = read_txn.open_table(tables::FILESETS).map_err(storage_err)?;
        let Some(value) = table.get(id.to_string().as_str()).map_err(storage_err)? else {
            return Err(Error::FileSetNotFound(id.to_string()));
        };
        bincode::deserialize(value.value()).map_err(|e| Error::serialization(e.to_string()))
    }

    /// Whether a record exists
    pub fn exists(&self, id: FileSetId) -> Result<bool> {
        let read_txn = self.db.begin_read().map_err(storage_err)?;
        let table = read_txn.open_table(tables::FILESETS).map_err(storage_err)?;
        Ok(table.get(id.to_string().as_str()).map_err(storage_err)?.is_some())
    }

    /// Delete a record. Called by GC; deleting a missing record is not an
    /// error (sweeps are safe to repeat).
    pub fn delete(&self, id: FileSetId) -> Result<()> {
        let write_txn = self.db.begin_write().map_err(storage_err)?;
        {
            let mut table = write_txn.open_table(tables::FILESETS).map_err(storage_err)?;
            table.remove(id.to_string().as_str()).map_err(storage_err)?;
        }
        write_txn.commit().map_err(storage_err)?;
        Ok(())
    }
}

pub(crate) fn storage_err<E: std::fmt::Display>(e: E) -> Error {
    Error::storage(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> (tempfile::TempDir, MetaStore) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::create(dir.path().join("meta.redb")).unwrap());
        let store = MetaStore::new(db).unwrap();
        (dir, store)
    }

    fn primitive() -> FileSetRecord {
        FileSetRecord::Primitive(Primitive {
            additive: Vec::new(),
            deletive: Vec::new(),
        })
    }

    #[test]
    fn test_create_get_round_trip() {
        let (_dir, store) = test_store();
        let id = FileSetId::new();
        let record = FileSetRecord::Composite {
            layers: vec![FileSetId::new(), FileSetId::new()],
        };
        store.create(id, &record).unwrap();
        assert_eq!(store.get(id).unwrap(), record);
        assert!(store.exists(id).unwrap());
    }

    #[test]
    fn test_get_missing_is_not_found() {
        let (_dir, store) = test_store();
        let err = store.get(FileSetId::new()).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_create_is_write_once() {
        let (_dir, store) = test_store();
        let id = FileSetId::new();
        store.create(id, &primitive()).unwrap();
        // identical re-create is idempotent
        store.create(id, &primitive()).unwrap();
        // conflicting create is rejected
        let other = FileSetRecord::Composite { layers: vec![] };
        assert!(store.create(id, &other).is_err());
    }

    #[test]
    fn test_delete_is_idempotent() {
        let (_dir, store) = test_store();
        let id = FileSetId::new();
        store.create(id, &primitive()).unwrap();
        store.delete(id).unwrap();
        assert!(!store.exists(id).unwrap());
        store.delete(id).unwrap();
    }
}
