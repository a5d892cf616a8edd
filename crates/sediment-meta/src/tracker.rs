//! Reference tracker
//!
//! Every stored object (chunk, fileset) has a TTL-bearing tracker record
//! and, optionally, downstream references to the objects it depends on.
//! Downstream refs are mirrored into a reverse-index table so GC can
//! answer "is anything referencing this?" with one range scan.
//!
//! Each mutation is one redb write transaction; redb's single-writer model
//! makes registration and renewal atomic with respect to GC sweeps.

use crate::store::storage_err;
use crate::tables;
use redb::{Database, ReadableTable};
use sediment_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Clone, Debug, Serialize, Deserialize)]
struct TrackerRecord {
    /// Expiration time, milliseconds since the epoch
    expires_at_ms: u64,
    /// IDs of the objects this one depends on
    downstream: Vec<String>,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

fn ref_key(to: &str, from: &str) -> String {
    format!("{to}\0{from}")
}

/// TTL and reference bookkeeping for stored objects
#[derive(Clone)]
pub struct Tracker {
    db: Arc<Database>,
}

impl Tracker {
    pub fn new(db: Arc<Database>) -> Result<Self> {
        let write_txn = db.begin_write().map_err(storage_err)?;
        {
            let _t = write_txn
                .open_table(tables::TRACKER_OBJECTS)
                .map_err(storage_err)?;
            let _t = write_txn
                .open_table(tables::TRACKER_REFS)
                .map_err(storage_err)?;
        }
        write_txn.commit().map_err(storage_err)?;
        Ok(Self { db })
    }

    /// Register `id` with the given TTL and downstream references.
    ///
    /// Re-creating an existing record is allowed (chunk dedup re-registers
    /// the same hash): the expiry is extended to the later of the two and
    /// any new downstream refs are added. Referencing a nonexistent
    /// downstream record is an error.
    pub fn create(&self, id: &str, downstream: &[String], ttl: Duration) -> Result<()> {
        let expires_at_ms = now_ms() + ttl.as_millis() as u64;
        let write_txn = self.db.begin_write().map_err(storage_err)?;
        {
            let mut objects = write_txn
                .open_table(tables::TRACKER_OBJECTS)
                .map_err(storage_err)?;
            for down in downstream {
                if objects.get(down.as_str()).map_err(storage_err)?.is_none() {
                    return Err(Error::TrackerRecordNotFound(down.clone()));
                }
            }
            let record = match read_record(&objects, id)? {
                Some(mut existing) => {
                    existing.expires_at_ms = existing.expires_at_ms.max(expires_at_ms);
                    for down in downstream {
                        if !existing.downstream.contains(down) {
                            existing.downstream.push(down.clone());
                        }
                    }
                    existing
                }
                None => TrackerRecord {
                    expires_at_ms,
                    downstream: downstream.to_vec(),
                },
            };
            write_record(&mut objects, id, &record)?;
            let mut refs = write_txn
                .open_table(tables::TRACKER_REFS)
                .map_err(storage_err)?;
            let empty: &[u8] = &[];
            for down in &record.downstream {
                refs.insert(ref_key(down, id).as_str(), empty)
                    .map_err(storage_err)?;
            }
        }
        write_txn.commit().map_err(storage_err)?;
        Ok(())
    }

    /// Extend (or shorten) an object's TTL; returns the new expiry.
    pub fn set_ttl(&self, id: &str, ttl: Duration) -> Result<SystemTime> {
        let expires_at_ms = now_ms() + ttl.as_millis() as u64;
        self.update_expiry(id, expires_at_ms)?;
        Ok(UNIX_EPOCH + Duration::from_millis(expires_at_ms))
    }

    /// Force immediate expiry; the object becomes eligible for the next
    /// GC sweep.
    pub fn drop_now(&self, id: &str) -> Result<()> {
        self.update_expiry(id, 0)
    }

    fn update_expiry(&self, id: &str, expires_at_ms: u64) -> Result<()> {
        let write_txn = self.db.begin_write().map_err(storage_err)?;
        {
            let mut objects = write_txn
                .open_table(tables::TRACKER_OBJECTS)
                .map_err(storage_err)?;
            let Some(mut record) = read_record(&objects, id)? else {
                return Err(Error::TrackerRecordNotFound(id.to_string()));
            };
            record.expires_at_ms = expires_at_ms;
            write_record(&mut objects, id, &record)?;
        }
        write_txn.commit().map_err(storage_err)?;
        Ok(())
    }

    /// Whether a record exists (expired or not)
    pub fn exists(&self, id: &str) -> Result<bool> {
        let read_txn = self.db.begin_read().map_err(storage_err)?;
        let objects = read_txn
            .open_table(tables::TRACKER_OBJECTS)
            .map_err(storage_err)?;
        Ok(objects.get(id).map_err(storage_err)?.is_some())
    }

    /// Whether any record still references `id`
    pub fn is_referenced(&self, id: &str) -> Result<bool> {
        let read_txn = self.db.begin_read().map_err(storage_err)?;
        let refs = read_txn
            .open_table(tables::TRACKER_REFS)
            .map_err(storage_err)?;
        let start = format!("{id}\0");
        let end = format!("{id}\u{1}");
        let mut range = refs
            .range(start.as_str()..end.as_str())
            .map_err(storage_err)?;
        Ok(range.next().transpose().map_err(storage_err)?.is_some())
    }

    /// IDs of records whose expiry has passed
    pub fn expired(&self) -> Result<Vec<String>> {
        let now = now_ms();
        let read_txn = self.db.begin_read().map_err(storage_err)?;
        let objects = read_txn
            .open_table(tables::TRACKER_OBJECTS)
            .map_err(storage_err)?;
        let mut out = Vec::new();
        for entry in objects.iter().map_err(storage_err)? {
            let entry = entry.map_err(storage_err)?;
            let record: TrackerRecord = bincode::deserialize(entry.1.value())
                .map_err(|e| Error::serialization(e.to_string()))?;
            if record.expires_at_ms <= now {
                out.push(entry.0.value().to_string());
            }
        }
        Ok(out)
    }

    /// Remove a record and its outbound references. Called by GC after the
    /// underlying object is gone.
    pub fn remove(&self, id: &str) -> Result<()> {
        let write_txn = self.db.begin_write().map_err(storage_err)?;
        {
            let mut objects = write_txn
                .open_table(tables::TRACKER_OBJECTS)
                .map_err(storage_err)?;
            let record = read_record(&objects, id)?;
            objects.remove(id).map_err(storage_err)?;
            if let Some(record) = record {
                let mut refs = write_txn
                    .open_table(tables::TRACKER_REFS)
                    .map_err(storage_err)?;
                for down in &record.downstream {
                    refs.remove(ref_key(down, id).as_str()).map_err(storage_err)?;
                }
            }
        }
        write_txn.commit().map_err(storage_err)?;
        Ok(())
    }
}

fn read_record<T: ReadableTable<&'static str, &'static [u8]>>(
    table: &T,
    id: &str,
) -> Result<Option<TrackerRecord>> {
    match table.get(id).map_err(storage_err)? {
        Some(value) => bincode::deserialize(value.value())
            .map(Some)
            .map_err(|e| Error::serialization(e.to_string())),
        None => Ok(None),
    }
}

fn write_record(
    table: &mut redb::Table<'_, &str, &[u8]>,
    id: &str,
    record: &TrackerRecord,
) -> Result<()> {
    let bytes = bincode::serialize(record).map_err(|e| Error::serialization(e.to_string()))?;
    table
        .insert(id, bytes.as_slice())
        .map_err(storage_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_tracker() -> (tempfile::TempDir, Tracker) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::create(dir.path().join("meta.redb")).unwrap());
        let tracker = Tracker::new(db).unwrap();
        (dir, tracker)
    }

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn test_create_and_exists() {
        let (_dir, tracker) = test_tracker();
        tracker.create("chunk/aa", &[], HOUR).unwrap();
        assert!(tracker.exists("chunk/aa").unwrap());
        assert!(!tracker.exists("chunk/bb").unwrap());
    }

    #[test]
    fn test_create_with_dangling_downstream_fails() {
        let (_dir, tracker) = test_tracker();
        let err = tracker
            .create("fileset/x", &["chunk/missing".to_string()], HOUR)
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_references() {
        let (_dir, tracker) = test_tracker();
        tracker.create("chunk/aa", &[], HOUR).unwrap();
        tracker
            .create("fileset/x", &["chunk/aa".to_string()], HOUR)
            .unwrap();

        assert!(tracker.is_referenced("chunk/aa").unwrap());
        assert!(!tracker.is_referenced("fileset/x").unwrap());

        tracker.remove("fileset/x").unwrap();
        assert!(!tracker.is_referenced("chunk/aa").unwrap());
    }

    #[test]
    fn test_drop_now_expires() {
        let (_dir, tracker) = test_tracker();
        tracker.create("fileset/x", &[], HOUR).unwrap();
        assert!(tracker.expired().unwrap().is_empty());

        tracker.drop_now("fileset/x").unwrap();
        assert_eq!(tracker.expired().unwrap(), vec!["fileset/x".to_string()]);
    }

    #[test]
    fn test_set_ttl_missing_record() {
        let (_dir, tracker) = test_tracker();
        let err = tracker.set_ttl("fileset/x", HOUR).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_recreate_extends_expiry() {
        let (_dir, tracker) = test_tracker();
        tracker.create("chunk/aa", &[], HOUR).unwrap();
        tracker.drop_now("chunk/aa").unwrap();
        // dedup path re-registers the same chunk; it must become live again
        tracker.create("chunk/aa", &[], HOUR).unwrap();
        assert!(tracker.expired().unwrap().is_empty());
    }
}
