//! Garbage collection
//!
//! One sweep deletes every object whose TTL has lapsed and which no other
//! record references, then removes its tracker record. Deleting a record
//! drops its outbound references, so a sweep keeps passing until a pass
//! frees nothing; a fileset and the chunks it alone kept alive can fall in
//! the same `run_once` call once both have expired.

use crate::store::MetaStore;
use crate::tracker::Tracker;
use async_trait::async_trait;
use sediment_chunk::ChunkStorage;
use sediment_common::{ChunkHash, Error, FileSetId, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Deletes the underlying object for one tracker-ID prefix.
#[async_trait]
pub trait Deleter: Send + Sync {
    /// The tracker-ID prefix this deleter owns, e.g. `"chunk/"`.
    fn prefix(&self) -> &'static str;

    /// Delete the object named by `id` (including the prefix) from its
    /// store. Deleting an already-missing object must succeed.
    async fn delete(&self, id: &str) -> Result<()>;
}

/// Deletes chunks from the chunk store
pub struct ChunkDeleter {
    storage: ChunkStorage,
}

impl ChunkDeleter {
    #[must_use]
    pub fn new(storage: ChunkStorage) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl Deleter for ChunkDeleter {
    fn prefix(&self) -> &'static str {
        "chunk/"
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let hex = id.strip_prefix(self.prefix()).unwrap_or(id);
        let hash = ChunkHash::from_hex(hex)
            .map_err(|e| Error::storage(format!("bad chunk tracker id {id}: {e}")))?;
        self.storage.delete(&hash).await
    }
}

/// Deletes fileset records from the metadata store
pub struct FileSetDeleter {
    store: Arc<MetaStore>,
}

impl FileSetDeleter {
    #[must_use]
    pub fn new(store: Arc<MetaStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Deleter for FileSetDeleter {
    fn prefix(&self) -> &'static str {
        "fileset/"
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let raw = id.strip_prefix(self.prefix()).unwrap_or(id);
        let uuid = Uuid::parse_str(raw)
            .map_err(|e| Error::storage(format!("bad fileset tracker id {id}: {e}")))?;
        self.store.delete(FileSetId::from_uuid(uuid))
    }
}

/// Sweeps expired, unreferenced objects
pub struct GarbageCollector {
    tracker: Tracker,
    deleters: Vec<Arc<dyn Deleter>>,
}

impl GarbageCollector {
    #[must_use]
    pub fn new(tracker: Tracker, deleters: Vec<Arc<dyn Deleter>>) -> Self {
        Self { tracker, deleters }
    }

    /// One sweep; returns the number of objects removed.
    ///
    /// Only objects already past expiry and unreferenced are touched, so
    /// this is safe to call repeatedly and concurrently with ongoing
    /// writes.
    pub async fn run_once(&self) -> Result<usize> {
        let mut total = 0;
        loop {
            let deleted = self.sweep_pass().await?;
            if deleted == 0 {
                break;
            }
            total += deleted;
        }
        if total > 0 {
            info!(deleted = total, "gc sweep reclaimed objects");
        }
        Ok(total)
    }

    async fn sweep_pass(&self) -> Result<usize> {
        let mut deleted = 0;
        for id in self.tracker.expired()? {
            // A record with any remaining referrer is skipped; the
            // referrer is either live, or expired and will fall first.
            if self.tracker.is_referenced(&id)? {
                continue;
            }
            self.delete_object(&id).await?;
            self.tracker.remove(&id)?;
            debug!(id = %id, "gc deleted object");
            deleted += 1;
        }
        Ok(deleted)
    }

    async fn delete_object(&self, id: &str) -> Result<()> {
        for deleter in &self.deleters {
            if id.starts_with(deleter.prefix()) {
                return deleter.delete(id).await;
            }
        }
        warn!(id = %id, "no deleter registered for tracker id");
        Ok(())
    }

    /// Run sweeps forever at the given interval. Transient failures are
    /// logged and retried on the next tick; the loop never gives up.
    pub async fn run_forever(&self, interval: Duration) -> ! {
        loop {
            if let Err(e) = self.run_once().await {
                warn!(error = %e, "gc sweep failed; will retry");
            }
            tokio::time::sleep(interval).await;
        }
    }
}
