//! Sediment Metadata - fileset records, reference tracking and GC
//!
//! This crate implements the coordination-store side of the engine:
//! - `MetaStore`: write-once fileset records (primitive / composite)
//! - `Tracker`: TTL-bearing records with downstream references
//! - `GarbageCollector`: sweeps expired, unreferenced objects
//! - `Renewer`: scoped keep-alive for objects in use by long operations
//!
//! All tables live in one redb database; every mutation is a single write
//! transaction, which is what makes registration, renewal and deletion
//! atomic with respect to concurrent GC sweeps.

pub mod gc;
pub mod renewer;
pub mod store;
mod tables;
pub mod tracker;

pub use gc::{ChunkDeleter, Deleter, FileSetDeleter, GarbageCollector};
pub use renewer::{Renewer, with_renewer};
pub use store::{FileSetRecord, MetaStore, Primitive};
pub use tracker::Tracker;

use redb::Database;
use sediment_common::Result;
use std::path::Path;
use std::sync::Arc;

/// Open (or create) the metadata database and hand back the store and
/// tracker views over it.
pub fn open(path: impl AsRef<Path>) -> Result<(MetaStore, Tracker)> {
    let db = Arc::new(open_db(path.as_ref())?);
    let store = MetaStore::new(db.clone())?;
    let tracker = Tracker::new(db)?;
    Ok((store, tracker))
}

fn open_db(path: &Path) -> Result<Database> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Database::create(path).map_err(|e| sediment_common::Error::storage(e.to_string()))
}
