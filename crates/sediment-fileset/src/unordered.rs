//! Out-of-order ingest.
//!
//! An `UnorderedWriter` accepts puts and deletes in any path order,
//! buffering them in a sorted in-memory layer. When the buffer crosses the
//! memory threshold it is sealed into a primitive fileset mid-stream;
//! closing composes the sealed layers, oldest first, so later puts shadow
//! earlier ones exactly as they would across ordered layers.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use sediment_chunk::ChunkStorage;
use sediment_common::{FileSetId, Result, StorageConfig, clean_path};
use sediment_meta::{MetaStore, Renewer, Tracker};
use tokio::sync::OwnedSemaphorePermit;
use tracing::debug;

use crate::writer::{Writer, compose};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Tombstone {
    WholePath,
    Tags(BTreeSet<String>),
}

#[derive(Default)]
struct MemFile {
    /// Tag name to buffered content, appends concatenate.
    tags: BTreeMap<String, Vec<u8>>,
}

/// A sorted in-memory fileset layer.
#[derive(Default)]
pub struct MemFileSet {
    additive: BTreeMap<String, MemFile>,
    deletive: BTreeMap<String, Tombstone>,
    bytes: u64,
}

impl MemFileSet {
    /// Append `data` to the buffer for `(path, tag)`.
    pub fn put(&mut self, path: &str, tag: &str, data: &[u8]) {
        let path = clean_path(path, false);
        self.bytes += data.len() as u64;
        self.additive
            .entry(path)
            .or_default()
            .tags
            .entry(tag.to_string())
            .or_default()
            .extend_from_slice(data);
    }

    /// Tombstone `path`. Empty `tags` deletes the whole path. Buffered
    /// puts for the deleted tags are discarded; later puts re-add.
    pub fn delete(&mut self, path: &str, tags: Vec<String>) {
        let path = clean_path(path, false);
        if tags.is_empty() {
            if let Some(file) = self.additive.remove(&path) {
                self.bytes -= file.size();
            }
            self.deletive.insert(path, Tombstone::WholePath);
            return;
        }
        if let Some(file) = self.additive.get_mut(&path) {
            for tag in &tags {
                if let Some(buf) = file.tags.remove(tag) {
                    self.bytes -= buf.len() as u64;
                }
            }
            if file.tags.is_empty() {
                self.additive.remove(&path);
            }
        }
        match self.deletive.get_mut(&path) {
            Some(Tombstone::WholePath) => {}
            Some(Tombstone::Tags(existing)) => existing.extend(tags),
            None => {
                self.deletive
                    .insert(path, Tombstone::Tags(tags.into_iter().collect()));
            }
        }
    }

    /// Buffered content bytes.
    #[must_use]
    pub fn size_bytes(&self) -> u64 {
        self.bytes
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.additive.is_empty() && self.deletive.is_empty()
    }

    /// Drain into an ordered writer. Maps iterate sorted, so the writer's
    /// ordering requirement holds by construction.
    pub async fn serialize(self, writer: &mut Writer) -> Result<()> {
        for (path, tombstone) in self.deletive {
            let tags = match tombstone {
                Tombstone::WholePath => Vec::new(),
                Tombstone::Tags(tags) => tags.into_iter().collect(),
            };
            writer.delete(&path, tags)?;
        }
        for (path, file) in self.additive {
            for (tag, data) in file.tags {
                writer.add(&path, &tag, &data).await?;
            }
        }
        Ok(())
    }
}

impl MemFile {
    fn size(&self) -> u64 {
        self.tags.values().map(|b| b.len() as u64).sum()
    }
}

/// Accepts puts in any order and produces one fileset.
pub struct UnorderedWriter {
    storage: ChunkStorage,
    meta: MetaStore,
    tracker: Tracker,
    config: StorageConfig,
    mem: MemFileSet,
    layers: Vec<FileSetId>,
    renewer: Option<Arc<Renewer>>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl UnorderedWriter {
    pub fn new(
        storage: ChunkStorage,
        meta: MetaStore,
        tracker: Tracker,
        config: &StorageConfig,
        renewer: Option<Arc<Renewer>>,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Self {
        Self {
            storage,
            meta,
            tracker,
            config: config.clone(),
            mem: MemFileSet::default(),
            layers: Vec::new(),
            renewer,
            _permit: permit,
        }
    }

    /// Append `data` under `(path, tag)`. `overwrite` tombstones the whole
    /// path first, so the new content replaces anything buffered or sealed
    /// below instead of accumulating onto it.
    ///
    /// Crossing the memory threshold seals the buffer into an intermediate
    /// layer. A put never splits across layers (a newer layer's tag would
    /// shadow the earlier half of the same file), so a put that would
    /// cross the threshold seals the buffer first and an oversized put
    /// seals its own layer right after.
    pub async fn put(&mut self, path: &str, tag: &str, overwrite: bool, data: &[u8]) -> Result<()> {
        if overwrite {
            self.mem.delete(path, Vec::new());
        }
        let threshold = self.config.memory_threshold as u64;
        if !self.mem.is_empty() && self.mem.size_bytes() + data.len() as u64 > threshold {
            self.flush().await?;
        }
        self.mem.put(path, tag, data);
        if self.mem.size_bytes() >= threshold {
            self.flush().await?;
        }
        Ok(())
    }

    /// Tombstone `path` relative to everything written before this call.
    pub fn delete(&mut self, path: &str, tags: Vec<String>) {
        self.mem.delete(path, tags);
    }

    /// Seal the current buffer as a primitive layer.
    async fn flush(&mut self) -> Result<()> {
        if self.mem.is_empty() {
            return Ok(());
        }
        let mem = std::mem::take(&mut self.mem);
        let bytes = mem.size_bytes();
        let mut writer = Writer::new(
            self.storage.clone(),
            self.meta.clone(),
            self.tracker.clone(),
            &self.config,
        );
        mem.serialize(&mut writer).await?;
        let id = writer.close().await?;
        if let Some(renewer) = &self.renewer {
            renewer.add(id.tracker_id());
        }
        debug!(fileset = %id, bytes, "sealed intermediate layer");
        self.layers.push(id);
        Ok(())
    }

    /// Seal the remainder and return the final fileset. Multiple sealed
    /// layers become a composite, oldest first.
    pub async fn close(mut self) -> Result<FileSetId> {
        self.flush().await?;
        if self.layers.len() == 1 {
            return Ok(self.layers[0]);
        }
        if self.layers.is_empty() {
            // An empty fileset is still a valid, addressable result.
            let writer = Writer::new(
                self.storage.clone(),
                self.meta.clone(),
                self.tracker.clone(),
                &self.config,
            );
            return writer.close().await;
        }
        let id = compose(
            &self.meta,
            &self.tracker,
            self.layers,
            self.config.default_ttl,
        )?;
        if let Some(renewer) = &self.renewer {
            renewer.add(id.tracker_id());
        }
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mem_put_accumulates_and_sorts() {
        let mut mem = MemFileSet::default();
        // Paths are canonicalized on entry, keys carry the leading slash.
        mem.put("b", "t", b"22");
        mem.put("a", "t", b"1");
        mem.put("/b", "t", b"33");
        assert_eq!(mem.size_bytes(), 5);
        let paths: Vec<_> = mem.additive.keys().cloned().collect();
        assert_eq!(paths, vec!["/a", "/b"]);
        assert_eq!(mem.additive["/b"].tags["t"], b"2233");
    }

    #[test]
    fn test_mem_whole_path_delete_drops_buffered_puts() {
        let mut mem = MemFileSet::default();
        mem.put("/a", "t", b"data");
        mem.delete("/a", Vec::new());
        assert_eq!(mem.size_bytes(), 0);
        assert!(mem.additive.is_empty());
        assert_eq!(mem.deletive["/a"], Tombstone::WholePath);
        // A later put re-adds above the tombstone.
        mem.put("/a", "t", b"x");
        assert_eq!(mem.size_bytes(), 1);
        assert!(mem.additive.contains_key("/a"));
    }

    #[test]
    fn test_mem_tag_delete_is_scoped() {
        let mut mem = MemFileSet::default();
        mem.put("/a", "t1", b"one");
        mem.put("/a", "t2", b"two");
        mem.delete("/a", vec!["t1".to_string()]);
        assert_eq!(mem.size_bytes(), 3);
        assert!(mem.additive["/a"].tags.contains_key("t2"));
        assert_eq!(
            mem.deletive["/a"],
            Tombstone::Tags(BTreeSet::from(["t1".to_string()]))
        );
    }
}
