//! Ordered fileset writer.
//!
//! Appends must arrive in path order. Content bytes go through a shared
//! `ChunkWriter`, so many small files pack into the same chunks; the refs
//! only materialize when the writer closes. Closing seals the additive and
//! deletive index streams, registers every chunk and the new fileset with
//! the tracker, and persists the primitive record.

use std::collections::BTreeSet;
use std::time::Duration;

use sediment_chunk::{ChunkStorage, ChunkWriter, DataRef, SegmentId};
use sediment_common::{ChunkHash, DEFAULT_TAG, Error, FileSetId, Result, StorageConfig, clean_path};
use sediment_meta::{FileSetRecord, MetaStore, Primitive, Tracker};
use tracing::debug;

use crate::index::{self, IndexEntry, TagRef};

/// Tag content that resolves at close time.
enum PendingRefs {
    /// A segment of the shared chunk writer.
    Segment(SegmentId),
    /// Refs that already exist, appended as-is.
    Resolved(Vec<DataRef>),
}

struct PendingAdditive {
    path: String,
    tags: Vec<(String, PendingRefs)>,
}

type IndexCallback = Box<dyn FnMut(&IndexEntry) -> Result<()> + Send>;

/// Builds one primitive fileset layer.
pub struct Writer {
    chunks: ChunkWriter,
    storage: ChunkStorage,
    meta: MetaStore,
    tracker: Tracker,
    ttl: Duration,
    chunk_ttl: Duration,
    additive: Vec<PendingAdditive>,
    deletive: Vec<IndexEntry>,
    last_deletive_path: Option<String>,
    callback: Option<IndexCallback>,
}

impl Writer {
    pub fn new(
        storage: ChunkStorage,
        meta: MetaStore,
        tracker: Tracker,
        config: &StorageConfig,
    ) -> Self {
        Self {
            chunks: storage.writer(),
            storage,
            meta,
            tracker,
            ttl: config.default_ttl,
            chunk_ttl: config.chunk.ttl,
            additive: Vec::new(),
            deletive: Vec::new(),
            last_deletive_path: None,
            callback: None,
        }
    }

    /// Override the TTL of the sealed fileset record. A zero TTL turns
    /// the writer into a scratch pass, see [`Writer::close`].
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Invoke `f` for every sealed additive entry at close time.
    #[must_use]
    pub fn with_index_callback(
        mut self,
        f: impl FnMut(&IndexEntry) -> Result<()> + Send + 'static,
    ) -> Self {
        self.callback = Some(Box::new(f));
        self
    }

    /// Append a file's full content under `tag`.
    ///
    /// Paths must arrive in ascending order; repeating the last path is
    /// allowed as long as the tag is strictly greater than the previous
    /// tag for that path.
    pub async fn add(&mut self, path: &str, tag: &str, data: &[u8]) -> Result<()> {
        self.begin_tag(path, tag)?;
        self.chunks.write(data).await?;
        self.chunks.end_segment();
        Ok(())
    }

    /// Begin a streamed file under `tag`. Every `write` on the returned
    /// handle appends to this file until the handle is dropped.
    pub fn add_streamed(&mut self, path: &str, tag: &str) -> Result<FileWriter<'_>> {
        self.begin_tag(path, tag)?;
        Ok(FileWriter {
            chunks: &mut self.chunks,
        })
    }

    fn begin_tag(&mut self, path: &str, tag: &str) -> Result<()> {
        let path = clean_path(path, false);
        match self.additive.last() {
            Some(last) if last.path == path => {
                if let Some((prev_tag, _)) = last.tags.last()
                    && tag <= prev_tag.as_str()
                {
                    return Err(Error::PathOrder {
                        prev: format!("{path}:{prev_tag}"),
                        next: format!("{path}:{tag}"),
                    });
                }
            }
            Some(last) if last.path > path => {
                return Err(Error::PathOrder {
                    prev: last.path.clone(),
                    next: path,
                });
            }
            _ => {
                self.additive.push(PendingAdditive {
                    path: path.clone(),
                    tags: Vec::new(),
                });
            }
        }
        let segment = self.chunks.begin_segment();
        if let Some(last) = self.additive.last_mut() {
            last.tags
                .push((tag.to_string(), PendingRefs::Segment(segment)));
        }
        Ok(())
    }

    /// Append a file's content under the default tag.
    pub async fn add_default(&mut self, path: &str, data: &[u8]) -> Result<()> {
        self.add(path, DEFAULT_TAG, data).await
    }

    /// Record a tombstone for `path`. Empty `tags` deletes the whole path
    /// in every layer below this one.
    pub fn delete(&mut self, path: &str, tags: Vec<String>) -> Result<()> {
        let path = clean_path(path, false);
        if let Some(last) = &self.last_deletive_path
            && path <= *last
        {
            return Err(Error::PathOrder {
                prev: last.clone(),
                next: path,
            });
        }
        self.last_deletive_path = Some(path.clone());
        self.deletive.push(IndexEntry::deletive(path, tags));
        Ok(())
    }

    /// Append an already-resolved additive entry without copying its bytes.
    pub fn copy(&mut self, entry: &IndexEntry) -> Result<()> {
        if entry.deletive {
            return Err(Error::invalid_argument(
                "copy takes additive entries; use copy_deletive",
            ));
        }
        if let Some(last) = self.additive.last()
            && entry.path <= last.path
        {
            return Err(Error::PathOrder {
                prev: last.path.clone(),
                next: entry.path.clone(),
            });
        }
        self.additive.push(PendingAdditive {
            path: entry.path.clone(),
            tags: entry
                .tags
                .iter()
                .map(|t| (t.tag.clone(), PendingRefs::Resolved(t.data_refs.clone())))
                .collect(),
        });
        Ok(())
    }

    /// Append an already-resolved tombstone entry.
    pub fn copy_deletive(&mut self, entry: &IndexEntry) -> Result<()> {
        if !entry.deletive {
            return Err(Error::invalid_argument(
                "copy_deletive takes deletive entries",
            ));
        }
        self.delete(
            &entry.path,
            entry.tags.iter().map(|t| t.tag.clone()).collect(),
        )
    }

    /// Whether anything has been appended.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.additive.is_empty() && self.deletive.is_empty()
    }

    /// Seal the layer: flush content, write both index streams, register
    /// everything with the tracker and persist the record.
    ///
    /// A zero TTL marks a scratch pass: sealed entries still flow through
    /// the index callback, but no index is uploaded and nothing is
    /// registered. The returned id names no record.
    pub async fn close(mut self) -> Result<FileSetId> {
        let output = self.chunks.close().await?;
        let mut chunk_ids: BTreeSet<String> =
            output.chunks.iter().map(ChunkHash::tracker_id).collect();

        let mut entries = Vec::with_capacity(self.additive.len());
        for pending in self.additive {
            let tags = pending
                .tags
                .into_iter()
                .map(|(tag, refs)| {
                    let data_refs = match refs {
                        PendingRefs::Segment(seg) => output.segments[seg.index()].clone(),
                        PendingRefs::Resolved(refs) => refs,
                    };
                    TagRef { tag, data_refs }
                })
                .collect();
            let entry = IndexEntry::additive(pending.path, tags);
            // Copied entries reference chunks written by other filesets,
            // keep those alive too.
            for data_ref in entry.data_refs() {
                chunk_ids.insert(data_ref.chunk.tracker_id());
            }
            if let Some(cb) = self.callback.as_mut() {
                cb(&entry)?;
            }
            entries.push(entry);
        }

        if self.ttl.is_zero() {
            return Ok(FileSetId::new());
        }

        let mut additive_index = index::Writer::new(&self.storage);
        for entry in &entries {
            additive_index.append(entry).await?;
        }
        let (additive_refs, additive_chunks) = additive_index.close().await?;

        let mut deletive_index = index::Writer::new(&self.storage);
        for entry in &self.deletive {
            deletive_index.append(entry).await?;
        }
        let (deletive_refs, deletive_chunks) = deletive_index.close().await?;

        chunk_ids.extend(additive_chunks.iter().map(ChunkHash::tracker_id));
        chunk_ids.extend(deletive_chunks.iter().map(ChunkHash::tracker_id));
        let chunk_ids: Vec<String> = chunk_ids.into_iter().collect();

        // Chunk records first, then the fileset that references them. The
        // chunk TTL is only an upload grace; once the fileset ref lands
        // the chunks live exactly as long as something references them.
        for id in &chunk_ids {
            self.tracker.create(id, &[], self.chunk_ttl)?;
        }
        let id = FileSetId::new();
        self.tracker.create(&id.tracker_id(), &chunk_ids, self.ttl)?;
        self.meta.create(
            id,
            &FileSetRecord::Primitive(Primitive {
                additive: additive_refs,
                deletive: deletive_refs,
            }),
        )?;
        debug!(fileset = %id, chunks = chunk_ids.len(), "sealed primitive layer");
        Ok(id)
    }
}

/// Persist a composite record layering `layers` oldest first.
///
/// The composite's tracker record references each layer, so the layers
/// stay alive as long as the composite does.
pub fn compose(
    meta: &MetaStore,
    tracker: &Tracker,
    layers: Vec<FileSetId>,
    ttl: Duration,
) -> Result<FileSetId> {
    let downstream: Vec<String> = layers.iter().map(FileSetId::tracker_id).collect();
    let id = FileSetId::new();
    tracker.create(&id.tracker_id(), &downstream, ttl)?;
    meta.create(id, &FileSetRecord::Composite { layers })?;
    Ok(id)
}

/// Streaming handle for one file's content.
pub struct FileWriter<'a> {
    chunks: &'a mut ChunkWriter,
}

impl FileWriter<'_> {
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.chunks.write(data).await
    }
}

impl Drop for FileWriter<'_> {
    fn drop(&mut self) {
        self.chunks.end_segment();
    }
}

#[cfg(test)]
mod tests {
    use sediment_chunk::{MemObjClient, ObjClient};
    use sediment_common::StorageConfig;
    use std::sync::Arc;
    use tempfile::TempDir;

    use super::*;

    fn writer() -> (Writer, ChunkStorage, MetaStore, Tracker, TempDir) {
        let dir = TempDir::new().unwrap();
        let (meta, tracker) = sediment_meta::open(dir.path().join("meta.redb")).unwrap();
        let config = StorageConfig::default();
        let client: Arc<dyn ObjClient> = MemObjClient::shared();
        let storage = ChunkStorage::new(client, &config.chunk);
        let w = Writer::new(storage.clone(), meta.clone(), tracker.clone(), &config);
        (w, storage, meta, tracker, dir)
    }

    #[tokio::test]
    async fn test_rejects_out_of_order_paths() {
        let (mut w, ..) = writer();
        w.add_default("/b", b"x").await.unwrap();
        let err = w.add_default("/a", b"y").await.unwrap_err();
        assert!(matches!(err, Error::PathOrder { .. }));
    }

    #[tokio::test]
    async fn test_rejects_repeated_tag_on_same_path() {
        let (mut w, ..) = writer();
        w.add("/f", "t", b"x").await.unwrap();
        let err = w.add("/f", "t", b"y").await.unwrap_err();
        assert!(matches!(err, Error::PathOrder { .. }));
        // A greater tag on the same path is fine.
        w.add("/f", "u", b"z").await.unwrap();
    }

    #[tokio::test]
    async fn test_rejects_out_of_order_deletes() {
        let (mut w, ..) = writer();
        w.delete("/b", Vec::new()).unwrap();
        let err = w.delete("/a", Vec::new()).unwrap_err();
        assert!(matches!(err, Error::PathOrder { .. }));
    }

    #[tokio::test]
    async fn test_streamed_writes_concatenate() {
        let (mut w, storage, meta, _tracker, _dir) = writer();
        {
            let mut file = w.add_streamed("/f", DEFAULT_TAG).unwrap();
            file.write(b"hello ").await.unwrap();
            file.write(b"world").await.unwrap();
        }
        let id = w.close().await.unwrap();
        let reader = crate::reader::Reader::new(storage, meta, vec![id]);
        let content = reader.open("/f").await.unwrap().read_all().await.unwrap();
        assert_eq!(content, "hello world");
    }

    #[tokio::test]
    async fn test_zero_ttl_seals_nothing() {
        let (w, _storage, meta, tracker, _dir) = writer();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut w = w
            .with_ttl(Duration::ZERO)
            .with_index_callback(move |entry| {
                sink.lock().push(entry.path.clone());
                Ok(())
            });
        let entry = IndexEntry::additive(
            "/a",
            vec![TagRef {
                tag: DEFAULT_TAG.to_string(),
                data_refs: Vec::new(),
            }],
        );
        w.copy(&entry).unwrap();
        let id = w.close().await.unwrap();

        assert_eq!(*seen.lock(), vec!["/a".to_string()]);
        assert!(!meta.exists(id).unwrap());
        assert!(!tracker.exists(&id.tracker_id()).unwrap());
    }

    #[tokio::test]
    async fn test_close_registers_fileset_and_chunks() {
        let (mut w, _storage, meta, tracker, _dir) = writer();
        w.add_default("/a", b"content").await.unwrap();
        let id = w.close().await.unwrap();

        assert!(meta.exists(id).unwrap());
        assert!(tracker.exists(&id.tracker_id()).unwrap());
        let record = meta.get(id).unwrap();
        let FileSetRecord::Primitive(p) = record else {
            panic!("expected primitive");
        };
        // Every referenced chunk is tracked and referenced by the fileset.
        assert!(!p.additive.is_empty());
        for data_ref in &p.additive {
            let chunk_id = data_ref.chunk.tracker_id();
            assert!(tracker.exists(&chunk_id).unwrap());
            assert!(tracker.is_referenced(&chunk_id).unwrap());
        }
    }
}
