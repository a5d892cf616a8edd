//! Read side of a fileset: merged file listing and content access.

use bytes::{Bytes, BytesMut};
use sediment_chunk::{ChunkReader, ChunkStorage};
use sediment_common::{Error, FileSetId, PathRange, Result, clean_path};
use sediment_meta::{MetaStore, Primitive};

use crate::index::IndexEntry;
use crate::merge::MergeIterator;
use crate::resolver::Resolver;

/// Merged view over the layer stacks of one or more filesets, oldest
/// first.
#[derive(Clone)]
pub struct Reader {
    storage: ChunkStorage,
    resolver: Resolver,
    ids: Vec<FileSetId>,
}

impl Reader {
    pub fn new(storage: ChunkStorage, meta: MetaStore, ids: Vec<FileSetId>) -> Self {
        Self {
            storage,
            resolver: Resolver::new(meta),
            ids,
        }
    }

    fn layers(&self) -> Result<Vec<Primitive>> {
        let mut out = Vec::new();
        for id in &self.ids {
            out.extend(self.resolver.flatten(*id)?);
        }
        Ok(out)
    }

    /// Streams the files in `range`, in path order, tombstoned paths
    /// omitted.
    pub fn files(&self, range: &PathRange) -> Result<FileStream> {
        let layers = self.layers()?;
        Ok(FileStream {
            storage: self.storage.clone(),
            merge: MergeIterator::new(&self.storage, &layers, range),
        })
    }

    /// Streams the merged tombstone entries in `range`, in path order.
    pub fn tombstones(&self, range: &PathRange) -> Result<TombstoneStream> {
        let layers = self.layers()?;
        Ok(TombstoneStream {
            merge: MergeIterator::new(&self.storage, &layers, range),
        })
    }

    /// Opens one file by exact path.
    ///
    /// The merged stream is consulted at exactly that path; a stream that
    /// yields a different path there indicates index corruption and fails
    /// with [`Error::IndexDesync`].
    pub async fn open(&self, path: &str) -> Result<File> {
        let path = clean_path(path, false);
        let range = PathRange {
            lower: Some(path.clone()),
            upper: None,
        };
        let mut stream = self.files(&range)?;
        match stream.next().await? {
            Some(file) if file.path() == path => Ok(file),
            Some(file) if file.path() > path.as_str() => Err(Error::FileNotFound(path)),
            Some(file) => Err(Error::IndexDesync {
                expected: path,
                actual: file.entry.path.clone(),
            }),
            None => Err(Error::FileNotFound(path)),
        }
    }

    /// Whether `path` resolves to a live file.
    pub async fn exists(&self, path: &str) -> Result<bool> {
        match self.open(path).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Ordered stream of live files.
pub struct FileStream {
    storage: ChunkStorage,
    merge: MergeIterator,
}

impl FileStream {
    pub async fn next(&mut self) -> Result<Option<File>> {
        // Skip pure-tombstone paths, they are not files.
        loop {
            let Some(merged) = self.merge.next().await? else {
                return Ok(None);
            };
            if let Some(entry) = merged.additive {
                return Ok(Some(File {
                    storage: self.storage.clone(),
                    entry,
                }));
            }
        }
    }

    /// Drains the stream. Intended for tests and small filesets.
    pub async fn collect(mut self) -> Result<Vec<File>> {
        let mut out = Vec::new();
        while let Some(f) = self.next().await? {
            out.push(f);
        }
        Ok(out)
    }
}

/// Ordered stream of merged tombstone entries.
pub struct TombstoneStream {
    merge: MergeIterator,
}

impl TombstoneStream {
    pub async fn next(&mut self) -> Result<Option<IndexEntry>> {
        loop {
            let Some(merged) = self.merge.next().await? else {
                return Ok(None);
            };
            if let Some(entry) = merged.deletive {
                return Ok(Some(entry));
            }
        }
    }
}

/// One resolved file: its merged index entry plus content access.
pub struct File {
    storage: ChunkStorage,
    entry: IndexEntry,
}

impl File {
    #[must_use]
    pub fn path(&self) -> &str {
        &self.entry.path
    }

    /// Total content size across all tags.
    #[must_use]
    pub fn size_bytes(&self) -> u64 {
        self.entry.size_bytes()
    }

    /// Tag names in ascending order.
    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.entry.tags.iter().map(|t| t.tag.as_str())
    }

    #[must_use]
    pub fn index_entry(&self) -> &IndexEntry {
        &self.entry
    }

    /// Streams the file's full content, tags concatenated in tag order.
    #[must_use]
    pub fn content(&self) -> ChunkReader {
        self.storage
            .reader(self.entry.data_refs().cloned().collect())
    }

    /// Reads the file's full content into memory.
    pub async fn read_all(&self) -> Result<Bytes> {
        self.content().read_all().await
    }

    /// Reads the content of a single tag, or `None` if the tag is absent.
    pub async fn read_tag(&self, tag: &str) -> Result<Option<Bytes>> {
        let Some(tag_ref) = self.entry.tags.iter().find(|t| t.tag == tag) else {
            return Ok(None);
        };
        let mut reader = self.storage.reader(tag_ref.data_refs.clone());
        let mut out = BytesMut::new();
        while let Some(data) = reader.next().await? {
            out.extend_from_slice(&data);
        }
        Ok(Some(out.freeze()))
    }
}
