//! Index stream writer
//!
//! Frames each entry as a little-endian u32 length followed by its bincode
//! encoding, packed into chunks by a `ChunkWriter`. The caller contract is
//! strictly increasing paths; violations are rejected as programming
//! errors rather than silently producing an unmergeable stream.

use super::IndexEntry;
use sediment_chunk::{ChunkStorage, ChunkWriter, DataRef};
use sediment_common::{ChunkHash, Error, Result};

/// Appends sorted index entries into a chunk-backed stream
pub struct Writer {
    chunks: ChunkWriter,
    last_path: Option<String>,
    count: u64,
}

impl Writer {
    #[must_use]
    pub fn new(storage: &ChunkStorage) -> Self {
        let mut chunks = storage.writer();
        chunks.begin_segment();
        Self {
            chunks,
            last_path: None,
            count: 0,
        }
    }

    /// Append one entry; `entry.path` must exceed every previous path.
    pub async fn append(&mut self, entry: &IndexEntry) -> Result<()> {
        if let Some(prev) = &self.last_path
            && entry.path.as_str() <= prev.as_str()
        {
            return Err(Error::PathOrder {
                prev: prev.clone(),
                next: entry.path.clone(),
            });
        }
        self.last_path = Some(entry.path.clone());
        let encoded =
            bincode::serialize(entry).map_err(|e| Error::serialization(e.to_string()))?;
        let len = u32::try_from(encoded.len())
            .map_err(|_| Error::serialization("index entry exceeds frame limit"))?;
        self.chunks.write(&len.to_le_bytes()).await?;
        self.chunks.write(&encoded).await?;
        self.count += 1;
        Ok(())
    }

    /// Number of entries appended so far
    #[must_use]
    pub fn len(&self) -> u64 {
        self.count
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Seal the stream; returns its data refs and the chunks written.
    pub async fn close(mut self) -> Result<(Vec<DataRef>, Vec<ChunkHash>)> {
        self.chunks.end_segment();
        let mut out = self.chunks.close().await?;
        let refs = out.segments.pop().unwrap_or_default();
        Ok((refs, out.chunks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::TagRef;
    use sediment_chunk::MemObjClient;
    use sediment_common::config::ChunkConfig;

    fn storage() -> ChunkStorage {
        ChunkStorage::new(MemObjClient::shared(), &ChunkConfig::default())
    }

    fn entry(path: &str) -> IndexEntry {
        IndexEntry::additive(
            path,
            vec![TagRef {
                tag: "default".into(),
                data_refs: Vec::new(),
            }],
        )
    }

    #[tokio::test]
    async fn test_rejects_unsorted_paths() {
        let storage = storage();
        let mut w = Writer::new(&storage);
        w.append(&entry("/b")).await.unwrap();

        let err = w.append(&entry("/a")).await.unwrap_err();
        assert!(matches!(err, Error::PathOrder { .. }));
        assert!(err.is_consistency());
    }

    #[tokio::test]
    async fn test_rejects_duplicate_path() {
        let storage = storage();
        let mut w = Writer::new(&storage);
        w.append(&entry("/a")).await.unwrap();
        assert!(w.append(&entry("/a")).await.is_err());
    }

    #[tokio::test]
    async fn test_empty_stream_closes_clean() {
        let storage = storage();
        let w = Writer::new(&storage);
        let (refs, chunks) = w.close().await.unwrap();
        assert!(refs.is_empty());
        assert!(chunks.is_empty());
    }
}
