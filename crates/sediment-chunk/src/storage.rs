//! Content-addressed chunk storage
//!
//! `ChunkStorage` stores immutable byte blobs keyed by their SHA-256. Puts
//! of existing content are skipped (idempotent dedup), and a chunk is never
//! visible until fully durable.
//!
//! `ChunkWriter` packs a stream of logical segments into target-size
//! chunks: segments smaller than a chunk share one, segments larger than a
//! chunk span several. Each finished segment resolves to a list of
//! `DataRef` sub-ranges. `ChunkReader` is the inverse: a lazy, finite,
//! non-restartable concatenation of sub-ranges.

use crate::cache::ChunkCache;
use crate::obj::ObjClient;
use bytes::{Bytes, BytesMut};
use sediment_common::config::ChunkConfig;
use sediment_common::{ChunkHash, Error, Result, checksum};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

/// Reference to a byte sub-range of one chunk
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRef {
    /// Content hash of the referenced chunk
    pub chunk: ChunkHash,
    /// Byte offset within the chunk
    pub offset: u64,
    /// Number of bytes referenced
    pub length: u64,
    /// Content hash of the sub-range; present only when the ref does not
    /// cover the whole chunk
    pub hash: Option<ChunkHash>,
}

impl DataRef {
    /// Whether this ref covers its whole chunk
    #[must_use]
    pub fn is_whole_chunk(&self) -> bool {
        self.hash.is_none()
    }
}

/// Content-addressed, deduplicated chunk store
#[derive(Clone)]
pub struct ChunkStorage {
    client: Arc<dyn ObjClient>,
    cache: Arc<ChunkCache>,
    target_size: usize,
}

impl ChunkStorage {
    pub fn new(client: Arc<dyn ObjClient>, config: &ChunkConfig) -> Self {
        Self {
            client,
            cache: Arc::new(ChunkCache::new(config.cache_capacity)),
            target_size: config.target_size,
        }
    }

    /// Store one blob as a single chunk. Returns a ref to the existing
    /// chunk when content with the same hash is already present.
    pub async fn put(&self, data: Bytes) -> Result<DataRef> {
        let hash = checksum::content_hash(&data);
        let key = hash.to_hex();
        let length = data.len() as u64;
        if !self.client.exists(&key).await? {
            debug!(chunk = %hash, size = length, "uploading chunk");
            self.client.put(&key, data).await?;
        }
        Ok(DataRef {
            chunk: hash,
            offset: 0,
            length,
            hash: None,
        })
    }

    /// Fetch a whole chunk by hash, through the cache, verifying content
    /// addressing on the way in.
    pub async fn fetch(&self, hash: &ChunkHash) -> Result<Bytes> {
        if let Some(data) = self.cache.get(hash) {
            return Ok(data);
        }
        let data = self.client.get(&hash.to_hex()).await?;
        let actual = checksum::content_hash(&data);
        if actual != *hash {
            return Err(Error::ChecksumMismatch {
                expected: hash.to_hex(),
                actual: actual.to_hex(),
            });
        }
        self.cache.insert(*hash, data.clone());
        Ok(data)
    }

    /// Whether a chunk exists in the backend
    pub async fn exists(&self, hash: &ChunkHash) -> Result<bool> {
        self.client.exists(&hash.to_hex()).await
    }

    /// Delete a chunk. Called by the GC deleter once the tracker shows no
    /// live reference.
    pub async fn delete(&self, hash: &ChunkHash) -> Result<()> {
        self.cache.invalidate(hash);
        self.client.delete(&hash.to_hex()).await
    }

    /// Streaming segment writer over this store
    #[must_use]
    pub fn writer(&self) -> ChunkWriter {
        ChunkWriter::new(self.clone(), self.target_size)
    }

    /// Lazy reader over an ordered list of sub-ranges
    #[must_use]
    pub fn reader(&self, refs: Vec<DataRef>) -> ChunkReader {
        ChunkReader {
            storage: self.clone(),
            refs: refs.into(),
        }
    }
}

/// Identifier of a logical segment within one `ChunkWriter` stream
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SegmentId(usize);

impl SegmentId {
    /// Position of this segment in the writer's output
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

struct PendingRange {
    segment: usize,
    start: usize,
    end: usize,
}

/// Output of a closed `ChunkWriter`
pub struct ChunkWriterOutput {
    /// Resolved refs for each segment, in `begin_segment` order
    pub segments: Vec<Vec<DataRef>>,
    /// Every chunk referenced by this stream (for tracker registration)
    pub chunks: Vec<ChunkHash>,
}

/// Packs sequentially written segments into content-addressed chunks.
///
/// Only one segment is open at a time; bytes buffer in memory up to the
/// target chunk size, then flush as one chunk. Refs into a not-yet-flushed
/// chunk resolve when it flushes, so finished segments become addressable
/// at `close`.
pub struct ChunkWriter {
    storage: ChunkStorage,
    target_size: usize,
    buf: BytesMut,
    pending: Vec<PendingRange>,
    open: Option<(usize, usize)>, // (segment, start offset in buf)
    segments: Vec<Vec<DataRef>>,
    chunks: Vec<ChunkHash>,
}

impl ChunkWriter {
    fn new(storage: ChunkStorage, target_size: usize) -> Self {
        Self {
            storage,
            target_size,
            buf: BytesMut::new(),
            pending: Vec::new(),
            open: None,
            segments: Vec::new(),
            chunks: Vec::new(),
        }
    }

    /// Open the next logical segment. Any previously open segment must
    /// have been ended.
    pub fn begin_segment(&mut self) -> SegmentId {
        assert!(self.open.is_none(), "segment already open");
        let id = self.segments.len();
        self.segments.push(Vec::new());
        self.open = Some((id, self.buf.len()));
        SegmentId(id)
    }

    /// Append bytes to the open segment, flushing full chunks as the
    /// buffer crosses the target size.
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        assert!(self.open.is_some(), "no open segment");
        self.buf.extend_from_slice(data);
        while self.buf.len() >= self.target_size {
            self.flush_chunk(self.target_size).await?;
        }
        Ok(())
    }

    /// Close the open segment
    pub fn end_segment(&mut self) {
        let (segment, start) = self.open.take().expect("no open segment");
        if start < self.buf.len() {
            self.pending.push(PendingRange {
                segment,
                start,
                end: self.buf.len(),
            });
        }
    }

    /// Flush the remaining buffer and resolve every segment's refs
    pub async fn close(mut self) -> Result<ChunkWriterOutput> {
        assert!(self.open.is_none(), "segment still open at close");
        if !self.buf.is_empty() {
            let len = self.buf.len();
            self.flush_chunk(len).await?;
        }
        Ok(ChunkWriterOutput {
            segments: self.segments,
            chunks: self.chunks,
        })
    }

    /// Upload the first `chunk_len` buffered bytes as one chunk and emit
    /// refs for every pending range that falls inside it.
    async fn flush_chunk(&mut self, chunk_len: usize) -> Result<()> {
        let chunk_bytes = self.buf.split_to(chunk_len).freeze();
        let data_ref = self.storage.put(chunk_bytes.clone()).await?;
        let chunk = data_ref.chunk;
        self.chunks.push(chunk);

        // Pending ranges are ordered and non-overlapping; at most the last
        // one straddles the chunk boundary.
        let mut remaining = Vec::new();
        for range in self.pending.drain(..) {
            if range.start >= chunk_len {
                remaining.push(PendingRange {
                    segment: range.segment,
                    start: range.start - chunk_len,
                    end: range.end - chunk_len,
                });
                continue;
            }
            let ref_end = range.end.min(chunk_len);
            self.segments[range.segment].push(sub_range_ref(
                chunk,
                &chunk_bytes,
                range.start,
                ref_end,
            ));
            if range.end > chunk_len {
                remaining.push(PendingRange {
                    segment: range.segment,
                    start: 0,
                    end: range.end - chunk_len,
                });
            }
        }
        self.pending = remaining;

        // The open segment's already-buffered bytes form a ref too
        if let Some((segment, start)) = self.open {
            if start < chunk_len {
                self.segments[segment].push(sub_range_ref(chunk, &chunk_bytes, start, chunk_len));
                self.open = Some((segment, 0));
            } else {
                self.open = Some((segment, start - chunk_len));
            }
        }
        Ok(())
    }
}

fn sub_range_ref(chunk: ChunkHash, chunk_bytes: &Bytes, start: usize, end: usize) -> DataRef {
    let whole = start == 0 && end == chunk_bytes.len();
    DataRef {
        chunk,
        offset: start as u64,
        length: (end - start) as u64,
        hash: if whole {
            None
        } else {
            Some(checksum::content_hash(&chunk_bytes[start..end]))
        },
    }
}

/// Lazy concatenation of chunk sub-ranges.
///
/// Finite and forward-only; re-reading requires building a new reader.
pub struct ChunkReader {
    storage: ChunkStorage,
    refs: VecDeque<DataRef>,
}

impl ChunkReader {
    /// The bytes of the next sub-range, or `None` when exhausted
    pub async fn next(&mut self) -> Result<Option<Bytes>> {
        let Some(data_ref) = self.refs.pop_front() else {
            return Ok(None);
        };
        let chunk = self.storage.fetch(&data_ref.chunk).await?;
        let start = data_ref.offset as usize;
        let end = start + data_ref.length as usize;
        if end > chunk.len() {
            return Err(Error::storage(format!(
                "data ref [{start}, {end}) exceeds chunk {} of {} bytes",
                data_ref.chunk,
                chunk.len()
            )));
        }
        let slice = chunk.slice(start..end);
        if let Some(expected) = data_ref.hash {
            let actual = checksum::content_hash(&slice);
            if actual != expected {
                return Err(Error::ChecksumMismatch {
                    expected: expected.to_hex(),
                    actual: actual.to_hex(),
                });
            }
        }
        Ok(Some(slice))
    }

    /// Drain the stream into one buffer
    pub async fn read_all(&mut self) -> Result<Bytes> {
        let mut out = BytesMut::new();
        while let Some(part) = self.next().await? {
            out.extend_from_slice(&part);
        }
        Ok(out.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obj::MemObjClient;

    fn test_storage(target_size: usize) -> (Arc<MemObjClient>, ChunkStorage) {
        let client = MemObjClient::shared();
        let config = ChunkConfig {
            target_size,
            cache_capacity: 8,
            ..ChunkConfig::default()
        };
        let storage = ChunkStorage::new(client.clone(), &config);
        (client, storage)
    }

    #[tokio::test]
    async fn test_put_is_idempotent() {
        let (client, storage) = test_storage(1024);
        let r1 = storage.put(Bytes::from_static(b"same bytes")).await.unwrap();
        let footprint = client.total_bytes();
        let r2 = storage.put(Bytes::from_static(b"same bytes")).await.unwrap();

        assert_eq!(r1.chunk, r2.chunk);
        assert_eq!(client.len(), 1);
        // the second put must not grow the stored footprint
        assert_eq!(client.total_bytes(), footprint);

        let bytes1 = storage.reader(vec![r1]).read_all().await.unwrap();
        let bytes2 = storage.reader(vec![r2]).read_all().await.unwrap();
        assert_eq!(bytes1, bytes2);
    }

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let (_, storage) = test_storage(1024);
        let data = Bytes::from((0..=255u8).collect::<Vec<_>>());
        let r = storage.put(data.clone()).await.unwrap();
        assert_eq!(storage.reader(vec![r]).read_all().await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_missing_chunk_is_not_found() {
        let (_, storage) = test_storage(1024);
        let err = storage
            .fetch(&ChunkHash::from_bytes([9; 32]))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_writer_packs_small_segments_into_one_chunk() {
        let (client, storage) = test_storage(1024);
        let mut w = storage.writer();

        w.begin_segment();
        w.write(b"first").await.unwrap();
        w.end_segment();
        w.begin_segment();
        w.write(b"second").await.unwrap();
        w.end_segment();

        let out = w.close().await.unwrap();
        assert_eq!(client.len(), 1);
        assert_eq!(out.chunks.len(), 1);
        assert_eq!(out.segments.len(), 2);
        // both segments alias the same chunk, via sub-range refs
        assert_eq!(out.segments[0][0].chunk, out.segments[1][0].chunk);
        assert!(!out.segments[0][0].is_whole_chunk());

        let first = storage
            .reader(out.segments[0].clone())
            .read_all()
            .await
            .unwrap();
        let second = storage
            .reader(out.segments[1].clone())
            .read_all()
            .await
            .unwrap();
        assert_eq!(first, Bytes::from_static(b"first"));
        assert_eq!(second, Bytes::from_static(b"second"));
    }

    #[tokio::test]
    async fn test_writer_splits_large_segment_across_chunks() {
        let (client, storage) = test_storage(64);
        let data: Vec<u8> = (0..200).map(|i| (i % 251) as u8).collect();

        let mut w = storage.writer();
        w.begin_segment();
        w.write(&data).await.unwrap();
        w.end_segment();
        let out = w.close().await.unwrap();

        assert!(client.len() > 1);
        assert!(out.segments[0].len() > 1);
        let read = storage
            .reader(out.segments[0].clone())
            .read_all()
            .await
            .unwrap();
        assert_eq!(read, Bytes::from(data));
    }

    #[tokio::test]
    async fn test_writer_segment_straddling_flush_boundary() {
        let (_, storage) = test_storage(16);
        let mut w = storage.writer();

        w.begin_segment();
        w.write(&[1u8; 10]).await.unwrap();
        w.end_segment();
        w.begin_segment();
        // crosses the 16-byte boundary mid-segment
        w.write(&[2u8; 20]).await.unwrap();
        w.end_segment();
        let out = w.close().await.unwrap();

        let a = storage
            .reader(out.segments[0].clone())
            .read_all()
            .await
            .unwrap();
        let b = storage
            .reader(out.segments[1].clone())
            .read_all()
            .await
            .unwrap();
        assert_eq!(a, Bytes::from(vec![1u8; 10]));
        assert_eq!(b, Bytes::from(vec![2u8; 20]));
    }

    #[tokio::test]
    async fn test_reader_detects_corrupt_sub_range() {
        let (_, storage) = test_storage(1024);
        let r = storage.put(Bytes::from_static(b"0123456789")).await.unwrap();
        let bad = DataRef {
            chunk: r.chunk,
            offset: 0,
            length: 4,
            hash: Some(ChunkHash::from_bytes([0; 32])),
        };
        let err = storage.reader(vec![bad]).read_all().await.unwrap_err();
        assert!(err.is_consistency());
    }

    #[tokio::test]
    async fn test_delete_then_fetch_is_not_found() {
        let (_, storage) = test_storage(1024);
        let r = storage.put(Bytes::from_static(b"bytes")).await.unwrap();
        // warm the cache, then delete must invalidate it
        storage.fetch(&r.chunk).await.unwrap();
        storage.delete(&r.chunk).await.unwrap();
        assert!(storage.fetch(&r.chunk).await.unwrap_err().is_not_found());
    }
}
