//! Sediment Chunk Storage - content-addressed byte storage
//!
//! This crate implements the deduplicated chunk layer:
//! - Blob-backend abstraction with in-memory and local-filesystem clients
//! - Content-addressed put/get with idempotent dedup
//! - Streaming chunk writer/reader over `DataRef` sub-ranges
//! - Explicit-capacity LRU chunk cache

pub mod cache;
pub mod obj;
pub mod storage;

pub use cache::{CacheStats, ChunkCache};
pub use obj::{LocalObjClient, MemObjClient, ObjClient};
pub use storage::{ChunkReader, ChunkStorage, ChunkWriter, ChunkWriterOutput, DataRef, SegmentId};
