//! Sediment FileSets - immutable sorted layers over chunk storage
//!
//! A fileset is a sealed, sorted mapping from paths to tagged content.
//! Primitive filesets hold serialized index streams (additive entries and
//! tombstones); composites stack filesets oldest to newest, resolved
//! lazily at read time by a layered merge. Unordered ingest buffers in
//! memory and seals intermediate layers; compaction collapses a stack back
//! into a single primitive, sharded across workers by path range.

pub mod compact;
pub mod index;
pub mod merge;
pub mod reader;
pub mod resolver;
pub mod storage;
pub mod unordered;
pub mod writer;

pub use compact::{Compactor, MemTaskQueue, ShardResult, ShardTask, TaskId, TaskQueue, Worker};
pub use index::{IndexEntry, TagRef};
pub use merge::{MergeIterator, Merged};
pub use reader::{File, FileStream, Reader, TombstoneStream};
pub use resolver::Resolver;
pub use storage::Storage;
pub use unordered::{MemFileSet, UnorderedWriter};
pub use writer::{FileWriter, Writer, compose};
