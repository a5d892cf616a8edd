//! Top-level handle tying chunks, metadata, tracking, compaction and GC
//! together.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use sediment_chunk::{ChunkStorage, ObjClient};
use sediment_common::{Error, FileSetId, PathRange, Result, StorageConfig};
use sediment_meta::{
    ChunkDeleter, FileSetDeleter, GarbageCollector, MetaStore, Renewer, Tracker, with_renewer,
};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::compact::{Compactor, MemTaskQueue, TaskQueue, Worker};
use crate::index;
use crate::reader::Reader;
use crate::resolver::Resolver;
use crate::unordered::UnorderedWriter;
use crate::writer::Writer;

/// One storage instance. Cheap to clone; all clones share the same
/// backends and writer admission semaphore.
#[derive(Clone)]
pub struct Storage {
    chunks: ChunkStorage,
    meta: MetaStore,
    tracker: Tracker,
    config: StorageConfig,
    queue: Arc<dyn TaskQueue>,
    writers: Arc<Semaphore>,
}

impl Storage {
    /// Open against a chunk backend and a metadata database path, with an
    /// in-process compaction queue.
    pub fn open(
        client: Arc<dyn ObjClient>,
        db_path: impl AsRef<Path>,
        config: StorageConfig,
    ) -> Result<Self> {
        let queue: Arc<dyn TaskQueue> = Arc::new(MemTaskQueue::new());
        Self::open_with_queue(client, db_path, config, queue)
    }

    /// Open with an externally provided task queue, for deployments where
    /// compaction workers run elsewhere.
    pub fn open_with_queue(
        client: Arc<dyn ObjClient>,
        db_path: impl AsRef<Path>,
        config: StorageConfig,
        queue: Arc<dyn TaskQueue>,
    ) -> Result<Self> {
        let (meta, tracker) = sediment_meta::open(db_path)?;
        let chunks = ChunkStorage::new(client, &config.chunk);
        let writers = Arc::new(Semaphore::new(config.max_open_writers));
        Ok(Self {
            chunks,
            meta,
            tracker,
            config,
            queue,
            writers,
        })
    }

    /// Spawn one compaction worker against this instance's queue.
    #[must_use]
    pub fn spawn_worker(&self) -> JoinHandle<Result<()>> {
        let worker = Worker::new(
            self.chunks.clone(),
            self.meta.clone(),
            self.tracker.clone(),
            self.queue.clone(),
            &self.config,
        );
        tokio::spawn(async move { worker.run().await })
    }

    /// An ordered writer producing one primitive layer.
    #[must_use]
    pub fn writer(&self) -> Writer {
        Writer::new(
            self.chunks.clone(),
            self.meta.clone(),
            self.tracker.clone(),
            &self.config,
        )
    }

    /// An unordered writer. Waits for an admission permit when
    /// `max_open_writers` are already open.
    pub async fn unordered_writer(&self, renewer: Option<Arc<Renewer>>) -> Result<UnorderedWriter> {
        let permit = self
            .writers
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::unavailable("writer semaphore closed"))?;
        Ok(UnorderedWriter::new(
            self.chunks.clone(),
            self.meta.clone(),
            self.tracker.clone(),
            &self.config,
            renewer,
            Some(permit),
        ))
    }

    /// A merged read view over `id`.
    #[must_use]
    pub fn read(&self, id: FileSetId) -> Reader {
        self.read_layers(&[id])
    }

    /// A merged read view layering `ids` oldest first.
    #[must_use]
    pub fn read_layers(&self, ids: &[FileSetId]) -> Reader {
        Reader::new(self.chunks.clone(), self.meta.clone(), ids.to_vec())
    }

    /// Copy the files of `source` within `range` into `writer` without
    /// rereading or rewriting their content.
    pub async fn copy_files(
        &self,
        writer: &mut Writer,
        source: FileSetId,
        range: &PathRange,
    ) -> Result<()> {
        let mut files = self.read(source).files(range)?;
        while let Some(file) = files.next().await? {
            writer.copy(file.index_entry())?;
        }
        Ok(())
    }

    /// Collapse `id` into a single primitive fileset.
    pub async fn compact(&self, id: FileSetId, ttl: Duration) -> Result<FileSetId> {
        self.compactor().compact(id, ttl).await
    }

    /// Collapse several filesets, layered oldest first, into a single
    /// primitive fileset.
    pub async fn compact_layers(&self, inputs: &[FileSetId], ttl: Duration) -> Result<FileSetId> {
        self.compactor().compact_many(inputs, ttl).await
    }

    /// Consistency check over a primitive fileset: replays its entries
    /// through a scratch write pass, recomputing each index entry, and
    /// verifies the recomputed paths line up with the stored stream.
    pub async fn validate(&self, id: FileSetId) -> Result<()> {
        let primitive = Resolver::new(self.meta.clone()).primitive(id)?;
        let stored = index::Reader::new(&self.chunks, primitive.additive)
            .collect()
            .await?;
        let expected: Arc<Mutex<VecDeque<String>>> =
            Arc::new(Mutex::new(stored.iter().map(|e| e.path.clone()).collect()));
        let queue = Arc::clone(&expected);
        let mut scratch =
            self.writer()
                .with_ttl(Duration::ZERO)
                .with_index_callback(move |entry| match queue.lock().pop_front() {
                    Some(path) if path == entry.path => Ok(()),
                    Some(path) => Err(Error::IndexDesync {
                        expected: path,
                        actual: entry.path.clone(),
                    }),
                    None => Err(Error::IndexDesync {
                        expected: "<end of index>".to_string(),
                        actual: entry.path.clone(),
                    }),
                });
        for entry in &stored {
            scratch.copy(entry)?;
        }
        scratch.close().await?;
        if let Some(path) = expected.lock().pop_front() {
            return Err(Error::IndexDesync {
                expected: path,
                actual: "<end of index>".to_string(),
            });
        }
        Ok(())
    }

    /// Whether `id` is already a single primitive layer.
    pub fn is_compacted(&self, id: FileSetId) -> Result<bool> {
        self.compactor().is_compacted(id)
    }

    fn compactor(&self) -> Compactor {
        Compactor::new(
            self.chunks.clone(),
            self.meta.clone(),
            self.tracker.clone(),
            self.queue.clone(),
            self.config.clone(),
        )
    }

    /// Extend the lifetime of `id`.
    pub fn set_ttl(&self, id: FileSetId, ttl: Duration) -> Result<()> {
        self.tracker.set_ttl(&id.tracker_id(), ttl)?;
        Ok(())
    }

    /// Mark `id` for collection at the next sweep.
    pub fn drop_fileset(&self, id: FileSetId) -> Result<()> {
        self.tracker.drop_now(&id.tracker_id())
    }

    /// Whether `id` names a live fileset.
    pub fn exists(&self, id: FileSetId) -> Result<bool> {
        self.meta.exists(id)
    }

    /// Run `f` with a renewer keeping its filesets alive until it returns.
    pub async fn with_renewer<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce(Arc<Renewer>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        with_renewer(self.tracker.clone(), self.config.default_ttl, f).await
    }

    /// The garbage collector for this instance's backends.
    #[must_use]
    pub fn garbage_collector(&self) -> GarbageCollector {
        GarbageCollector::new(
            self.tracker.clone(),
            vec![
                Arc::new(ChunkDeleter::new(self.chunks.clone())),
                Arc::new(FileSetDeleter::new(Arc::new(self.meta.clone()))),
            ],
        )
    }

    /// One GC sweep to fixpoint; returns the number of objects deleted.
    pub async fn gc_once(&self) -> Result<usize> {
        self.garbage_collector().run_once().await
    }

    #[must_use]
    pub fn chunks(&self) -> &ChunkStorage {
        &self.chunks
    }

    #[must_use]
    pub fn config(&self) -> &StorageConfig {
        &self.config
    }
}
