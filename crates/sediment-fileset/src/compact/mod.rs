//! Compaction: collapsing a layer stack into one primitive fileset.
//!
//! Compaction runs in rounds. Each round groups up to `max_fan_in`
//! adjacent layers, merges every group (sharded across workers when the
//! group is large), and feeds the outputs into the next round until a
//! single primitive remains. Intermediate outputs live on short TTLs,
//! kept alive by a renewer for the duration of the attempt.

pub mod task;
pub mod worker;

pub use task::{MemTaskQueue, ShardResult, ShardTask, TaskId, TaskQueue};
pub use worker::Worker;

use std::sync::Arc;
use std::time::Duration;

use sediment_chunk::ChunkStorage;
use sediment_common::{FileSetId, PathRange, Result, StorageConfig};
use sediment_meta::{MetaStore, Renewer, Tracker, with_renewer};
use tracing::{debug, info, warn};

use crate::index::shard_by_size;
use crate::merge::MergeIterator;
use crate::resolver::Resolver;
use crate::writer::Writer;

/// Split `layers` into consecutive groups of at most `max_fan_in`,
/// balanced so no group is more than one element larger than another.
pub fn plan_groups(layers: &[FileSetId], max_fan_in: usize) -> Vec<Vec<FileSetId>> {
    let max_fan_in = max_fan_in.max(2);
    if layers.is_empty() {
        return Vec::new();
    }
    let group_count = layers.len().div_ceil(max_fan_in);
    let base = layers.len() / group_count;
    let remainder = layers.len() % group_count;
    let mut out = Vec::with_capacity(group_count);
    let mut offset = 0;
    for i in 0..group_count {
        let len = base + usize::from(i < remainder);
        out.push(layers[offset..offset + len].to_vec());
        offset += len;
    }
    out
}

/// Merge the `range` slice of `inputs` (oldest first) into one primitive
/// layer registered under `ttl`.
pub(crate) async fn merge_shard(
    storage: &ChunkStorage,
    meta: &MetaStore,
    tracker: &Tracker,
    config: &StorageConfig,
    inputs: &[FileSetId],
    range: &PathRange,
    ttl: Duration,
) -> Result<FileSetId> {
    let resolver = Resolver::new(meta.clone());
    let mut layers = Vec::new();
    for id in inputs {
        layers.extend(resolver.flatten(*id)?);
    }
    let mut merge = MergeIterator::new(storage, &layers, range);
    let mut writer =
        Writer::new(storage.clone(), meta.clone(), tracker.clone(), config).with_ttl(ttl);
    while let Some(merged) = merge.next().await? {
        if let Some(del) = &merged.deletive {
            writer.copy_deletive(del)?;
        }
        if let Some(add) = &merged.additive {
            writer.copy(add)?;
        }
    }
    writer.close().await
}

/// Drives compaction attempts against a task queue.
#[derive(Clone)]
pub struct Compactor {
    storage: ChunkStorage,
    meta: MetaStore,
    tracker: Tracker,
    queue: Arc<dyn TaskQueue>,
    config: StorageConfig,
}

impl Compactor {
    pub fn new(
        storage: ChunkStorage,
        meta: MetaStore,
        tracker: Tracker,
        queue: Arc<dyn TaskQueue>,
        config: StorageConfig,
    ) -> Self {
        Self {
            storage,
            meta,
            tracker,
            queue,
            config,
        }
    }

    /// Whether `id` is already a single primitive layer.
    pub fn is_compacted(&self, id: FileSetId) -> Result<bool> {
        Resolver::new(self.meta.clone()).is_primitive(id)
    }

    /// Collapse `id` into one primitive fileset registered under `ttl`.
    ///
    /// An already-primitive fileset is returned unchanged. Inputs and
    /// intermediates are renewed for the whole attempt; on failure they
    /// simply age out.
    pub async fn compact(&self, id: FileSetId, ttl: Duration) -> Result<FileSetId> {
        if Resolver::new(self.meta.clone()).is_primitive(id)? {
            return Ok(id);
        }
        self.compact_many(&[id], ttl).await
    }

    /// Collapse `inputs`, layered oldest first, into one primitive fileset
    /// registered under `ttl`.
    pub async fn compact_many(&self, inputs: &[FileSetId], ttl: Duration) -> Result<FileSetId> {
        let resolver = Resolver::new(self.meta.clone());
        let mut leaves = Vec::new();
        for id in inputs {
            leaves.extend(resolver.leaf_ids(*id)?);
        }
        if leaves.is_empty() {
            // A composite with no layers compacts to an empty primitive.
            let writer = Writer::new(
                self.storage.clone(),
                self.meta.clone(),
                self.tracker.clone(),
                &self.config,
            )
            .with_ttl(ttl);
            return writer.close().await;
        }
        let this = self.clone();
        let intermediate_ttl = self.config.compaction.intermediate_ttl;
        let out = with_renewer(self.tracker.clone(), intermediate_ttl, |renewer| async move {
            for leaf in &leaves {
                renewer.add(leaf.tracker_id());
            }
            let mut layers = leaves;
            let mut round = 0usize;
            while layers.len() > 1 {
                let groups = plan_groups(&layers, this.config.compaction.max_fan_in);
                debug!(round, layers = layers.len(), groups = groups.len(), "compaction round");
                let mut next = Vec::with_capacity(groups.len());
                for group in groups {
                    let out = if group.len() == 1 {
                        group[0]
                    } else {
                        this.compact_group(&group, &renewer).await?
                    };
                    next.push(out);
                }
                layers = next;
                round += 1;
            }
            Ok(layers[0])
        })
        .await?;
        self.tracker.set_ttl(&out.tracker_id(), ttl)?;
        info!(inputs = inputs.len(), output = %out, "compacted filesets");
        Ok(out)
    }

    /// Merge one group of layers, sharding across workers when the merged
    /// index is large enough to split.
    async fn compact_group(
        &self,
        group: &[FileSetId],
        renewer: &Arc<Renewer>,
    ) -> Result<FileSetId> {
        let shards = self.plan_shards(group).await?;
        let ttl = self.config.compaction.intermediate_ttl;
        if shards.len() == 1 {
            let out = merge_shard(
                &self.storage,
                &self.meta,
                &self.tracker,
                &self.config,
                group,
                &PathRange::full(),
                ttl,
            )
            .await?;
            renewer.add(out.tracker_id());
            return Ok(out);
        }

        let mut task_ids = Vec::with_capacity(shards.len());
        for range in shards {
            let task = ShardTask {
                id: TaskId::new(),
                inputs: group.to_vec(),
                range,
            };
            task_ids.push(task.id);
            self.submit_with_backoff(task).await?;
        }
        let mut outputs = Vec::with_capacity(task_ids.len());
        for task_id in task_ids {
            let out = self.queue.await_result(task_id).await?;
            renewer.add(out.tracker_id());
            outputs.push(out);
        }
        self.concat(&outputs, renewer).await
    }

    /// Submit one task, retrying transient queue failures without bound.
    /// Repeating a submit is safe, tasks are idempotent and keyed by id.
    async fn submit_with_backoff(&self, task: ShardTask) -> Result<()> {
        let mut backoff = Duration::from_millis(100);
        loop {
            match self.queue.submit(task.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() => {
                    warn!(task = %task.id, error = %e, "submit failed; backing off");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(10));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Concatenate shard outputs (disjoint, ordered path ranges) into one
    /// primitive layer without rewriting content.
    async fn concat(&self, shards: &[FileSetId], renewer: &Arc<Renewer>) -> Result<FileSetId> {
        let resolver = Resolver::new(self.meta.clone());
        let mut writer = Writer::new(
            self.storage.clone(),
            self.meta.clone(),
            self.tracker.clone(),
            &self.config,
        )
        .with_ttl(self.config.compaction.intermediate_ttl);
        for shard in shards {
            let primitive = resolver.primitive(*shard)?;
            let mut deletive =
                crate::index::Reader::new(&self.storage, primitive.deletive.clone());
            while let Some(entry) = deletive.next().await? {
                writer.copy_deletive(&entry)?;
            }
            let mut additive = crate::index::Reader::new(&self.storage, primitive.additive);
            while let Some(entry) = additive.next().await? {
                writer.copy(&entry)?;
            }
        }
        let out = writer.close().await?;
        renewer.add(out.tracker_id());
        Ok(out)
    }

    /// Size-weighted shard ranges for a group's merged index.
    async fn plan_shards(&self, group: &[FileSetId]) -> Result<Vec<PathRange>> {
        let resolver = Resolver::new(self.meta.clone());
        let mut layers = Vec::new();
        for id in group {
            layers.extend(resolver.flatten(*id)?);
        }
        let mut merge = MergeIterator::new(&self.storage, &layers, &PathRange::full());
        let mut entries = Vec::new();
        while let Some(merged) = merge.next().await? {
            let size = merged
                .additive
                .as_ref()
                .map_or(1, |e| e.size_bytes().max(1));
            entries.push((merged.path, size));
        }
        Ok(shard_by_size(
            &entries,
            self.config.compaction.target_shard_count,
        ))
    }
}
