//! Shard task worker.

use std::sync::Arc;
use std::time::Duration;

use sediment_chunk::ChunkStorage;
use sediment_common::{Result, StorageConfig};
use sediment_meta::{MetaStore, Tracker};
use tracing::{debug, warn};

use super::task::{ShardResult, ShardTask, TaskQueue};
use super::merge_shard;

/// Claims shard tasks off a queue and merges them into primitive layers.
///
/// Any number of workers may run against the same queue, in-process or
/// out; the queue is the only coordination point.
pub struct Worker {
    storage: ChunkStorage,
    meta: MetaStore,
    tracker: Tracker,
    queue: Arc<dyn TaskQueue>,
    config: StorageConfig,
}

impl Worker {
    pub fn new(
        storage: ChunkStorage,
        meta: MetaStore,
        tracker: Tracker,
        queue: Arc<dyn TaskQueue>,
        config: &StorageConfig,
    ) -> Self {
        Self {
            storage,
            meta,
            tracker,
            queue,
            config: config.clone(),
        }
    }

    /// Claim and process tasks until the queue shuts down.
    pub async fn run(&self) -> Result<()> {
        let mut backoff = Duration::from_millis(100);
        loop {
            match self.queue.claim().await {
                Ok(Some(task)) => {
                    backoff = Duration::from_millis(100);
                    self.process(task).await?;
                }
                Ok(None) => return Ok(()),
                Err(e) if e.is_retryable() => {
                    warn!(error = %e, "claim failed; backing off");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(10));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Merge one shard and report the outcome. Task-level failures go back
    /// through the queue rather than killing the worker.
    async fn process(&self, task: ShardTask) -> Result<()> {
        debug!(task = %task.id, inputs = task.inputs.len(), "processing shard task");
        let outcome = merge_shard(
            &self.storage,
            &self.meta,
            &self.tracker,
            &self.config,
            &task.inputs,
            &task.range,
            self.config.compaction.intermediate_ttl,
        )
        .await
        .map_err(|e| e.to_string());
        self.queue
            .complete(ShardResult {
                id: task.id,
                outcome,
            })
            .await
    }
}
