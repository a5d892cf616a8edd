//! Task distribution for sharded compaction.

use async_trait::async_trait;
use dashmap::DashMap;
use sediment_common::{Error, FileSetId, PathRange, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::{Mutex, mpsc, oneshot};
use uuid::Uuid;

/// Identity of one shard task.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(Uuid);

impl TaskId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskId({})", self.0)
    }
}

/// Merge one path-range shard of a layer group into a primitive layer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ShardTask {
    pub id: TaskId,
    /// Input layers, oldest first.
    pub inputs: Vec<FileSetId>,
    pub range: PathRange,
}

/// Outcome of a shard task. Failures carry a reason string so the queue
/// stays serializable.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ShardResult {
    pub id: TaskId,
    pub outcome: std::result::Result<FileSetId, String>,
}

/// Distributes shard tasks to workers and routes results back.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Enqueue a task for some worker to claim.
    async fn submit(&self, task: ShardTask) -> Result<()>;

    /// Claim the next task, blocking until one arrives. `None` means the
    /// queue shut down and the worker should exit.
    async fn claim(&self) -> Result<Option<ShardTask>>;

    /// Report a claimed task's outcome.
    async fn complete(&self, result: ShardResult) -> Result<()>;

    /// Wait for the outcome of a submitted task.
    async fn await_result(&self, id: TaskId) -> Result<FileSetId>;
}

/// In-process queue backed by an mpsc channel, results routed through
/// per-task oneshots.
pub struct MemTaskQueue {
    tx: mpsc::UnboundedSender<ShardTask>,
    rx: Mutex<mpsc::UnboundedReceiver<ShardTask>>,
    result_txs: DashMap<TaskId, oneshot::Sender<ShardResult>>,
    result_rxs: DashMap<TaskId, oneshot::Receiver<ShardResult>>,
}

impl MemTaskQueue {
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
            result_txs: DashMap::new(),
            result_rxs: DashMap::new(),
        }
    }
}

impl Default for MemTaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskQueue for MemTaskQueue {
    async fn submit(&self, task: ShardTask) -> Result<()> {
        let (result_tx, result_rx) = oneshot::channel();
        self.result_txs.insert(task.id, result_tx);
        self.result_rxs.insert(task.id, result_rx);
        self.tx
            .send(task)
            .map_err(|_| Error::unavailable("task queue closed"))
    }

    async fn claim(&self) -> Result<Option<ShardTask>> {
        let mut rx = self.rx.lock().await;
        Ok(rx.recv().await)
    }

    async fn complete(&self, result: ShardResult) -> Result<()> {
        let Some((_, tx)) = self.result_txs.remove(&result.id) else {
            return Err(Error::invalid_argument(format!(
                "completion for unknown task {}",
                result.id
            )));
        };
        // The submitter may have given up; that's not the worker's problem.
        let _ = tx.send(result);
        Ok(())
    }

    async fn await_result(&self, id: TaskId) -> Result<FileSetId> {
        let Some((_, rx)) = self.result_rxs.remove(&id) else {
            return Err(Error::invalid_argument(format!(
                "awaiting unknown task {id}"
            )));
        };
        let result = rx
            .await
            .map_err(|_| Error::unavailable("worker dropped without completing task"))?;
        result.outcome.map_err(Error::task_failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> ShardTask {
        ShardTask {
            id: TaskId::new(),
            inputs: vec![FileSetId::new()],
            range: PathRange::full(),
        }
    }

    #[tokio::test]
    async fn test_routes_result_to_submitter() {
        let queue = MemTaskQueue::new();
        let t = task();
        let id = t.id;
        queue.submit(t).await.unwrap();

        let claimed = queue.claim().await.unwrap().unwrap();
        assert_eq!(claimed.id, id);
        let output = FileSetId::new();
        queue
            .complete(ShardResult {
                id,
                outcome: Ok(output),
            })
            .await
            .unwrap();

        assert_eq!(queue.await_result(id).await.unwrap(), output);
    }

    #[tokio::test]
    async fn test_failed_task_surfaces_reason() {
        let queue = MemTaskQueue::new();
        let t = task();
        let id = t.id;
        queue.submit(t).await.unwrap();
        let _ = queue.claim().await.unwrap().unwrap();
        queue
            .complete(ShardResult {
                id,
                outcome: Err("disk on fire".to_string()),
            })
            .await
            .unwrap();
        let err = queue.await_result(id).await.unwrap_err();
        assert!(matches!(err, Error::TaskFailed { .. }));
        assert!(err.to_string().contains("disk on fire"));
    }

    #[tokio::test]
    async fn test_completing_unknown_task_fails() {
        let queue = MemTaskQueue::new();
        let err = queue
            .complete(ShardResult {
                id: TaskId::new(),
                outcome: Ok(FileSetId::new()),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }
}
