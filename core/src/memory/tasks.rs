//! Supervisor for fire-and-forget background work.
//!
//! Categorization, audit-history writes, entity extraction, description
//! consolidation, entity summaries, and ACCESSED-edge logging all run here.
//! Task failures are logged and never surfaced. Handles are addressable so
//! the orchestrator can await a previous item's extraction within its drain
//! budget, and `drain` flushes outstanding work on shutdown.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinHandle;

use crate::errors::MemForgeResult;

/// Owns spawned background tasks.
pub struct TaskSupervisor {
    limit: Option<Arc<Semaphore>>,
    handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Default for TaskSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskSupervisor {
    /// A supervisor with no concurrency cap.
    pub fn new() -> Self {
        Self {
            limit: None,
            handles: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// A supervisor whose tasks run at most `limit` at a time. Spawning
    /// never blocks the caller; queued tasks wait for a permit inside the
    /// spawned task.
    pub fn with_concurrency_limit(limit: usize) -> Self {
        Self {
            limit: Some(Arc::new(Semaphore::new(limit.max(1)))),
            handles: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Spawn a background task. The returned handle can be awaited (with a
    /// budget) or dropped; either way the task runs to completion and its
    /// error, if any, is logged.
    pub fn spawn<F>(&self, label: impl Into<String>, future: F) -> TaskHandle
    where
        F: Future<Output = MemForgeResult<()>> + Send + 'static,
    {
        let label = label.into();
        let task_label = label.clone();
        let semaphore = self.limit.clone();
        let (done_tx, done_rx) = oneshot::channel();

        let handle = tokio::spawn(async move {
            let _permit = match semaphore {
                Some(s) => s.acquire_owned().await.ok(),
                None => None,
            };
            if let Err(err) = future.await {
                tracing::warn!(task = %task_label, %err, "background task failed");
            }
            let _ = done_tx.send(());
        });

        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        handles.retain(|h| !h.is_finished());
        handles.push(handle);

        TaskHandle {
            label,
            done: done_rx,
        }
    }

    /// Number of tracked tasks that have not yet finished.
    pub fn pending(&self) -> usize {
        let handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        handles.iter().filter(|h| !h.is_finished()).count()
    }

    /// Await all outstanding tasks, bounded by `timeout`. Used on shutdown;
    /// tasks still running when the budget expires keep running detached.
    pub async fn drain(&self, timeout: Duration) {
        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.handles.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        let join_all = async {
            for handle in handles {
                if let Err(err) = handle.await {
                    tracing::warn!(%err, "background task panicked");
                }
            }
        };
        if tokio::time::timeout(timeout, join_all).await.is_err() {
            tracing::warn!("drain budget expired with background tasks still running");
        }
    }
}

/// Addressable completion handle for one background task.
pub struct TaskHandle {
    label: String,
    done: oneshot::Receiver<()>,
}

impl TaskHandle {
    /// The label the task was spawned under.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Await completion without bound.
    pub async fn wait(self) {
        let _ = self.done.await;
    }

    /// Await completion for at most `budget`. Returns `true` when the task
    /// finished inside the budget.
    pub async fn wait_with_budget(self, budget: Duration) -> bool {
        tokio::time::timeout(budget, self.done).await.is_ok()
    }
}
