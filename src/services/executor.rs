use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;

/// Returned by [`BoundedExecutor::run`] once the executor has been closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("executor is closed")]
pub struct ExecutorClosed;

/// Caps the number of tasks running at once across every caller.
///
/// Excess callers queue on a fair semaphore, so slots are handed out in
/// arrival order. The slot is a guard held for the duration of the task and
/// released on every exit path, unwinding included.
#[derive(Debug, Clone)]
pub struct BoundedExecutor {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl BoundedExecutor {
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    pub async fn run<F, T>(&self, task: F) -> Result<T, ExecutorClosed>
    where
        F: Future<Output = T>,
    {
        let _permit = self.semaphore.acquire().await.map_err(|_| ExecutorClosed)?;
        Ok(task.await)
    }

    /// Refuse new admissions; queued and future callers get `ExecutorClosed`.
    /// Tasks already holding a slot run to completion.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn in_flight(&self) -> usize {
        self.max_concurrent.saturating_sub(self.available())
    }
}
