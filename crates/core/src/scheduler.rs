// Scheduling capability: runs protocol work without blocking the receive loop

use futures::future::BoxFuture;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::task::JoinSet;

/// Fire-and-forget execution of connection work
pub trait Scheduler: Send + Sync {
    /// Run `task` concurrently with the caller
    fn schedule(&self, task: BoxFuture<'static, ()>);

    /// Cancel every task scheduled so far that has not finished yet
    fn cancel_all(&self);
}

/// Scheduler backed by a tokio `JoinSet`, one per connection
#[derive(Default)]
pub struct TokioScheduler {
    tasks: Mutex<JoinSet<()>>,
}

impl TokioScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tasks that have not been reaped yet
    pub fn pending(&self) -> usize {
        let mut tasks = self.tasks();
        reap(&mut tasks);
        tasks.len()
    }

    fn tasks(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, task: BoxFuture<'static, ()>) {
        let mut tasks = self.tasks();
        reap(&mut tasks);
        tasks.spawn(task);
    }

    fn cancel_all(&self) {
        let mut tasks = self.tasks();
        tasks.abort_all();
        tracing::debug!("Cancelled {} scheduled tasks", tasks.len());
    }
}

/// Drop the bookkeeping of finished tasks
fn reap(tasks: &mut JoinSet<()>) {
    while let Some(result) = tasks.try_join_next() {
        if let Err(e) = result {
            if e.is_panic() {
                tracing::error!("Scheduled task panicked: {}", e);
            }
        }
    }
}
