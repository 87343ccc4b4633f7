// Schedule-callback primitive shared by the scheduler and actor tasks
//
// One service per test run. Every scheduled callback is a tokio task that
// sleeps for its delay then runs; cancel_all aborts whatever is still
// pending and refuses new work, so nothing scheduled runs after teardown.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::debug;

pub type TimerId = u64;

pub struct TimerService {
    next_id: AtomicU64,
    tasks: Arc<DashMap<TimerId, JoinHandle<()>>>,
    closed: AtomicBool,
}

impl TimerService {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            tasks: Arc::new(DashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Run `task` after `delay`. Returns None once the service is closed.
    pub fn schedule<F>(&self, delay: Duration, task: F) -> Option<TimerId>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let tasks = self.tasks.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
            tasks.remove(&id);
        });
        self.tasks.insert(id, handle);
        // The task may have finished before it was inserted
        self.tasks.remove_if(&id, |_, handle| handle.is_finished());
        // Lost a race with cancel_all
        if self.closed.load(Ordering::Acquire) {
            if let Some((_, handle)) = self.tasks.remove(&id) {
                handle.abort();
            }
            return None;
        }
        Some(id)
    }

    /// Abort one pending callback. False if it already ran or was unknown.
    pub fn cancel(&self, id: TimerId) -> bool {
        match self.tasks.remove(&id) {
            Some((_, handle)) => {
                let pending = !handle.is_finished();
                handle.abort();
                pending
            }
            None => false,
        }
    }

    /// Close the service and abort every pending callback. Returns how many
    /// were aborted. Calling it again is a no-op.
    pub fn cancel_all(&self) -> usize {
        self.closed.store(true, Ordering::Release);
        let ids: Vec<TimerId> = self.tasks.iter().map(|entry| *entry.key()).collect();
        let mut cancelled = 0;
        for id in ids {
            if self.cancel(id) {
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            debug!(cancelled, "timers cancelled");
        }
        cancelled
    }

    pub fn pending(&self) -> usize {
        self.tasks
            .iter()
            .filter(|entry| !entry.value().is_finished())
            .count()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Default for TimerService {
    fn default() -> Self {
        Self::new()
    }
}
