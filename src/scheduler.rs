//! Shared timed executor for token refresh, auto-restart and post-open work.
//!
//! One scheduler per session; the auth engine borrows it instead of spawning
//! threads of its own. Shutdown aborts everything still pending.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::AbortHandle;

/// Handle to a scheduled task, cancellable at any time.
#[derive(Debug)]
pub struct ScheduledTask {
    handle: AbortHandle,
}

impl ScheduledTask {
    pub fn cancel(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

#[derive(Debug, Default)]
pub struct Scheduler {
    tasks: Mutex<Vec<AbortHandle>>,
    shut_down: AtomicBool,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn spawn<F>(&self, future: F) -> ScheduledTask
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = if self.shut_down.load(Ordering::SeqCst) {
            // after shutdown nothing runs anymore
            tokio::spawn(async {}).abort_handle()
        } else {
            tokio::spawn(future).abort_handle()
        };

        let mut tasks = self.tasks.lock().unwrap();
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle.clone());
        ScheduledTask { handle }
    }

    /// Run once, as soon as possible.
    pub fn execute<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.spawn(future);
    }

    /// Run once after `delay`.
    pub fn schedule_once<F>(&self, delay: Duration, future: F) -> ScheduledTask
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.spawn(async move {
            tokio::time::sleep(delay).await;
            future.await;
        })
    }

    /// Run `task` first after `initial`, then every `period` until cancelled.
    pub fn schedule_at_fixed_rate<F, Fut>(
        &self,
        initial: Duration,
        period: Duration,
        task: F,
    ) -> ScheduledTask
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send,
    {
        self.spawn(async move {
            tokio::time::sleep(initial).await;
            loop {
                task().await;
                tokio::time::sleep(period).await;
            }
        })
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Abort all pending tasks and refuse new ones.
    pub fn shutdown_now(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}
