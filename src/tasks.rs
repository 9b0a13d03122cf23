//! Tracking for best-effort work that is spawned and not awaited by the caller.
use std::{
    future::Future,
    sync::{Arc, Mutex},
};

use tokio::task::JoinSet;

/// A set of spawned background tasks.
///
/// Operations such as native session rotation or storage writes must not block the caller, but
/// tests and shutdown paths need a way to wait for them. [`BackgroundTasks::settle`] waits until
/// every task spawned so far (including tasks spawned by those tasks) has finished.
#[derive(Clone, Default)]
pub(crate) struct BackgroundTasks {
    set: Arc<Mutex<JoinSet<()>>>,
}

impl BackgroundTasks {
    pub(crate) fn new() -> BackgroundTasks {
        BackgroundTasks::default()
    }

    /// Spawn `task` on the current Tokio runtime.
    ///
    /// Panics if called outside of a Tokio runtime.
    pub(crate) fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut set = self
            .set
            .lock()
            .expect("thread holding task set lock should not panic");
        // Reap finished tasks so the set doesn't grow without bound.
        while let Some(result) = set.try_join_next() {
            log_join_result(result);
        }
        set.spawn(task);
    }

    /// Wait for all spawned tasks to finish.
    pub(crate) async fn settle(&self) {
        loop {
            let mut pending = {
                let mut set = self
                    .set
                    .lock()
                    .expect("thread holding task set lock should not panic");
                std::mem::take(&mut *set)
            };
            if pending.is_empty() {
                return;
            }
            while let Some(result) = pending.join_next().await {
                log_join_result(result);
            }
        }
    }
}

fn log_join_result(result: Result<(), tokio::task::JoinError>) {
    if let Err(err) = result {
        if err.is_panic() {
            log::error!(target: "posthog", "background task panicked: {:?}", err);
        }
    }
}
