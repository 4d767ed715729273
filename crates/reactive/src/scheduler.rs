//! Deferred execution.
//!
//! The engine never runs a bootstrap pass or an unhandled-error report
//! synchronously inside the call that triggered it. Both are handed to a
//! `Scheduler`, which runs them on a later turn of the host event loop.

use futures::executor::LocalSpawner;
use futures::future::LocalBoxFuture;
use futures::task::LocalSpawnExt;

/// A unit of deferred work.
pub type Task = Box<dyn FnOnce()>;

/// Single-threaded task scheduler.
pub trait Scheduler {
    /// Runs `task` on a later turn, never synchronously.
    fn defer(&self, task: Task);

    /// Drives `future` to completion in the background.
    fn spawn(&self, future: LocalBoxFuture<'static, ()>);
}

/// Scheduler backed by a `futures` `LocalPool`.
///
/// Deferred work runs the next time the owning pool is driven, e.g. by
/// `LocalPool::run_until_stalled`.
#[derive(Clone)]
pub struct LocalPoolScheduler {
    spawner: LocalSpawner,
}

impl LocalPoolScheduler {
    /// Creates a scheduler spawning onto the given pool.
    pub fn new(spawner: LocalSpawner) -> Self {
        Self { spawner }
    }
}

impl Scheduler for LocalPoolScheduler {
    fn defer(&self, task: Task) {
        self.spawn(Box::pin(async move { task() }));
    }

    fn spawn(&self, future: LocalBoxFuture<'static, ()>) {
        if let Err(e) = self.spawner.spawn_local(future) {
            tracing::warn!(error = %e, "executor is shut down, dropping task");
        }
    }
}

/// Scheduler running work as browser microtasks.
#[cfg(target_arch = "wasm32")]
#[derive(Clone, Copy, Debug, Default)]
pub struct MicrotaskScheduler;

#[cfg(target_arch = "wasm32")]
impl Scheduler for MicrotaskScheduler {
    fn defer(&self, task: Task) {
        wasm_bindgen_futures::spawn_local(async move { task() });
    }

    fn spawn(&self, future: LocalBoxFuture<'static, ()>) {
        wasm_bindgen_futures::spawn_local(future);
    }
}
