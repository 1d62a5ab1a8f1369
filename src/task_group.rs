//! Structured concurrency primitives for the supervisor.
//!
//! Spec §5 models a connection's layers as a scope: every background task
//! is a child of one group, and cancelling the scope cancels every layer's
//! task before a deterministic teardown runs in reverse creation order.
//! The teacher crate never reaches for `tokio`; its background work
//! (`bidirectional_proxy.rs`, `transit/stdio.rs`) is a named
//! `std::thread` polling its channels. `TaskGroup` generalises that one
//! pattern into a reusable scope instead of inlining it per layer.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// A cooperative cancellation flag shared by every task in a group.
///
/// Background loops poll `is_cancelled()` (typically via `wait_timeout`,
/// which doubles as the layer's retry/ack timer) instead of being
/// forcibly killed; Rust has no thread cancellation, so every layer must
/// check this itself at its own suspension points, matching spec §5's
/// list of suspension points (transport reads/writes, timers, waiter
/// awaits, handler dispatch).
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancellationToken {
    pub fn new() -> Self {
        CancellationToken {
            inner: Arc::new((Mutex::new(false), Condvar::new())),
        }
    }

    /// Requests cancellation and wakes every waiter.
    pub fn cancel(&self) {
        let (lock, cvar) = &*self.inner;
        let mut cancelled = lock.lock().unwrap();
        *cancelled = true;
        cvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.0.lock().unwrap()
    }

    /// Blocks up to `timeout`, returning early if cancellation is
    /// requested. Background loops use this as their single suspension
    /// point so a timer wait and a cancellation check are the same
    /// operation.
    pub fn wait_timeout(&self, timeout: Duration) {
        let (lock, cvar) = &*self.inner;
        let guard = lock.lock().unwrap();
        if *guard {
            return;
        }
        let _ = cvar.wait_timeout(guard, timeout).unwrap();
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// A named collection of background threads that share one
/// `CancellationToken`.
///
/// Dropping or calling `cancel_and_join` tears the whole stack down:
/// every member thread observes cancellation at its next suspension point
/// and returns, and joins happen in the reverse of spawn order so that,
/// for example, the reliable layer's background thread exits before the
/// frame layer it reads from is torn down.
pub struct TaskGroup {
    name: String,
    token: CancellationToken,
    handles: Vec<(String, JoinHandle<()>)>,
}

impl TaskGroup {
    pub fn new(name: impl Into<String>) -> Self {
        TaskGroup {
            name: name.into(),
            token: CancellationToken::new(),
            handles: Vec::new(),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Spawns a named child task under this group.
    pub fn spawn<F>(&mut self, task_name: impl Into<String>, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let task_name = task_name.into();
        let thread_name = format!("{}::{}", self.name, task_name);
        let handle = std::thread::Builder::new()
            .name(thread_name)
            .spawn(f)
            .expect("failed to spawn task group thread");
        self.handles.push((task_name, handle));
    }

    /// Cancels every task in the group and joins them in reverse spawn
    /// order. Idempotent: calling it twice is a no-op the second time.
    pub fn cancel_and_join(&mut self) {
        self.token.cancel();
        while let Some((_name, handle)) = self.handles.pop() {
            let _ = handle.join();
        }
    }
}

impl Drop for TaskGroup {
    fn drop(&mut self) {
        self.cancel_and_join();
    }
}
