//! Shutdown Coordination
//!
//! A process-wide shutdown signal plus a counter of outstanding background
//! tasks. Every spawned task registers before it starts and deregisters on
//! exit (its guard drops on the happy and the failure path alike);
//! `wait_idle` blocks process termination until the count reaches zero.
//!
//! The coordinator is passed explicitly into every component that spawns a
//! task; there is no process-global instance.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, Notify};

/// Shared shutdown signal and task accounting.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    signal: broadcast::Sender<()>,
    triggered: AtomicBool,
    tasks: AtomicUsize,
    idle: Notify,
}

/// Registration handle held by a background task for its lifetime.
///
/// Dropping the guard deregisters the task.
pub struct TaskGuard {
    inner: Arc<Inner>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (signal, _) = broadcast::channel(1);
        Self {
            inner: Arc::new(Inner {
                signal,
                triggered: AtomicBool::new(false),
                tasks: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    /// Subscribe to the shutdown signal. Every long-running loop selects on
    /// the returned receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.inner.signal.subscribe()
    }

    /// Begin shutdown: all subscribed loops are released.
    pub fn trigger(&self) {
        self.inner.triggered.store(true, Ordering::SeqCst);
        let _ = self.inner.signal.send(());
    }

    /// Whether shutdown has begun. Checked between a reconnect sleep and
    /// the next connect attempt so no new session starts after shutdown.
    pub fn is_shutdown(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    /// Register a background task. The returned guard must live for the
    /// task's whole body.
    pub fn register(&self) -> TaskGuard {
        self.inner.tasks.fetch_add(1, Ordering::AcqRel);
        TaskGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Number of currently registered tasks.
    pub fn task_count(&self) -> usize {
        self.inner.tasks.load(Ordering::Acquire)
    }

    /// Wait until every registered task has deregistered.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.inner.tasks.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        if self.inner.tasks.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.idle.notify_one();
        }
    }
}
