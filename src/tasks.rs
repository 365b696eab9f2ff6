//! Completion tracking for long-lived tasks
//!
//! Every long-lived task holds a [`TaskGuard`] for its lifetime;
//! [`WaitGroup::wait`] returns once the last guard has been dropped. The
//! guards are channel senders that never send: only the channel closing
//! matters, which is how dropping doubles as acknowledgment.

use tokio::sync::mpsc;

/// Tracks a set of tasks until all of them have finished
pub struct WaitGroup {
    guard: TaskGuard,
    done: mpsc::Receiver<()>,
}

/// Held by a task until it finishes
#[derive(Clone)]
pub struct TaskGuard {
    _done: mpsc::Sender<()>,
}

impl Default for WaitGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitGroup {
    pub fn new() -> Self {
        let (done_tx, done_rx) = mpsc::channel(1);

        Self {
            guard: TaskGuard { _done: done_tx },
            done: done_rx,
        }
    }

    /// Mint a guard for a task to hold
    pub fn guard(&self) -> TaskGuard {
        self.guard.clone()
    }

    /// Wait until every outstanding guard has been dropped
    pub async fn wait(mut self) {
        drop(self.guard);

        // recv yields None once the last sender is gone
        let _ = self.done.recv().await;
    }
}
