//! Child-side worker runtime.
//!
//! A worker process reads commands from stdin as binary frames, invokes
//! the embedded [`Handler`], and writes replies back over stdout. stderr
//! stays a plain text channel; the parent consumes it as log lines.

mod compress;
mod echo;
mod handler;
mod runtime;

pub use echo::EchoHandler;
pub use handler::{
    CustomResponder, Handler, HandlerResponse, Request, Responder, ResponseBody, WorkerContext,
};
pub use runtime::WorkerRuntime;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;

/// Shared per-process request accounting.
///
/// The active counter gates maintenance and shutdown: both wait for it to
/// drain before running their hooks.
pub(crate) struct WorkerState {
    active: AtomicUsize,
    served: AtomicUsize,
    idle: Notify,
}

impl WorkerState {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            active: AtomicUsize::new(0),
            served: AtomicUsize::new(0),
            idle: Notify::new(),
        })
    }

    pub(crate) fn begin(&self) {
        self.active.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn finish(&self) {
        let prev = self.active.fetch_sub(1, Ordering::SeqCst);
        self.served.fetch_add(1, Ordering::SeqCst);
        if prev == 1 {
            self.idle.notify_waiters();
        }
    }

    pub(crate) fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub(crate) fn served(&self) -> usize {
        self.served.load(Ordering::SeqCst)
    }

    /// Wait until the active-request count reaches zero.
    pub(crate) async fn wait_idle(&self) {
        loop {
            // Register interest before checking, so a finish() landing
            // between the check and the await is not lost.
            let notified = self.idle.notified();
            if self.active() == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn wait_idle_returns_immediately_when_idle() {
        let state = WorkerState::new();
        tokio::time::timeout(Duration::from_millis(50), state.wait_idle())
            .await
            .expect("wait_idle should not block when idle");
    }

    #[tokio::test]
    async fn wait_idle_blocks_until_drained() {
        let state = WorkerState::new();
        state.begin();
        state.begin();

        let waiter = {
            let state = state.clone();
            tokio::spawn(async move { state.wait_idle().await })
        };

        state.finish();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        state.finish();
        tokio::time::timeout(Duration::from_millis(200), waiter)
            .await
            .expect("wait_idle should complete once drained")
            .unwrap();
        assert_eq!(state.served(), 2);
    }
}
