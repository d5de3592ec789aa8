//! The process-wide shutdown latch: single-shot, cloneable, and racy-safe
//! to await from many stages at once (spec §4.5 teardown, §6 signals).
//!
//! Grounded on the teacher's use of `tokio::sync::Notify` for coordination
//! primitives (`core::channel`), generalised here into a latch that
//! remembers *why* it tripped so the process exit code can follow spec §7
//! ("exit 0 only for shutdown reason `finished`").

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

/// Why the graph is tearing down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Every stage drained naturally: writable phases finished and
    /// readable phases ended with no fault.
    Finished,
    /// SIGINT.
    Interrupt,
    /// SIGTERM.
    Terminate,
    /// SIGUSR1 — spec-defined "graceful stop" signal.
    GracefulStop,
    /// SIGUSR2 — spec-defined "status dump" signal; does not itself
    /// tear down the graph but shares the same notification plumbing.
    StatusDump,
    /// A stage or stream faulted.
    Fault,
}

impl ShutdownReason {
    /// Per spec §4.5/§7: exit 0 only when the graph finished naturally.
    pub fn exit_code(self) -> i32 {
        match self {
            ShutdownReason::Finished => 0,
            _ => 1,
        }
    }
}

struct Inner {
    tripped: AtomicBool,
    reason: Mutex<Option<ShutdownReason>>,
    notify: Notify,
}

/// A cheap-to-clone handle onto the process's single shutdown latch.
#[derive(Clone)]
pub struct ShutdownHandle {
    inner: Arc<Inner>,
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownHandle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                tripped: AtomicBool::new(false),
                reason: Mutex::new(None),
                notify: Notify::new(),
            }),
        }
    }

    /// Trip the latch with `reason`. Idempotent: only the first call sets
    /// the reason; later calls just re-wake waiters.
    pub fn trigger(&self, reason: ShutdownReason) {
        let already = self.inner.tripped.swap(true, Ordering::SeqCst);
        if !already {
            *self.inner.reason.lock().expect("shutdown mutex poisoned") = Some(reason);
        }
        self.inner.notify.notify_waiters();
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.tripped.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        *self.inner.reason.lock().expect("shutdown mutex poisoned")
    }

    /// Resolve once the latch trips. Safe to call before or after
    /// `trigger` — callers racing a signal against their own IO should
    /// `tokio::select!` this against their work future.
    pub async fn triggered(&self) {
        if self.is_triggered() {
            return;
        }
        let notified = self.inner.notify.notified();
        if self.is_triggered() {
            return;
        }
        notified.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn triggered_resolves_immediately_if_already_tripped() {
        let handle = ShutdownHandle::new();
        handle.trigger(ShutdownReason::Interrupt);
        tokio::time::timeout(Duration::from_millis(20), handle.triggered())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn first_reason_sticks() {
        let handle = ShutdownHandle::new();
        handle.trigger(ShutdownReason::Interrupt);
        handle.trigger(ShutdownReason::Terminate);
        assert_eq!(handle.reason(), Some(ShutdownReason::Interrupt));
    }

    #[tokio::test]
    async fn waiters_wake_on_trigger() {
        let handle = ShutdownHandle::new();
        let waiter = handle.clone();
        let task = tokio::spawn(async move { waiter.triggered().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.trigger(ShutdownReason::GracefulStop);
        tokio::time::timeout(Duration::from_millis(50), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn exit_codes_match_spec() {
        assert_eq!(ShutdownReason::Finished.exit_code(), 0);
        assert_eq!(ShutdownReason::Interrupt.exit_code(), 1);
        assert_eq!(ShutdownReason::Fault.exit_code(), 1);
    }
}
