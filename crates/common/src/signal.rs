//! One-shot broadcast completion flag
//!
//! A [`Signal`] starts out pending and can be fired exactly once. Every clone
//! observes the same state, so one task can mark a stream finished while any
//! number of others poll [`Signal::is_done`] or await [`Signal::wait`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Inner {
    done: AtomicBool,
    notify: Notify,
}

/// Shared "done" flag with broadcast wake-up
#[derive(Debug, Clone, Default)]
pub struct Signal {
    inner: Arc<Inner>,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the signal done and wake every waiter.
    ///
    /// Returns `true` only for the call that performed the transition.
    pub fn signal(&self) -> bool {
        let first = !self.inner.done.swap(true, Ordering::AcqRel);
        if first {
            self.inner.notify.notify_waiters();
        }
        first
    }

    pub fn is_done(&self) -> bool {
        self.inner.done.load(Ordering::Acquire)
    }

    /// Wait until [`Signal::signal`] has been called.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // register before checking the flag so a concurrent signal is not missed
            notified.as_mut().enable();
            if self.is_done() {
                return;
            }
            notified.await;
        }
    }
}
