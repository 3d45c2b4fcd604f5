//! Cooperative cancellation.
//!
//! Runs check the token at phase boundaries and before internal waits. An
//! in-flight collaborator call is never interrupted. A token cancelled by
//! [`interrupt`](CancellationToken::interrupt) stops its run the same way but
//! leaves it for restart recovery.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use crate::error::{OpsError, OpsResult};

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    interrupted: AtomicBool,
    notify: Notify,
}

/// Shared cancellation signal, cloned into every run and every waiter.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    /// Cancel because the process is stopping, not because the run is unwanted.
    pub fn interrupt(&self) {
        self.inner.interrupted.store(true, Ordering::Release);
        self.cancel();
    }

    pub fn is_interrupted(&self) -> bool {
        self.inner.interrupted.load(Ordering::Acquire)
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Yield point: `Err(Cancelled)` once cancellation was requested.
    pub fn check(&self) -> OpsResult<()> {
        if self.is_cancelled() {
            Err(OpsError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            // Registered on creation, so a cancel between here and the await is not lost.
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Sleep that ends early with `Err(Cancelled)`.
    pub async fn sleep(&self, duration: Duration) -> OpsResult<()> {
        self.check()?;
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.cancelled() => Err(OpsError::Cancelled),
        }
    }
}
