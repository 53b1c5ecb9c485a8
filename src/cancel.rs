//! Cooperative cancellation, generalized from the `Arc<AtomicBool>` polling
//! pattern the teacher hand-rolls in `data_plane::purge_concurrent` into a
//! reusable token the pumps share between the receive loop, dispatch tasks,
//! and renew loops (§4.5, §4.6, §5).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Cheaply cloneable; every clone observes the same underlying flag.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel()` has been called. Safe to await repeatedly
    /// and from multiple clones.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
            if self.is_cancelled() {
                return;
            }
        }
    }

    /// A fresh, independent token — used for per-dispatch `renew_ct` values
    /// that must not cancel siblings (§4.5).
    pub fn child(&self) -> CancellationToken {
        CancellationToken::new()
    }
}
