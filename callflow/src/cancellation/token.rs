//! Cancellation token for cooperative cancellation.

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::warn;

/// A callback type for cancellation notifications.
pub type CancelCallback = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Inner {
    cancelled: AtomicBool,
    reason: RwLock<Option<String>>,
    callbacks: RwLock<Vec<(u64, CancelCallback)>>,
    next_callback_id: AtomicU64,
    notify: Notify,
    /// Parent token and the id of the callback linking this child to it.
    parent: Mutex<Option<(Weak<Inner>, u64)>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some((parent, id)) = self.parent.get_mut().take() {
            if let Some(parent) = parent.upgrade() {
                parent.callbacks.write().retain(|(callback_id, _)| *callback_id != id);
            }
        }
    }
}

/// A clonable token for cooperative cancellation.
///
/// Clones share state. Cancellation is idempotent - only the first
/// cancellation reason is kept. Tasks can `await` [`cancelled`](Self::cancelled)
/// inside a `tokio::select!` to abort in-flight work.
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    /// Creates a new cancellation token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a child token that is cancelled whenever this token is.
    ///
    /// Cancelling the child does not affect the parent. Dropping the last
    /// clone of the child unregisters it from the parent.
    #[must_use]
    pub fn child_token(&self) -> Self {
        let child = Self::new();
        let weak_child = Arc::downgrade(&child.inner);
        let weak_parent = Arc::downgrade(&self.inner);
        let link = self.register(Box::new(move || {
            if let Some(inner) = weak_child.upgrade() {
                let reason = weak_parent
                    .upgrade()
                    .and_then(|p| p.reason.read().clone())
                    .unwrap_or_else(|| "parent cancelled".to_string());
                Self { inner }.cancel(reason);
            }
        }));
        if let Some(id) = link {
            *child.inner.parent.lock() = Some((Arc::downgrade(&self.inner), id));
        }
        child
    }

    /// Requests cancellation with a reason.
    ///
    /// Callbacks are invoked immediately and waiters are woken. Panics in
    /// callbacks are logged and suppressed.
    pub fn cancel(&self, reason: impl Into<String>) {
        if self
            .inner
            .cancelled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            *self.inner.reason.write() = Some(reason.into());

            let callbacks = std::mem::take(&mut *self.inner.callbacks.write());
            for (_, callback) in &callbacks {
                if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    callback();
                })) {
                    warn!("Cancellation callback panicked: {:?}", e);
                }
            }

            self.inner.notify.notify_waiters();
        }
    }

    /// Registers a callback to be invoked on cancellation.
    ///
    /// If already cancelled, the callback is invoked immediately.
    pub fn on_cancel<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.register(Box::new(callback));
    }

    /// Stores `callback` and returns its id, or runs it at once if already cancelled.
    fn register(&self, callback: CancelCallback) -> Option<u64> {
        {
            let mut callbacks = self.inner.callbacks.write();
            if !self.is_cancelled() {
                let id = self.inner.next_callback_id.fetch_add(1, Ordering::Relaxed);
                callbacks.push((id, callback));
                return Some(id);
            }
        }
        if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            callback();
        })) {
            warn!("Cancellation callback panicked: {:?}", e);
        }
        None
    }

    /// Returns whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Returns the cancellation reason, if any.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.inner.reason.read().clone()
    }

    /// Completes once the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            // Registered before the flag check so a concurrent cancel is not missed.
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Sleeps for `duration` unless cancelled first.
    ///
    /// Returns `false` if the token was cancelled before the sleep finished.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            () = tokio::time::sleep(duration) => true,
            () = self.cancelled() => false,
        }
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .field("reason", &self.reason())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_token_default_not_cancelled() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        assert!(token.reason().is_none());
    }

    #[test]
    fn test_token_cancel_idempotent() {
        let token = CancellationToken::new();
        token.cancel("First reason");
        token.cancel("Second reason");

        assert!(token.is_cancelled());
        assert_eq!(token.reason(), Some("First reason".to_string()));
    }

    #[test]
    fn test_clones_share_state() {
        let token = CancellationToken::new();
        let clone = token.clone();
        clone.cancel("from clone");
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_on_cancel_before_and_after() {
        let token = CancellationToken::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let c = counter.clone();
        token.on_cancel(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        token.cancel("test");
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        let c = counter.clone();
        token.on_cancel(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_callback_panic_suppressed() {
        let token = CancellationToken::new();
        token.on_cancel(|| panic!("Intentional panic"));
        token.cancel("test");
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_child_token_follows_parent() {
        let parent = CancellationToken::new();
        let child = parent.child_token();

        child.cancel("child only");
        assert!(!parent.is_cancelled());

        let parent = CancellationToken::new();
        let child = parent.child_token();
        parent.cancel("shutdown");
        assert!(child.is_cancelled());
        assert_eq!(child.reason(), Some("shutdown".to_string()));
    }

    #[test]
    fn test_dropped_children_unregister_from_parent() {
        let parent = CancellationToken::new();
        for _ in 0..1000 {
            let child = parent.child_token();
            let _attempt = child.child_token();
        }
        assert_eq!(parent.inner.callbacks.read().len(), 0);

        let kept = parent.child_token();
        let clone = kept.clone();
        drop(kept);
        assert_eq!(parent.inner.callbacks.read().len(), 1);

        parent.cancel("shutdown");
        assert!(clone.is_cancelled());
        assert_eq!(clone.reason(), Some("shutdown".to_string()));
    }

    #[test]
    fn test_child_of_cancelled_parent_starts_cancelled() {
        let parent = CancellationToken::new();
        parent.cancel("already gone");
        let child = parent.child_token();
        assert!(child.is_cancelled());
        assert_eq!(child.reason(), Some("already gone".to_string()));
        drop(child);
        assert_eq!(parent.inner.callbacks.read().len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_wakes_waiter() {
        let token = CancellationToken::new();
        let waiter = token.clone();

        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
            waiter.reason()
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel("stop");

        assert_eq!(handle.await.unwrap(), Some("stop".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_completes_or_aborts() {
        let token = CancellationToken::new();
        assert!(token.sleep(Duration::from_millis(50)).await);

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel("stop");
        });
        let start = tokio::time::Instant::now();
        assert!(!token.sleep(Duration::from_secs(60)).await);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_cancelled_returns_immediately_when_already_cancelled() {
        let token = CancellationToken::new();
        token.cancel("done");
        token.cancelled().await;
    }

    #[test]
    fn test_cancelled_future_is_woken_by_cancel() {
        let token = CancellationToken::new();
        let mut waiter = tokio_test::task::spawn(token.cancelled());
        tokio_test::assert_pending!(waiter.poll());

        token.cancel("done");
        assert!(waiter.is_woken());
        tokio_test::assert_ready!(waiter.poll());
    }
}
