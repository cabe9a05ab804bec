//! In-flight tracking for non-streaming requests.
//!
//! Each generation owns one [`RequestLifecycleTracker`]. Requests register
//! through [`RequestLifecycleTracker::begin`] and deregister when the returned
//! [`RequestGuard`] drops, whether the request succeeded, failed or was
//! abandoned mid-flight. The drain protocol waits on
//! [`RequestLifecycleTracker::wait_idle`] and, when the grace period runs out,
//! cancels what is left with [`RequestLifecycleTracker::cancel_in_flight`].
//!
//! Subscriptions are deliberately not counted here; their sessions are
//! tracked by [`crate::session::SessionRegistry`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Counter of outstanding non-streaming requests.
#[derive(Clone, Default)]
pub struct RequestLifecycleTracker {
    inner: Arc<TrackerInner>,
}

#[derive(Default)]
struct TrackerInner {
    in_flight: AtomicUsize,
    idle: Notify,
    cancel: CancellationToken,
}

impl RequestLifecycleTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request. The count drops again when the guard is dropped.
    pub fn begin(&self) -> RequestGuard {
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        RequestGuard {
            tracker: self.clone(),
            token: self.inner.cancel.child_token(),
        }
    }

    /// Number of requests currently in flight.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Wait until no request is in flight.
    ///
    /// Returns `true` when the counter reached zero and `false` when the
    /// deadline elapsed first. `None` waits without a deadline.
    pub async fn wait_idle(&self, deadline: Option<Duration>) -> bool {
        let deadline = deadline.map(|d| tokio::time::Instant::now() + d);

        loop {
            // Register interest before reading the counter so a decrement
            // landing between the check and the await still wakes us.
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.in_flight() == 0 {
                return true;
            }

            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(deadline) => {
                            return self.in_flight() == 0;
                        }
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Cancel the execution context of every request still in flight.
    pub fn cancel_in_flight(&self) {
        debug!(in_flight = self.in_flight(), "Cancelling in-flight requests");
        self.inner.cancel.cancel();
    }

    /// Whether [`Self::cancel_in_flight`] has been called.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    fn complete(&self) {
        let prev = self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
        if prev == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

/// RAII guard for one in-flight request.
///
/// Carries the request's cancellation token; downstream calls should select
/// on [`RequestGuard::token`] so grace-period expiry reaches them.
pub struct RequestGuard {
    tracker: RequestLifecycleTracker,
    token: CancellationToken,
}

impl RequestGuard {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.tracker.complete();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_request_tracking() {
        let tracker = RequestLifecycleTracker::new();
        assert_eq!(tracker.in_flight(), 0);

        let first = tracker.begin();
        let second = tracker.begin();
        assert_eq!(tracker.in_flight(), 2);

        drop(first);
        assert_eq!(tracker.in_flight(), 1);
        drop(second);
        assert_eq!(tracker.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_wait_idle_returns_immediately_when_empty() {
        let tracker = RequestLifecycleTracker::new();
        let start = std::time::Instant::now();
        assert!(tracker.wait_idle(Some(Duration::from_secs(5))).await);
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_wait_idle_waits_for_guards() {
        let tracker = RequestLifecycleTracker::new();
        let guard = tracker.begin();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            drop(guard);
        });

        assert!(tracker.wait_idle(Some(Duration::from_secs(5))).await);
        assert_eq!(tracker.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_wait_idle_deadline() {
        let tracker = RequestLifecycleTracker::new();
        let _guard = tracker.begin();

        let start = std::time::Instant::now();
        assert!(!tracker.wait_idle(Some(Duration::from_millis(100))).await);
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_decrement_racing_ahead_of_wait() {
        let tracker = RequestLifecycleTracker::new();

        for _ in 0..200 {
            let guard = tracker.begin();
            let handle = tokio::spawn(async move {
                drop(guard);
            });
            assert!(tracker.wait_idle(Some(Duration::from_secs(1))).await);
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_cancel_reaches_guards() {
        let tracker = RequestLifecycleTracker::new();
        let guard = tracker.begin();
        assert!(!guard.token().is_cancelled());

        tracker.cancel_in_flight();
        assert!(guard.token().is_cancelled());
        assert!(tracker.is_cancelled());

        // Requests admitted afterwards see the cancellation too.
        let late = tracker.begin();
        assert!(late.token().is_cancelled());
    }
}
