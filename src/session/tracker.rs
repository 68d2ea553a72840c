//! Server-wide bookkeeping of live sessions.
//!
//! Upgraded WebSocket connections outlive the HTTP server's own graceful
//! shutdown, so sessions register here instead. [`SessionTracker::shutdown`]
//! tells every session to stop and waits until each one has removed its
//! container.

use std::sync::Arc;

use tokio::sync::watch;

#[derive(Debug)]
struct Inner {
    stopping: watch::Sender<bool>,
    live: watch::Sender<usize>,
}

/// Shared handle; clones observe the same sessions.
#[derive(Debug, Clone)]
pub struct SessionTracker {
    inner: Arc<Inner>,
}

impl Default for SessionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionTracker {
    pub fn new() -> Self {
        let (stopping, _) = watch::channel(false);
        let (live, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner { stopping, live }),
        }
    }

    /// Register a session. Returns `None` once shutdown has begun.
    ///
    /// The session counts as live until the returned guard is dropped.
    pub fn enter(&self) -> Option<SessionGuard> {
        let mut admitted = false;
        self.inner.live.send_modify(|live| {
            if !*self.inner.stopping.borrow() {
                *live += 1;
                admitted = true;
            }
        });
        admitted.then(|| SessionGuard {
            tracker: self.clone(),
        })
    }

    /// Number of sessions currently registered.
    pub fn live(&self) -> usize {
        *self.inner.live.borrow()
    }

    pub fn is_stopping(&self) -> bool {
        *self.inner.stopping.borrow()
    }

    /// Resolves once shutdown has begun.
    pub async fn stopping(&self) {
        let mut rx = self.inner.stopping.subscribe();
        let _ = rx.wait_for(|stopping| *stopping).await;
    }

    /// Refuse new sessions, signal the live ones and wait for all of them
    /// to finish their teardown.
    pub async fn shutdown(&self) {
        // Flipped under the counter's lock so `enter` cannot slip in between.
        self.inner.live.send_modify(|_| {
            self.inner.stopping.send_replace(true);
        });

        let mut rx = self.inner.live.subscribe();
        let remaining = *rx.borrow();
        if remaining > 0 {
            tracing::info!(sessions = remaining, "Waiting for live sessions to end");
        }
        let _ = rx.wait_for(|live| *live == 0).await;
    }
}

/// Keeps a session registered while held.
#[derive(Debug)]
pub struct SessionGuard {
    tracker: SessionTracker,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.tracker
            .inner
            .live
            .send_modify(|live| *live = live.saturating_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_guards_count_live_sessions() {
        let tracker = SessionTracker::new();
        let first = tracker.enter().unwrap();
        let second = tracker.enter().unwrap();
        assert_eq!(tracker.live(), 2);
        drop(first);
        assert_eq!(tracker.live(), 1);
        drop(second);
        assert_eq!(tracker.live(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_without_sessions_returns_immediately() {
        let tracker = SessionTracker::new();
        tokio::time::timeout(Duration::from_secs(1), tracker.shutdown())
            .await
            .expect("shutdown should not wait");
        assert!(tracker.is_stopping());
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_sessions() {
        let tracker = SessionTracker::new();
        tracker.shutdown().await;
        assert!(tracker.enter().is_none());
        assert_eq!(tracker.live(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_guards() {
        let tracker = SessionTracker::new();
        let guard = tracker.enter().unwrap();

        let session = {
            let tracker = tracker.clone();
            tokio::spawn(async move {
                tracker.stopping().await;
                tokio::time::sleep(Duration::from_millis(20)).await;
                drop(guard);
            })
        };

        tokio::time::timeout(Duration::from_secs(5), tracker.shutdown())
            .await
            .expect("shutdown should finish once the session ends");
        assert_eq!(tracker.live(), 0);
        session.await.unwrap();
    }
}
