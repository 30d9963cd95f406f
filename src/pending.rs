//! Per-tunnel table of requests waiting for their response
//!
//! Each forwarded request registers a one-shot waiter under its correlation
//! id before the request is written to the tunnel. The tunnel's read loop
//! fulfills waiters as responses arrive; teardown fails every waiter that is
//! still outstanding. An entry leaves the table exactly once, through
//! [`PendingRequests::fulfill`], [`PendingRequests::remove`], a timed-out
//! [`PendingRequests::wait`], [`PendingRequests::cancel_all`], or the
//! [`Waiter`] being dropped by a caller that gave up.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{Result, TunnelError};
use crate::tunnel::ResponsePayload;

type Outcome = Result<ResponsePayload>;

/// Handle returned by [`PendingRequests::register`], consumed by [`PendingRequests::wait`]
///
/// Dropping an unresolved waiter removes its entry from the table.
#[derive(Debug)]
pub struct Waiter {
    id: String,
    rx: oneshot::Receiver<Outcome>,
    table: Arc<Mutex<Inner>>,
}

impl Waiter {
    /// Correlation id this waiter is registered under
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        // Closing first marks our sender, so an entry registered later under
        // the same id is left alone.
        self.rx.close();
        let mut inner = self.table.lock();
        if inner
            .waiters
            .get(&self.id)
            .is_some_and(oneshot::Sender::is_closed)
        {
            inner.waiters.remove(&self.id);
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    waiters: HashMap<String, oneshot::Sender<Outcome>>,
    /// Set once the owning tunnel is torn down
    closed: Option<String>,
}

/// Correlation id → waiter map for one tunnel
#[derive(Debug, Default)]
pub struct PendingRequests {
    inner: Arc<Mutex<Inner>>,
}

impl PendingRequests {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `id`
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::DuplicateRequest`] if `id` is already in flight,
    /// or [`TunnelError::Disconnected`] if the table has been cancelled.
    pub fn register(&self, id: impl Into<String>) -> Result<Waiter> {
        let id = id.into();
        let mut inner = self.inner.lock();

        if let Some(reason) = &inner.closed {
            return Err(TunnelError::disconnected(reason.clone()));
        }
        if inner.waiters.contains_key(&id) {
            return Err(TunnelError::DuplicateRequest { id });
        }

        let (tx, rx) = oneshot::channel();
        inner.waiters.insert(id.clone(), tx);
        Ok(Waiter {
            id,
            rx,
            table: self.inner.clone(),
        })
    }

    /// Hand a response to the waiter registered under its id
    ///
    /// Returns `false` if no such waiter exists (late or duplicate response).
    pub fn fulfill(&self, response: ResponsePayload) -> bool {
        let mut inner = self.inner.lock();
        match inner.waiters.remove(&response.id) {
            Some(tx) => {
                // The receiver may already be gone if the caller gave up; the
                // entry is still consumed.
                let _ = tx.send(Ok(response));
                true
            }
            None => false,
        }
    }

    /// Drop the waiter for `id` without resolving it
    pub fn remove(&self, id: &str) -> bool {
        self.inner.lock().waiters.remove(id).is_some()
    }

    /// Block until the waiter is fulfilled, cancelled, or `deadline` elapses
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::Timeout`] when the deadline elapses first (the
    /// entry is removed), or [`TunnelError::Disconnected`] when the tunnel was
    /// torn down.
    pub async fn wait(&self, mut waiter: Waiter, deadline: Duration) -> Outcome {
        match tokio::time::timeout(deadline, &mut waiter.rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(TunnelError::disconnected("pending request table dropped")),
            Err(_) => {
                if self.remove(&waiter.id) {
                    return Err(TunnelError::Timeout);
                }
                // Resolved between the deadline and the removal above.
                waiter.rx.try_recv().unwrap_or(Err(TunnelError::Timeout))
            }
        }
    }

    /// Fail every outstanding waiter and refuse new ones
    ///
    /// Returns the number of waiters that were cancelled.
    pub fn cancel_all(&self, reason: &str) -> usize {
        let mut inner = self.inner.lock();
        inner.closed = Some(reason.to_string());

        let count = inner.waiters.len();
        for (_, tx) in inner.waiters.drain() {
            let _ = tx.send(Err(TunnelError::disconnected(reason)));
        }
        count
    }

    /// Number of requests currently in flight
    pub fn len(&self) -> usize {
        self.inner.lock().waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;

    use super::*;
    use crate::tunnel::Headers;

    fn response(id: &str, body: &str) -> ResponsePayload {
        ResponsePayload {
            id: id.to_string(),
            status_code: 200,
            headers: Headers::new(),
            body: Bytes::from(body.to_string()),
        }
    }

    #[tokio::test]
    async fn test_fulfill_delivers_to_waiter() {
        let table = PendingRequests::new();
        let waiter = table.register("r1").unwrap();

        assert!(table.fulfill(response("r1", "ok")));

        let got = table.wait(waiter, Duration::from_secs(1)).await.unwrap();
        assert_eq!(&got.body[..], b"ok");
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_and_duplicate_responses_are_dropped() {
        let table = PendingRequests::new();
        assert!(!table.fulfill(response("nobody", "")));

        let _waiter = table.register("r1").unwrap();
        assert!(table.fulfill(response("r1", "first")));
        assert!(!table.fulfill(response("r1", "second")));
    }

    #[tokio::test]
    async fn test_duplicate_registration_is_rejected() {
        let table = PendingRequests::new();
        let _waiter = table.register("r1").unwrap();

        let err = table.register("r1").unwrap_err();
        assert!(matches!(err, TunnelError::DuplicateRequest { id } if id == "r1"));
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_timeout_removes_waiter() {
        let table = PendingRequests::new();
        let waiter = table.register("r1").unwrap();

        let err = table
            .wait(waiter, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::Timeout));
        assert!(table.is_empty());

        // A late response finds nothing to fulfill.
        assert!(!table.fulfill(response("r1", "late")));
    }

    #[tokio::test]
    async fn test_remove_is_exactly_once() {
        let table = PendingRequests::new();
        let _waiter = table.register("r1").unwrap();

        assert!(table.remove("r1"));
        assert!(!table.remove("r1"));
        assert!(!table.fulfill(response("r1", "")));
    }

    #[tokio::test]
    async fn test_cancel_all_unblocks_every_waiter() {
        let table = Arc::new(PendingRequests::new());

        let mut handles = Vec::new();
        for i in 0..5 {
            let waiter = table.register(format!("r{i}")).unwrap();
            let table = table.clone();
            handles.push(tokio::spawn(async move {
                table.wait(waiter, Duration::from_secs(30)).await
            }));
        }

        assert_eq!(table.cancel_all("client disconnected"), 5);

        for handle in handles {
            let err = tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .unwrap()
                .unwrap()
                .unwrap_err();
            assert!(
                matches!(err, TunnelError::Disconnected { ref reason } if reason == "client disconnected")
            );
        }
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_register_after_cancel_fails() {
        let table = PendingRequests::new();
        table.cancel_all("gone");

        let err = table.register("r1").unwrap_err();
        assert!(matches!(err, TunnelError::Disconnected { .. }));
    }

    #[tokio::test]
    async fn test_out_of_order_responses_reach_their_own_waiter() {
        let table = Arc::new(PendingRequests::new());

        let mut handles = Vec::new();
        for i in 0..20 {
            let id = format!("r{i}");
            let waiter = table.register(id.clone()).unwrap();
            let table = table.clone();
            handles.push(tokio::spawn(async move {
                let got = table.wait(waiter, Duration::from_secs(5)).await.unwrap();
                (id, got)
            }));
        }

        for i in (0..20).rev() {
            let id = format!("r{i}");
            assert!(table.fulfill(response(&id, &format!("body-{id}"))));
        }

        for handle in handles {
            let (id, got) = handle.await.unwrap();
            assert_eq!(got.id, id);
            assert_eq!(got.body, Bytes::from(format!("body-{id}")));
        }
    }

    #[tokio::test]
    async fn test_dropped_waiter_leaves_table() {
        let table = PendingRequests::new();
        let waiter = table.register("r1").unwrap();
        let _kept = table.register("r2").unwrap();

        drop(waiter);
        assert_eq!(table.len(), 1);
        assert!(!table.fulfill(response("r1", "late")));
        assert!(table.fulfill(response("r2", "ok")));
    }

    #[tokio::test]
    async fn test_dropped_waiter_keeps_reused_id() {
        let table = PendingRequests::new();
        let first = table.register("r1").unwrap();
        assert!(table.fulfill(response("r1", "first")));

        // The id is free again; a new waiter takes it before the old one is dropped.
        let second = table.register("r1").unwrap();
        drop(first);
        assert_eq!(table.len(), 1);

        assert!(table.fulfill(response("r1", "second")));
        let got = table.wait(second, Duration::from_secs(1)).await.unwrap();
        assert_eq!(&got.body[..], b"second");
    }

    #[tokio::test]
    async fn test_cancelled_wait_task_releases_entry() {
        let table = Arc::new(PendingRequests::new());
        let waiter = table.register("r1").unwrap();

        let waiting = {
            let table = table.clone();
            tokio::spawn(async move { table.wait(waiter, Duration::from_secs(30)).await })
        };
        tokio::task::yield_now().await;
        waiting.abort();
        let _ = waiting.await;

        assert!(table.is_empty());
    }
}
