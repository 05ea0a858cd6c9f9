//! # Request Correlator
//!
//! Matches broker request/response pairs by `request_id`. The requester
//! registers a slot, publishes, and waits; whichever node answers
//! resolves the slot. Entries are deleted on response, timeout, and
//! cancellation — a response arriving after any of those is dropped
//! silently.

use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::error::GatewayError;

#[derive(Default)]
pub struct RequestCorrelator {
    pending: DashMap<String, oneshot::Sender<Vec<u8>>>,
}

impl RequestCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a slot for `request_id`. Re-registering the same id replaces
    /// (and thereby cancels) the older waiter.
    pub fn register(&self, request_id: &str) -> oneshot::Receiver<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id.to_string(), tx);
        rx
    }

    /// Delivers a response; `false` when nobody is waiting (already
    /// resolved, timed out, or cancelled).
    pub fn resolve(&self, request_id: &str, payload: Vec<u8>) -> bool {
        match self.pending.remove(request_id) {
            Some((_, tx)) => tx.send(payload).is_ok(),
            None => false,
        }
    }

    /// Drops a slot without resolving it.
    pub fn cancel(&self, request_id: &str) {
        self.pending.remove(request_id);
    }

    /// Waits for the response registered under `request_id`, cleaning the
    /// slot up on every exit path.
    pub async fn wait(
        &self,
        request_id: &str,
        rx: oneshot::Receiver<Vec<u8>>,
        timeout: std::time::Duration,
    ) -> Result<Vec<u8>, GatewayError> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(_)) => {
                // Sender dropped: replaced by a newer registration.
                Err(GatewayError::Cancelled)
            }
            Err(_) => {
                self.cancel(request_id);
                Err(GatewayError::DeadlineExceeded)
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn resolved_requests_return_the_payload() {
        let correlator = RequestCorrelator::new();
        let rx = correlator.register("req-1");
        assert!(correlator.resolve("req-1", b"answer".to_vec()));
        let payload = correlator
            .wait("req-1", rx, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(payload, b"answer");
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn timeouts_clean_the_slot() {
        let correlator = RequestCorrelator::new();
        let rx = correlator.register("req-2");
        let result = correlator
            .wait("req-2", rx, Duration::from_millis(20))
            .await;
        assert!(matches!(result, Err(GatewayError::DeadlineExceeded)));
        assert_eq!(correlator.pending_count(), 0);
        // A late response is dropped silently.
        assert!(!correlator.resolve("req-2", b"late".to_vec()));
    }

    #[tokio::test]
    async fn unknown_ids_resolve_to_nobody() {
        let correlator = RequestCorrelator::new();
        assert!(!correlator.resolve("req-x", Vec::new()));
    }
}
