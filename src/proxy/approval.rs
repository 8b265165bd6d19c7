//! Runtime approval for domains that are not on the allowlist.
//!
//! The proxy asks a [`DomainApprovalGate`] before denying an unknown host.
//! The gate forwards one [`ApprovalRequest`] per domain to whoever holds the
//! receiving end of its channel (a terminal prompt, an IDE, a test) and waits
//! for an answer.
//!
//! Concurrent requests for the same domain share a single prompt: the first
//! caller sends the request and later callers wait on its outcome. Every
//! failure path resolves to deny, including a dropped responder, a closed
//! channel, or the timeout elapsing.
//!
//! # Example
//!
//! ```no_run
//! # #[tokio::main]
//! # async fn main() {
//! use shellguard::proxy::DomainApprovalGate;
//! use std::time::Duration;
//!
//! let (gate, mut requests) = DomainApprovalGate::channel(Duration::from_secs(30));
//!
//! tokio::spawn(async move {
//!     while let Some(request) = requests.recv().await {
//!         let ok = request.domain().ends_with(".internal");
//!         request.respond(ok);
//!     }
//! });
//!
//! let allowed = gate.request_approval("docs.internal").await;
//! # let _ = allowed;
//! # }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default time to wait for an approval decision.
pub const DEFAULT_APPROVAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Capacity of the request channel.
const REQUEST_CHANNEL_CAPACITY: usize = 32;

/// A pending approval question for one domain.
#[derive(Debug)]
pub struct ApprovalRequest {
    id: Uuid,
    domain: String,
    responder: oneshot::Sender<bool>,
}

impl ApprovalRequest {
    /// Unique identifier of this request.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The domain awaiting a decision.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Answer the request. Dropping the request without answering denies it.
    pub fn respond(self, approved: bool) {
        if self.responder.send(approved).is_err() {
            debug!(
                "Approval {} for {} answered after the requester gave up",
                self.id, self.domain
            );
        }
    }

    /// Approve the domain.
    pub fn approve(self) {
        self.respond(true);
    }

    /// Deny the domain.
    pub fn deny(self) {
        self.respond(false);
    }
}

/// Gate that serializes approval prompts per domain.
pub struct DomainApprovalGate {
    requests: mpsc::Sender<ApprovalRequest>,
    timeout: Duration,
    /// Domains with a prompt in flight, mapped to callers waiting on it.
    inflight: Mutex<HashMap<String, Vec<oneshot::Sender<bool>>>>,
}

impl DomainApprovalGate {
    /// Create a gate and the receiver that approval requests arrive on.
    ///
    /// # Arguments
    ///
    /// * `timeout` - Maximum time to wait for an answer before denying.
    pub fn channel(timeout: Duration) -> (Self, mpsc::Receiver<ApprovalRequest>) {
        let (tx, rx) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);
        let gate = Self {
            requests: tx,
            timeout,
            inflight: Mutex::new(HashMap::new()),
        };
        (gate, rx)
    }

    /// Create a gate driven by an async decision function.
    ///
    /// Spawns a task that answers each request with `decide(domain)`. If the
    /// function panics the responder is dropped and the domain is denied.
    /// Must be called from within a Tokio runtime.
    pub fn from_fn<F, Fut>(timeout: Duration, decide: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let (gate, mut rx) = Self::channel(timeout);
        let decide = Arc::new(decide);
        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                let decide = decide.clone();
                tokio::spawn(async move {
                    let approved = decide(request.domain.clone()).await;
                    request.respond(approved);
                });
            }
        });
        gate
    }

    /// The configured decision timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Ask whether `domain` may be contacted.
    ///
    /// Returns `true` only on an explicit approval.
    pub async fn request_approval(&self, domain: &str) -> bool {
        let domain = domain.trim().trim_end_matches('.').to_lowercase();

        let follower = {
            let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
            match inflight.get_mut(&domain) {
                Some(waiters) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    Some(rx)
                }
                None => {
                    inflight.insert(domain.clone(), Vec::new());
                    None
                }
            }
        };

        if let Some(rx) = follower {
            debug!("Joining in-flight approval for {}", domain);
            return rx.await.unwrap_or(false);
        }

        let guard = InflightGuard {
            gate: self,
            domain: &domain,
            resolved: false,
        };
        let approved = self.ask(&domain).await;
        guard.resolve(approved);
        approved
    }

    /// Domains that currently have a prompt in flight.
    pub fn pending_domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = self
            .inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        domains.sort();
        domains
    }

    async fn ask(&self, domain: &str) -> bool {
        let (tx, rx) = oneshot::channel();
        let request = ApprovalRequest {
            id: Uuid::new_v4(),
            domain: domain.to_string(),
            responder: tx,
        };
        let id = request.id;

        // One deadline covers both queueing and the answer, so a backed-up
        // handler cannot stall the connection either.
        let exchange = async {
            if self.requests.send(request).await.is_err() {
                warn!("No approval handler is listening; denying {}", domain);
                return false;
            }
            info!("Approval {} requested for {}", id, domain);

            match rx.await {
                Ok(approved) => {
                    info!(
                        "Approval {} for {}: {}",
                        id,
                        domain,
                        if approved { "allowed" } else { "denied" }
                    );
                    approved
                }
                Err(_) => {
                    warn!("Approval {} for {} dropped without an answer", id, domain);
                    false
                }
            }
        };

        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(approved) => approved,
            Err(_) => {
                warn!(
                    "Approval {} for {} timed out after {:?}",
                    id, domain, self.timeout
                );
                false
            }
        }
    }

    fn take_waiters(&self, domain: &str) -> Vec<oneshot::Sender<bool>> {
        self.inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(domain)
            .unwrap_or_default()
    }
}

/// Clears the in-flight entry even if the leading caller is cancelled.
///
/// On cancellation the waiters' senders are dropped, which they read as deny.
struct InflightGuard<'a> {
    gate: &'a DomainApprovalGate,
    domain: &'a str,
    resolved: bool,
}

impl InflightGuard<'_> {
    fn resolve(mut self, approved: bool) {
        for waiter in self.gate.take_waiters(self.domain) {
            let _ = waiter.send(approved);
        }
        self.resolved = true;
    }
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        if !self.resolved {
            self.gate.take_waiters(self.domain);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_approve_via_channel() {
        let (gate, mut rx) = DomainApprovalGate::channel(Duration::from_secs(5));
        let responder = tokio::spawn(async move {
            let request = rx.recv().await.unwrap();
            assert_eq!(request.domain(), "api.example.com");
            request.approve();
        });

        assert!(gate.request_approval("API.example.com").await);
        responder.await.unwrap();
        assert!(gate.pending_domains().is_empty());
    }

    #[tokio::test]
    async fn test_deny_via_channel() {
        let (gate, mut rx) = DomainApprovalGate::channel(Duration::from_secs(5));
        tokio::spawn(async move {
            rx.recv().await.unwrap().deny();
        });

        assert!(!gate.request_approval("evil.io").await);
    }

    #[tokio::test]
    async fn test_dropped_request_denies() {
        let (gate, mut rx) = DomainApprovalGate::channel(Duration::from_secs(5));
        tokio::spawn(async move {
            let request = rx.recv().await.unwrap();
            drop(request);
        });

        assert!(!gate.request_approval("evil.io").await);
    }

    #[tokio::test]
    async fn test_closed_receiver_denies() {
        let (gate, rx) = DomainApprovalGate::channel(Duration::from_secs(5));
        drop(rx);

        assert!(!gate.request_approval("example.com").await);
        assert!(gate.pending_domains().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_denies() {
        let (gate, mut rx) = DomainApprovalGate::channel(Duration::from_millis(50));
        let holder = tokio::spawn(async move {
            // Hold the request past the gate's timeout.
            let request = rx.recv().await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
            drop(request);
        });

        assert!(!gate.request_approval("slow.example.com").await);
        holder.await.unwrap();
    }

    #[tokio::test]
    async fn test_full_queue_denies_within_timeout() {
        let (gate, _rx) = DomainApprovalGate::channel(Duration::from_millis(100));
        let gate = Arc::new(gate);
        // Nobody reads the receiver, so the queue fills and stays full.
        for i in 0..REQUEST_CHANNEL_CAPACITY {
            let gate = gate.clone();
            tokio::spawn(async move { gate.request_approval(&format!("q{}.example.com", i)).await });
        }
        tokio::task::yield_now().await;

        let decided = tokio::time::timeout(
            Duration::from_secs(2),
            gate.request_approval("late.example.com"),
        )
        .await;
        assert_eq!(decided.ok(), Some(false));
    }

    #[tokio::test]
    async fn test_from_fn_decides() {
        let gate = DomainApprovalGate::from_fn(Duration::from_secs(5), |domain| async move {
            domain.ends_with(".trusted.dev")
        });

        assert!(gate.request_approval("cdn.trusted.dev").await);
        assert!(!gate.request_approval("cdn.untrusted.dev").await);
    }

    #[tokio::test]
    async fn test_from_fn_panic_denies() {
        let gate = DomainApprovalGate::from_fn(Duration::from_secs(5), |domain: String| async move {
            assert!(domain.is_empty(), "decider failed");
            true
        });

        assert!(!gate.request_approval("example.com").await);
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_prompt() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let gate = DomainApprovalGate::from_fn(Duration::from_secs(5), move |_domain| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                true
            }
        });

        let (a, b, c) = tokio::join!(
            gate.request_approval("shared.example.com"),
            gate.request_approval("shared.example.com"),
            gate.request_approval("SHARED.example.com"),
        );

        assert!(a && b && c);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(gate.pending_domains().is_empty());
    }

    #[tokio::test]
    async fn test_pending_domains_while_waiting() {
        let (gate, mut rx) = DomainApprovalGate::channel(Duration::from_secs(5));
        let gate = Arc::new(gate);

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.request_approval("pending.example.com").await })
        };

        let request = rx.recv().await.unwrap();
        assert_eq!(gate.pending_domains(), vec!["pending.example.com".to_string()]);
        request.approve();

        assert!(waiter.await.unwrap());
        assert!(gate.pending_domains().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_leader_releases_domain() {
        let (gate, mut rx) = DomainApprovalGate::channel(Duration::from_secs(5));

        let cancelled = tokio::time::timeout(
            Duration::from_millis(20),
            gate.request_approval("cancel.example.com"),
        )
        .await;
        assert!(cancelled.is_err());
        assert!(gate.pending_domains().is_empty());

        // The stale request is still queued; answering it is harmless.
        rx.recv().await.unwrap().approve();
    }
}
