//! Transaction Coordinator
//!
//! The exclusive-transaction contract every bank-mutating component goes
//! through, and [`LocalCoordinator`], an in-process implementation.
//!
//! # Invariants
//!
//! 1. At most one live [`TransactionHandle`] exists at any time
//! 2. Deferred grants are delivered via [`TransactionRequestor::notify_transaction_ready`]
//!    on a background task, never under the coordinator's lock
//! 3. Releasing an unknown or already-released handle is a logged no-op

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Opaque right to mutate the bank
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionHandle(Uuid);

impl TransactionHandle {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TransactionHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a component asking for the transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestorId(Uuid);

impl RequestorId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestorId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    Read,
    Write,
}

/// Outcome of a non-blocking request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionGrant {
    /// Handle granted on the fast path
    Granted(TransactionHandle),
    /// Queued; the handle arrives through `notify_transaction_ready`
    Pending,
    /// Not granted and not queued
    Denied,
}

/// Component able to receive deferred grants
pub trait TransactionRequestor: Send + Sync {
    fn requestor_id(&self) -> RequestorId;

    /// Deferred grant. The receiver owns the handle and must release it.
    fn notify_transaction_ready(&self, handle: TransactionHandle);
}

pub trait TransactionCoordinator: Send + Sync {
    /// `timeout` bounds how long the request may stay queued;
    /// `None` waits indefinitely, `Some(ZERO)` never queues.
    fn request(
        &self,
        requestor: Arc<dyn TransactionRequestor>,
        timeout: Option<Duration>,
        kind: TransactionKind,
    ) -> TransactionGrant;

    /// Returns false if `handle` is not the live handle
    fn release(&self, handle: TransactionHandle) -> bool;

    /// Drop every queued request of `requestor`
    fn abandon_all(&self, requestor: RequestorId);

    /// Whether `handle` is the live handle
    fn is_live(&self, handle: TransactionHandle) -> bool;
}

// ============================================================================
// Local Coordinator
// ============================================================================

struct Waiter {
    requestor: Arc<dyn TransactionRequestor>,
    deadline: Option<Instant>,
}

#[derive(Default)]
struct CoordinatorState {
    live: Option<(TransactionHandle, RequestorId)>,
    waiters: VecDeque<Waiter>,
}

/// FIFO single-handle coordinator
#[derive(Default)]
pub struct LocalCoordinator {
    state: Mutex<CoordinatorState>,
}

impl LocalCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Owner of the live handle, if any
    pub fn owner(&self) -> Option<RequestorId> {
        self.state.lock().live.map(|(_, owner)| owner)
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().waiters.len()
    }
}

impl TransactionCoordinator for LocalCoordinator {
    fn request(
        &self,
        requestor: Arc<dyn TransactionRequestor>,
        timeout: Option<Duration>,
        kind: TransactionKind,
    ) -> TransactionGrant {
        let id = requestor.requestor_id();
        let mut state = self.state.lock();

        match state.live {
            None => {
                let handle = TransactionHandle::new();
                state.live = Some((handle, id));
                debug!(requestor = %id, handle = %handle, ?kind, "Transaction granted");
                TransactionGrant::Granted(handle)
            }
            Some((_, owner)) if owner == id => {
                warn!(requestor = %id, "Requestor already holds the transaction");
                TransactionGrant::Denied
            }
            Some(_) if timeout == Some(Duration::ZERO) => TransactionGrant::Denied,
            Some(_) => {
                state.waiters.retain(|w| w.requestor.requestor_id() != id);
                state.waiters.push_back(Waiter {
                    requestor,
                    deadline: timeout.map(|t| Instant::now() + t),
                });
                debug!(requestor = %id, queued = state.waiters.len(), "Transaction queued");
                TransactionGrant::Pending
            }
        }
    }

    fn release(&self, handle: TransactionHandle) -> bool {
        let next = {
            let mut state = self.state.lock();
            match state.live {
                Some((live, _)) if live == handle => {}
                _ => {
                    info!(handle = %handle, "Release of non-live handle ignored");
                    return false;
                }
            }
            state.live = None;

            let now = Instant::now();
            let mut next = None;
            while let Some(waiter) = state.waiters.pop_front() {
                if waiter.deadline.is_some_and(|d| d < now) {
                    debug!(requestor = %waiter.requestor.requestor_id(), "Queued request expired");
                    continue;
                }
                let granted = TransactionHandle::new();
                state.live = Some((granted, waiter.requestor.requestor_id()));
                next = Some((waiter.requestor, granted));
                break;
            }
            next
        };

        if let Some((requestor, granted)) = next {
            debug!(requestor = %requestor.requestor_id(), handle = %granted, "Deferred grant");
            deliver(requestor, granted);
        }
        true
    }

    fn abandon_all(&self, requestor: RequestorId) {
        let mut state = self.state.lock();
        let before = state.waiters.len();
        state.waiters.retain(|w| w.requestor.requestor_id() != requestor);
        let removed = before - state.waiters.len();
        if removed > 0 {
            debug!(requestor = %requestor, removed, "Abandoned queued requests");
        }
    }

    fn is_live(&self, handle: TransactionHandle) -> bool {
        self.state.lock().live.is_some_and(|(live, _)| live == handle)
    }
}

fn deliver(requestor: Arc<dyn TransactionRequestor>, handle: TransactionHandle) {
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn(async move {
                requestor.notify_transaction_ready(handle);
            });
        }
        Err(_) => requestor.notify_transaction_ready(handle),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    struct ChannelRequestor {
        id: RequestorId,
        tx: mpsc::UnboundedSender<TransactionHandle>,
    }

    impl TransactionRequestor for ChannelRequestor {
        fn requestor_id(&self) -> RequestorId {
            self.id
        }

        fn notify_transaction_ready(&self, handle: TransactionHandle) {
            let _ = self.tx.send(handle);
        }
    }

    fn requestor() -> (Arc<ChannelRequestor>, mpsc::UnboundedReceiver<TransactionHandle>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(ChannelRequestor {
                id: RequestorId::new(),
                tx,
            }),
            rx,
        )
    }

    #[tokio::test]
    async fn test_single_live_handle_and_deferred_grant() {
        let coordinator = LocalCoordinator::new();
        let (a, _rx_a) = requestor();
        let (b, mut rx_b) = requestor();

        let grant = coordinator.request(a.clone(), None, TransactionKind::Write);
        let TransactionGrant::Granted(first) = grant else {
            panic!("first request must be granted");
        };
        assert_eq!(
            coordinator.request(b.clone(), None, TransactionKind::Write),
            TransactionGrant::Pending
        );
        assert_eq!(coordinator.owner(), Some(a.id));

        assert!(coordinator.release(first));
        let second = rx_b.recv().await.unwrap();
        assert!(coordinator.is_live(second));
        assert_eq!(coordinator.owner(), Some(b.id));
        assert!(!coordinator.is_live(first));
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let coordinator = LocalCoordinator::new();
        let (a, _rx) = requestor();
        let grant = coordinator.request(a, None, TransactionKind::Write);
        let TransactionGrant::Granted(handle) = grant else {
            panic!("expected grant");
        };
        assert!(coordinator.release(handle));
        assert!(!coordinator.release(handle));
        assert_eq!(coordinator.owner(), None);
    }

    #[tokio::test]
    async fn test_zero_timeout_never_queues_and_abandon_clears_queue() {
        let coordinator = LocalCoordinator::new();
        let (a, _rx_a) = requestor();
        let (b, _rx_b) = requestor();
        coordinator.request(a, None, TransactionKind::Write);

        assert_eq!(
            coordinator.request(b.clone(), Some(Duration::ZERO), TransactionKind::Write),
            TransactionGrant::Denied
        );
        assert_eq!(
            coordinator.request(b.clone(), None, TransactionKind::Write),
            TransactionGrant::Pending
        );
        assert_eq!(coordinator.pending_count(), 1);
        coordinator.abandon_all(b.id);
        assert_eq!(coordinator.pending_count(), 0);
    }
}
