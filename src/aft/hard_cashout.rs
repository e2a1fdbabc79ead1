//! Hard Cash-Out Lockup
//!
//! Fallback when the host does not take the credits in hard cash-out mode:
//! hold the exclusive transaction, present a lockup to the attendant and wait
//! without limit. An attendant key-off pays the surfaced amounts locally; an
//! incoming AFT transfer-off supersedes the lockup and takes the funds itself.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Notify, oneshot};
use tracing::{debug, info, warn};

use crate::config::AftSettings;
use crate::coordinator::{
    RequestorId, TransactionCoordinator, TransactionGrant, TransactionHandle, TransactionKind,
    TransactionRequestor,
};
use crate::events::{AftEvent, EventBus};

use super::ports::{DisableMonitor, DisableReason, LocalCashOut};
use super::types::TransferAmounts;

/// Disables that still allow a host cash-out
const CASH_OUT_ALLOWED_DISABLES: [DisableReason; 3] = [
    DisableReason::HostCashOutFailed,
    DisableReason::PendingAuthentication,
    DisableReason::ReelFault,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    /// Attendant cleared the lockup; pay locally
    KeyOff,
    /// An AFT transfer-off took over the funds
    Superseded,
}

/// Amounts shown on the lockup, after restricted-credit suppression.
///
/// Restricted credits cannot be paid out by hand pay together with large
/// cashable amounts, so:
/// - restricted `>= limit` while cashable + nonrestricted `< limit`: restricted only
/// - cashable + nonrestricted `>= limit`, or the total `> limit`: restricted suppressed
/// - otherwise everything
pub fn present_lockup(amounts: &TransferAmounts, limit: u64) -> TransferAmounts {
    let cash_and_promo = amounts.cashable.saturating_add(amounts.nonrestricted);
    if amounts.restricted >= limit && cash_and_promo < limit {
        TransferAmounts::new(0, amounts.restricted, 0)
    } else if cash_and_promo >= limit || amounts.total() > limit {
        TransferAmounts::new(amounts.cashable, 0, amounts.nonrestricted)
    } else {
        *amounts
    }
}

#[derive(Default)]
struct HardLockInner {
    active: bool,
    handle: Option<TransactionHandle>,
    pending_grant: Option<oneshot::Sender<TransactionHandle>>,
    wake: Option<WakeReason>,
    surfaced: TransferAmounts,
}

pub struct HardCashOutLock {
    id: RequestorId,
    weak_self: Weak<HardCashOutLock>,
    max_payout_limit: u64,
    request_timeout: Duration,
    coordinator: Arc<dyn TransactionCoordinator>,
    disables: Arc<dyn DisableMonitor>,
    cash_out: Arc<dyn LocalCashOut>,
    events: EventBus,
    inner: Mutex<HardLockInner>,
    wake: Notify,
}

impl HardCashOutLock {
    pub fn new(
        settings: &AftSettings,
        coordinator: Arc<dyn TransactionCoordinator>,
        disables: Arc<dyn DisableMonitor>,
        cash_out: Arc<dyn LocalCashOut>,
        events: EventBus,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<HardCashOutLock>| HardCashOutLock {
            id: RequestorId::new(),
            weak_self: weak.clone(),
            max_payout_limit: settings.max_payout_limit,
            request_timeout: settings.hard_cashout_request_timeout(),
            coordinator,
            disables,
            cash_out,
            events,
            inner: Mutex::new(HardLockInner::default()),
            wake: Notify::new(),
        })
    }

    pub fn is_active(&self) -> bool {
        self.inner.lock().active
    }

    /// Amounts on the current lockup
    pub fn surfaced(&self) -> Option<TransferAmounts> {
        let inner = self.inner.lock();
        inner.active.then_some(inner.surfaced)
    }

    /// No disable outside the allow-list is present
    pub fn can_cash_out(&self) -> bool {
        self.disables
            .current_disables()
            .iter()
            .all(|reason| CASH_OUT_ALLOWED_DISABLES.contains(reason))
    }

    /// Acquire the handle (short timeout) and start the lockup worker.
    /// Returns false if the lockup could not be started.
    pub async fn lockup_and_cash_out(&self, amounts: TransferAmounts) -> bool {
        let receiver = {
            let mut inner = self.inner.lock();
            if inner.active {
                warn!("Hard cash-out lockup already active");
                return false;
            }
            let (sender, receiver) = oneshot::channel();
            inner.pending_grant = Some(sender);
            receiver
        };

        let Some(requestor) = self.weak_self.upgrade() else {
            return false;
        };
        let handle = match self.coordinator.request(
            requestor,
            Some(self.request_timeout),
            TransactionKind::Write,
        ) {
            TransactionGrant::Granted(handle) => handle,
            TransactionGrant::Pending => {
                match tokio::time::timeout(self.request_timeout, receiver).await {
                    Ok(Ok(handle)) => handle,
                    _ => {
                        warn!("Timed out acquiring the transaction for hard cash-out");
                        self.inner.lock().pending_grant = None;
                        self.coordinator.abandon_all(self.id);
                        return false;
                    }
                }
            }
            TransactionGrant::Denied => {
                warn!("Transaction denied for hard cash-out");
                self.inner.lock().pending_grant = None;
                return false;
            }
        };

        let surfaced = present_lockup(&amounts, self.max_payout_limit);
        {
            let mut inner = self.inner.lock();
            inner.pending_grant = None;
            inner.active = true;
            inner.handle = Some(handle);
            inner.wake = None;
            inner.surfaced = surfaced;
        }

        let Some(worker) = self.weak_self.upgrade() else {
            return false;
        };
        tokio::spawn(async move {
            worker.run_lockup(surfaced).await;
        });
        true
    }

    /// Attendant key-off
    pub fn key_off(&self) -> bool {
        self.wake_with(WakeReason::KeyOff)
    }

    /// An AFT transfer-off supersedes the lockup
    pub fn set(&self) -> bool {
        self.wake_with(WakeReason::Superseded)
    }

    fn wake_with(&self, reason: WakeReason) -> bool {
        {
            let mut inner = self.inner.lock();
            if !inner.active || inner.wake.is_some() {
                return false;
            }
            inner.wake = Some(reason);
        }
        self.wake.notify_one();
        true
    }

    async fn run_lockup(&self, surfaced: TransferAmounts) {
        info!(%surfaced, "Hard cash-out lockup presented");
        self.disables.disable(
            DisableReason::HostCashOutFailed,
            &format!("Host cash-out failed, call attendant ({surfaced})"),
        );
        self.events.publish(AftEvent::HardCashLockout(surfaced));

        let reason = loop {
            self.wake.notified().await;
            let woken = self.inner.lock().wake;
            if let Some(reason) = woken {
                break reason;
            }
        };

        let handle = {
            let mut inner = self.inner.lock();
            inner.active = false;
            inner.wake = None;
            inner.handle.take()
        };
        self.disables.enable(DisableReason::HostCashOutFailed);
        if let Some(handle) = handle {
            self.coordinator.release(handle);
        }

        match reason {
            WakeReason::KeyOff => {
                info!(%surfaced, "Hard cash-out lockup keyed off");
                if !self.cash_out.cash_out(surfaced) {
                    warn!(%surfaced, "Local cash-out failed");
                }
                self.events.publish(AftEvent::KeyOff);
            }
            WakeReason::Superseded => {
                info!("Hard cash-out lockup superseded by AFT transfer");
            }
        }
    }
}

impl TransactionRequestor for HardCashOutLock {
    fn requestor_id(&self) -> RequestorId {
        self.id
    }

    fn notify_transaction_ready(&self, handle: TransactionHandle) {
        let sender = self.inner.lock().pending_grant.take();
        let undelivered = match sender {
            Some(sender) => sender.send(handle).err(),
            None => Some(handle),
        };
        if let Some(handle) = undelivered {
            debug!(handle = %handle, "Late grant for hard cash-out, releasing");
            self.coordinator.release(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::LocalCoordinator;
    use crate::sim::{SimCashOut, SimMachine};

    const LIMIT: u64 = 5000;

    #[test]
    fn test_restricted_only_when_it_alone_reaches_limit() {
        let surfaced = present_lockup(&TransferAmounts::new(2000, 6000, 0), LIMIT);
        assert_eq!(surfaced, TransferAmounts::new(0, 6000, 0));
    }

    #[test]
    fn test_suppression_boundaries() {
        // restricted exactly at the limit is inclusive
        assert_eq!(
            present_lockup(&TransferAmounts::new(0, 5000, 0), LIMIT),
            TransferAmounts::new(0, 5000, 0)
        );
        // cashable + promo exactly at the limit suppresses restricted
        assert_eq!(
            present_lockup(&TransferAmounts::new(3000, 100, 2000), LIMIT),
            TransferAmounts::new(3000, 0, 2000)
        );
        // both reach the limit: cashable side wins
        assert_eq!(
            present_lockup(&TransferAmounts::new(5000, 5000, 0), LIMIT),
            TransferAmounts::new(5000, 0, 0)
        );
        // combined total exactly at the limit is exclusive
        assert_eq!(
            present_lockup(&TransferAmounts::new(2000, 2000, 1000), LIMIT),
            TransferAmounts::new(2000, 2000, 1000)
        );
        // one cent over the limit combined suppresses restricted
        assert_eq!(
            present_lockup(&TransferAmounts::new(2000, 2001, 1000), LIMIT),
            TransferAmounts::new(2000, 0, 1000)
        );
        assert_eq!(
            present_lockup(&TransferAmounts::new(100, 200, 300), LIMIT),
            TransferAmounts::new(100, 200, 300)
        );
    }

    struct Fixture {
        lock: Arc<HardCashOutLock>,
        coordinator: Arc<LocalCoordinator>,
        machine: Arc<SimMachine>,
        cash_out: Arc<SimCashOut>,
        events: EventBus,
    }

    fn fixture() -> Fixture {
        let settings = AftSettings {
            max_payout_limit: LIMIT,
            ..AftSettings::default()
        };
        let coordinator = Arc::new(LocalCoordinator::new());
        let machine = Arc::new(SimMachine::new());
        let cash_out = Arc::new(SimCashOut::new());
        let events = EventBus::default();
        let lock = HardCashOutLock::new(
            &settings,
            coordinator.clone(),
            machine.clone(),
            cash_out.clone(),
            events.clone(),
        );
        Fixture {
            lock,
            coordinator,
            machine,
            cash_out,
            events,
        }
    }

    async fn settle() {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_key_off_pays_surfaced_amounts() {
        let f = fixture();
        assert!(f.lock.lockup_and_cash_out(TransferAmounts::new(2000, 6000, 0)).await);
        settle().await;

        assert!(f.lock.is_active());
        assert_eq!(f.coordinator.owner(), Some(f.lock.requestor_id()));
        assert_eq!(
            f.machine.current_disables(),
            vec![DisableReason::HostCashOutFailed]
        );
        assert!(f.lock.can_cash_out());

        // Waits indefinitely
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert!(f.lock.is_active());

        assert!(f.lock.key_off());
        settle().await;
        assert!(!f.lock.is_active());
        assert_eq!(f.coordinator.owner(), None);
        assert!(f.machine.current_disables().is_empty());
        assert_eq!(f.cash_out.paid(), vec![TransferAmounts::new(0, 6000, 0)]);
        assert_eq!(
            f.events.drain(),
            vec![
                AftEvent::HardCashLockout(TransferAmounts::new(0, 6000, 0)),
                AftEvent::KeyOff
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseded_lockup_pays_nothing() {
        let f = fixture();
        assert!(f.lock.lockup_and_cash_out(TransferAmounts::new(100, 0, 0)).await);
        settle().await;

        assert!(f.lock.set());
        assert!(!f.lock.key_off());
        settle().await;
        assert!(!f.lock.is_active());
        assert!(f.cash_out.paid().is_empty());
        assert_eq!(f.coordinator.owner(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquisition_times_out_when_handle_busy() {
        let f = fixture();
        struct Holder(RequestorId);
        impl TransactionRequestor for Holder {
            fn requestor_id(&self) -> RequestorId {
                self.0
            }
            fn notify_transaction_ready(&self, _handle: TransactionHandle) {}
        }
        let holder = Arc::new(Holder(RequestorId::new()));
        let TransactionGrant::Granted(busy) =
            f.coordinator.request(holder, None, TransactionKind::Write)
        else {
            panic!("first request is granted");
        };

        assert!(!f.lock.lockup_and_cash_out(TransferAmounts::new(100, 0, 0)).await);
        assert!(!f.lock.is_active());
        assert_eq!(f.coordinator.pending_count(), 0);
        assert!(f.coordinator.release(busy));
        assert_eq!(f.coordinator.owner(), None);
    }

    #[test]
    fn test_can_cash_out_allow_list() {
        let f = fixture();
        assert!(f.lock.can_cash_out());
        f.machine.disable(DisableReason::ReelFault, "reel");
        f.machine
            .disable(DisableReason::PendingAuthentication, "auth");
        assert!(f.lock.can_cash_out());
        f.machine.disable(DisableReason::DoorOpen, "door");
        assert!(!f.lock.can_cash_out());
    }
}
