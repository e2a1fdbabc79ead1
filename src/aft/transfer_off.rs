//! Transfer-Off (machine -> host)
//!
//! Admission rules:
//! - a zero-amount request is always accepted and completes without the
//!   wallet, so the host can clear a stuck request
//! - a non-zero request is refused while the machine is disabled, unless the
//!   host cash-out provider permits cashing out
//!
//! Authorization caps to the bank balances when the host allows a partial
//! transfer, and always when the machine asked for the cash-out (host
//! cash-out pending). The per-transfer limit applies in both cases.

use std::sync::Arc;
use tracing::{info, warn};

use super::hard_cashout::HardCashOutLock;
use super::host_cashout::HostCashOutProvider;
use super::orchestrator::{DirectionPolicy, Orchestrator};
use super::ports::{Bank, DisableMonitor, TransferDirection, WalletTransaction};
use super::types::{TransferData, TransferStatus};

pub struct OffPolicy {
    transfer_limit: u64,
    bank: Arc<dyn Bank>,
    disables: Arc<dyn DisableMonitor>,
    host_cashout: Arc<HostCashOutProvider>,
    hard_lock: Arc<HardCashOutLock>,
}

impl OffPolicy {
    pub fn new(
        transfer_limit: u64,
        bank: Arc<dyn Bank>,
        disables: Arc<dyn DisableMonitor>,
        host_cashout: Arc<HostCashOutProvider>,
        hard_lock: Arc<HardCashOutLock>,
    ) -> Self {
        Self {
            transfer_limit,
            bank,
            disables,
            host_cashout,
            hard_lock,
        }
    }
}

impl DirectionPolicy for OffPolicy {
    const DIRECTION: TransferDirection = TransferDirection::Off;

    fn admit(&self, data: &TransferData) -> bool {
        if data.requested.is_zero() {
            return true;
        }
        if self.disables.is_immediately_disabled() && !self.host_cashout.can_cash_out() {
            warn!(
                transaction_id = %data.transaction_id,
                disables = ?self.disables.current_disables(),
                "Transfer-off refused while disabled"
            );
            return false;
        }
        if self.hard_lock.set() {
            info!(
                transaction_id = %data.transaction_id,
                "Transfer-off supersedes hard cash-out lockup"
            );
        }
        true
    }

    fn completes_without_wallet(&self, data: &TransferData) -> bool {
        data.requested.is_zero()
    }

    fn authorize(&self, tx: &mut WalletTransaction) -> Result<(), TransferStatus> {
        let balances = self.bank.balances();
        let machine_authorized = self.host_cashout.cash_out_pending();

        let authorized = tx
            .requested
            .min_each(&balances)
            .cap_total(self.transfer_limit);

        if !machine_authorized && !tx.allow_partial && authorized != tx.requested {
            return Err(TransferStatus::NotValidTransferAmountOrExpirationDate);
        }
        if authorized.is_zero() {
            return Err(TransferStatus::NoWonCreditsAvailableForCashOut);
        }
        tx.authorized = authorized;
        Ok(())
    }

    fn on_completed(&self, data: &TransferData) {
        if self.host_cashout.cash_out_pending() {
            if data.transferred.is_zero() {
                self.host_cashout.cash_out_denied();
            } else {
                self.host_cashout.cash_out_accepted();
            }
        }
    }

    fn on_failed(&self) {
        if self.host_cashout.cash_out_pending() {
            self.host_cashout.cash_out_denied();
        }
    }
}

pub type TransferOffOrchestrator = Orchestrator<OffPolicy>;

impl Orchestrator<OffPolicy> {
    /// Immediate system disable while a transfer-off is waiting: cancel it
    /// unless money movement already started.
    pub fn on_system_disabled(&self) -> bool {
        if self.policy().host_cashout.can_cash_out() {
            return false;
        }
        self.cancel_with(TransferStatus::GamingMachineUnableToPerformTransfer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aft::context::TransferContext;
    use crate::aft::history::PersistedHistory;
    use crate::aft::meters::AftMeters;
    use crate::aft::ports::{DisableReason, WalletOutcome};
    use crate::aft::types::{AftFlags, TransferAmounts, TransferCode, TransferType};
    use crate::config::AftSettings;
    use crate::coordinator::LocalCoordinator;
    use crate::events::EventBus;
    use crate::sim::{SimBank, SimCashOut, SimHost, SimMachine};
    use crate::store::MemoryStore;
    use std::time::Duration;
    use tokio::runtime::Handle;

    struct Fixture {
        policy: OffPolicy,
        context: Arc<TransferContext>,
        host_cashout: Arc<HostCashOutProvider>,
        hard_lock: Arc<HardCashOutLock>,
        machine: Arc<SimMachine>,
    }

    fn fixture(balances: TransferAmounts) -> Fixture {
        let settings = AftSettings {
            transfer_limit: 1_000,
            ..AftSettings::default()
        };
        let store = Arc::new(MemoryStore::new());
        let host = Arc::new(SimHost::new());
        let machine = Arc::new(SimMachine::new());
        let context = TransferContext::new(
            &settings,
            Handle::current(),
            store.clone(),
            Arc::new(PersistedHistory::new(store.clone(), 8)),
            Arc::new(AftMeters::new(store)),
            host.clone(),
        )
        .unwrap();
        let hard_lock = HardCashOutLock::new(
            &settings,
            Arc::new(LocalCoordinator::new()),
            machine.clone(),
            Arc::new(SimCashOut::new()),
            EventBus::default(),
        );
        let host_cashout = HostCashOutProvider::new(
            &settings,
            Handle::current(),
            context.clone(),
            hard_lock.clone(),
            host,
        );
        let policy = OffPolicy::new(
            settings.transfer_limit,
            Arc::new(SimBank::new(balances)),
            machine.clone(),
            host_cashout.clone(),
            hard_lock.clone(),
        );
        Fixture {
            policy,
            context,
            host_cashout,
            hard_lock,
            machine,
        }
    }

    fn tx(requested: TransferAmounts, allow_partial: bool) -> WalletTransaction {
        WalletTransaction {
            transaction_id: "OFF-1".into(),
            direction: TransferDirection::Off,
            transfer_type: TransferType::InHouseToHost,
            requested,
            authorized: TransferAmounts::ZERO,
            transferred: TransferAmounts::ZERO,
            allow_partial,
            outcome: WalletOutcome::Pending,
        }
    }

    fn request(amounts: TransferAmounts) -> TransferData {
        TransferData::new("OFF-1", TransferType::InHouseToHost, TransferCode::FullOnly, amounts)
    }

    fn enable_hard_mode(context: &TransferContext) {
        let mut flags = request(TransferAmounts::ZERO);
        flags.flags = AftFlags::HOST_CASHOUT_ENABLE_CONTROL
            | AftFlags::HOST_CASHOUT_ENABLE
            | AftFlags::HOST_CASHOUT_MODE_HARD;
        context.update_host_cashout_flags(&flags).unwrap();
    }

    #[tokio::test]
    async fn test_full_only_needs_the_whole_amount_on_the_machine() {
        let f = fixture(TransferAmounts::new(300, 0, 0));
        let mut t = tx(TransferAmounts::new(500, 0, 0), false);
        assert_eq!(
            f.policy.authorize(&mut t),
            Err(TransferStatus::NotValidTransferAmountOrExpirationDate)
        );
    }

    #[tokio::test]
    async fn test_partial_takes_what_is_available() {
        let f = fixture(TransferAmounts::new(300, 50, 0));
        let mut t = tx(TransferAmounts::new(500, 100, 0), true);
        f.policy.authorize(&mut t).unwrap();
        assert_eq!(t.authorized, TransferAmounts::new(300, 50, 0));
    }

    #[tokio::test]
    async fn test_partial_is_capped_to_transfer_limit() {
        let f = fixture(TransferAmounts::new(900, 400, 0));
        let mut t = tx(TransferAmounts::new(900, 400, 0), true);
        f.policy.authorize(&mut t).unwrap();
        assert_eq!(t.authorized, TransferAmounts::new(900, 100, 0));
    }

    #[tokio::test]
    async fn test_nothing_on_the_machine_is_refused() {
        let f = fixture(TransferAmounts::ZERO);
        let mut t = tx(TransferAmounts::new(500, 0, 0), true);
        assert_eq!(
            f.policy.authorize(&mut t),
            Err(TransferStatus::NoWonCreditsAvailableForCashOut)
        );
    }

    #[tokio::test]
    async fn test_zero_amount_is_admitted_while_disabled() {
        let f = fixture(TransferAmounts::ZERO);
        f.machine.disable(DisableReason::DoorOpen, "door open");
        let data = request(TransferAmounts::ZERO);
        assert!(f.policy.admit(&data));
        assert!(f.policy.completes_without_wallet(&data));
        assert!(!f.policy.admit(&request(TransferAmounts::new(1, 0, 0))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_machine_authorized_cash_out_caps_without_partial() {
        let f = fixture(TransferAmounts::new(300, 0, 0));
        enable_hard_mode(&f.context);

        let provider = f.host_cashout.clone();
        let task = tokio::spawn(async move {
            provider
                .handle_cash_out(TransferAmounts::new(300, 0, 0), false)
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(f.host_cashout.cash_out_pending());

        let mut t = tx(TransferAmounts::new(500, 0, 0), false);
        f.policy.authorize(&mut t).unwrap();
        assert_eq!(t.authorized, TransferAmounts::new(300, 0, 0));

        let mut done = request(TransferAmounts::new(500, 0, 0));
        done.transferred = t.authorized;
        f.policy.on_completed(&done);
        assert_eq!(
            task.await.unwrap(),
            crate::aft::host_cashout::HostCashOutOutcome::Accepted
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_admission_supersedes_hard_lockup() {
        let f = fixture(TransferAmounts::new(300, 0, 0));
        assert!(f.hard_lock.lockup_and_cash_out(TransferAmounts::new(300, 0, 0)).await);
        tokio::task::yield_now().await;
        assert!(f.machine.is_immediately_disabled());

        assert!(f.policy.admit(&request(TransferAmounts::new(300, 0, 0))));
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert!(!f.hard_lock.is_active());
        assert!(!f.machine.is_immediately_disabled());
    }
}
