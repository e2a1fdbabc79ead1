//! Transfer-On (host -> machine), including bonus awards
//!
//! Authorization caps to the per-transfer limit and to the room left under
//! the bank's credit ceiling. A full-only request that does not fit is
//! refused rather than reduced.

use std::sync::Arc;
use tracing::warn;

use super::orchestrator::{DirectionPolicy, Orchestrator};
use super::ports::{Bank, DisableMonitor, TransferDirection, WalletTransaction};
use super::types::{TransferData, TransferStatus};

pub struct OnPolicy {
    transfer_limit: u64,
    credit_limit: u64,
    bank: Arc<dyn Bank>,
    disables: Arc<dyn DisableMonitor>,
}

impl OnPolicy {
    pub fn new(
        transfer_limit: u64,
        credit_limit: u64,
        bank: Arc<dyn Bank>,
        disables: Arc<dyn DisableMonitor>,
    ) -> Self {
        Self {
            transfer_limit,
            credit_limit,
            bank,
            disables,
        }
    }
}

impl DirectionPolicy for OnPolicy {
    const DIRECTION: TransferDirection = TransferDirection::On;

    fn admit(&self, data: &TransferData) -> bool {
        if self.disables.is_immediately_disabled() {
            warn!(transaction_id = %data.transaction_id, "Transfer-on refused while disabled");
            return false;
        }
        true
    }

    fn authorize(&self, tx: &mut WalletTransaction) -> Result<(), TransferStatus> {
        let room = self
            .credit_limit
            .saturating_sub(self.bank.balances().total());
        let authorized = tx.requested.cap_total(self.transfer_limit).cap_total(room);
        if authorized != tx.requested && !tx.allow_partial {
            return Err(TransferStatus::TransferAmountExceedsGameLimit);
        }
        tx.authorized = authorized;
        Ok(())
    }
}

pub type TransferOnOrchestrator = Orchestrator<OnPolicy>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aft::types::{TransferAmounts, TransferType};
    use crate::sim::{SimBank, SimMachine};

    fn tx(requested: TransferAmounts, allow_partial: bool) -> WalletTransaction {
        WalletTransaction {
            transaction_id: "ON-1".into(),
            direction: TransferDirection::On,
            transfer_type: TransferType::InHouseToGamingMachine,
            requested,
            authorized: TransferAmounts::ZERO,
            transferred: TransferAmounts::ZERO,
            allow_partial,
            outcome: crate::aft::ports::WalletOutcome::Pending,
        }
    }

    fn policy(balance: u64) -> OnPolicy {
        OnPolicy::new(
            1_000,
            5_000,
            Arc::new(SimBank::new(TransferAmounts::new(balance, 0, 0))),
            Arc::new(SimMachine::new()),
        )
    }

    #[test]
    fn test_within_limits_authorizes_everything() {
        let mut t = tx(TransferAmounts::new(600, 200, 100), false);
        policy(0).authorize(&mut t).unwrap();
        assert_eq!(t.authorized, TransferAmounts::new(600, 200, 100));
    }

    #[test]
    fn test_partial_caps_to_transfer_limit() {
        let mut t = tx(TransferAmounts::new(800, 400, 0), true);
        policy(0).authorize(&mut t).unwrap();
        assert_eq!(t.authorized, TransferAmounts::new(800, 200, 0));
    }

    #[test]
    fn test_partial_caps_to_credit_room() {
        let mut t = tx(TransferAmounts::new(900, 0, 0), true);
        policy(4_700).authorize(&mut t).unwrap();
        assert_eq!(t.authorized.total(), 300);
    }

    #[test]
    fn test_full_only_over_credit_limit_is_refused() {
        let mut t = tx(TransferAmounts::new(900, 0, 0), false);
        assert_eq!(
            policy(4_700).authorize(&mut t),
            Err(TransferStatus::TransferAmountExceedsGameLimit)
        );
        assert!(t.authorized.is_zero());
    }

    #[test]
    fn test_admission_refused_while_disabled() {
        let machine = Arc::new(SimMachine::new());
        let policy = OnPolicy::new(1_000, 5_000, Arc::new(SimBank::default()), machine.clone());
        let data = TransferData::new(
            "ON-2",
            TransferType::InHouseToGamingMachine,
            crate::aft::types::TransferCode::FullOnly,
            TransferAmounts::new(100, 0, 0),
        );
        assert!(policy.admit(&data));
        machine.disable(crate::aft::ports::DisableReason::DoorOpen, "door open");
        assert!(!policy.admit(&data));
    }
}
