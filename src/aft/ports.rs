//! Collaborator Ports
//!
//! Everything the AFT subsystem needs from the rest of the machine.
//! Implementations live outside this module ([`crate::sim`] ships in-process ones).

use crate::coordinator::TransactionHandle;

use super::types::{
    HostException, ReceiptStatus, TransferAmounts, TransferData, TransferStatus, TransferType,
};

// ============================================================================
// Host Link
// ============================================================================

/// Outbound calls towards the AFT host
pub trait HostLink: Send + Sync {
    /// Queue a general exception for the host to poll
    fn report_exception(&self, exception: HostException);

    /// The game lock requested by the host is now in place
    fn lock_completed(&self);

    fn set_transfer_in_enabled(&self, enabled: bool);

    fn set_transfer_out_enabled(&self, enabled: bool);

    /// Final, durably recorded success
    fn transfer_completed(&self, data: &TransferData);

    /// Final, durably recorded failure
    fn transfer_failed(&self, data: &TransferData, status: TransferStatus);

    fn update_receipt_status(&self, transaction_id: &str, status: ReceiptStatus);
}

// ============================================================================
// Machine State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisableReason {
    /// Hard cash-out lockup raised by this subsystem
    HostCashOutFailed,
    PendingAuthentication,
    ReelFault,
    DoorOpen,
    PrinterFault,
    OperatorDisabled,
    Tilt,
}

pub trait DisableMonitor: Send + Sync {
    /// Machine is disabled in a way that stops play immediately
    fn is_immediately_disabled(&self) -> bool;

    fn current_disables(&self) -> Vec<DisableReason>;

    fn disable(&self, reason: DisableReason, message: &str);

    fn enable(&self, reason: DisableReason);
}

pub trait GamePlay: Send + Sync {
    fn is_idle(&self) -> bool;

    fn is_autoplay_active(&self) -> bool;

    fn pause_autoplay(&self);

    fn resume_autoplay(&self);

    /// Tell the game runtime funds are moving (blocks play start)
    fn set_funds_transferring(&self, transferring: bool);
}

pub trait Bank: Send + Sync {
    /// Current credit balances per bucket
    fn balances(&self) -> TransferAmounts;
}

// ============================================================================
// Wallet Transfer (WAT)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    On,
    Off,
}

/// Request handed to the wallet-transfer subsystem
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletRequest {
    pub handle: TransactionHandle,
    pub transaction_id: String,
    pub direction: TransferDirection,
    pub transfer_type: TransferType,
    pub amounts: TransferAmounts,
    pub allow_partial: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalletOutcome {
    Pending,
    Committed,
    Rejected(String),
}

/// Wallet-side view of a transfer as it moves through authorize/commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletTransaction {
    pub transaction_id: String,
    pub direction: TransferDirection,
    pub transfer_type: TransferType,
    pub requested: TransferAmounts,
    pub authorized: TransferAmounts,
    pub transferred: TransferAmounts,
    pub allow_partial: bool,
    pub outcome: WalletOutcome,
}

impl WalletTransaction {
    pub fn from_request(request: &WalletRequest) -> Self {
        Self {
            transaction_id: request.transaction_id.clone(),
            direction: request.direction,
            transfer_type: request.transfer_type,
            requested: request.amounts,
            authorized: TransferAmounts::ZERO,
            transferred: TransferAmounts::ZERO,
            allow_partial: request.allow_partial,
            outcome: WalletOutcome::Pending,
        }
    }

    #[inline]
    pub fn is_committed(&self) -> bool {
        self.outcome == WalletOutcome::Committed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Stopped before any money moved
    Canceled,
    /// Money movement already started; it will run to completion
    AlreadyProcessing,
    NotFound,
}

/// The wallet-transfer subsystem that debits/credits the bank
pub trait WalletTransferService: Send + Sync {
    /// Returns true if the request was accepted for processing
    fn request_transfer(&self, request: WalletRequest) -> bool;

    fn cancel_transfer(&self, transaction_id: &str) -> CancelOutcome;

    fn acknowledge_transfer(&self, transaction_id: &str);

    /// Re-deliver the commit of an interrupted transfer.
    /// Returns false if the wallet knows nothing about it.
    fn recover_transfer(&self, transaction_id: &str) -> bool;
}

/// Callbacks the wallet makes into the owning orchestrator
pub trait WalletTransferProvider: Send + Sync {
    /// Fill in `authorized`; returning false rejects the transfer
    fn authorize_transfer(&self, transaction: &mut WalletTransaction) -> bool;

    /// Money movement finished (committed or rejected)
    fn commit_transfer(&self, transaction: &WalletTransaction);
}

// ============================================================================
// Receipts / Local Cash-Out
// ============================================================================

pub trait ReceiptPrinter: Send + Sync {
    fn print_receipt(&self, data: &TransferData) -> Result<(), String>;
}

/// Local (ticket or cash) cash-out used after a hard lockup is keyed off
pub trait LocalCashOut: Send + Sync {
    fn cash_out(&self, amounts: TransferAmounts) -> bool;
}
