//! In-Process Collaborators
//!
//! Simple implementations of every [`crate::aft::ports`] trait. They back the
//! `aft-sim` binary and the test suites, and record what the AFT subsystem
//! asked of them so callers can inspect it.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::{debug, info};

use crate::aft::engine::AftCollaborators;
use crate::aft::ports::{
    Bank, CancelOutcome, DisableMonitor, DisableReason, GamePlay, HostLink, LocalCashOut,
    ReceiptPrinter, TransferDirection, WalletOutcome, WalletRequest, WalletTransaction,
    WalletTransferProvider, WalletTransferService,
};
use crate::aft::types::{
    HostException, ReceiptStatus, TransferAmounts, TransferData, TransferStatus,
};
use crate::coordinator::LocalCoordinator;

// ============================================================================
// Host
// ============================================================================

/// Records every outbound host call
#[derive(Default)]
pub struct SimHost {
    exceptions: Mutex<Vec<HostException>>,
    lock_completed: AtomicUsize,
    transfer_in_enabled: AtomicBool,
    transfer_out_enabled: AtomicBool,
    completed: Mutex<Vec<TransferData>>,
    failed: Mutex<Vec<(TransferData, TransferStatus)>>,
    receipts: Mutex<Vec<(String, ReceiptStatus)>>,
}

impl SimHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exceptions(&self) -> Vec<HostException> {
        self.exceptions.lock().clone()
    }

    pub fn exception_count(&self, exception: HostException) -> usize {
        self.exceptions
            .lock()
            .iter()
            .filter(|e| **e == exception)
            .count()
    }

    pub fn lock_completed_count(&self) -> usize {
        self.lock_completed.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> Vec<TransferData> {
        self.completed.lock().clone()
    }

    pub fn failed(&self) -> Vec<(TransferData, TransferStatus)> {
        self.failed.lock().clone()
    }

    pub fn receipt_updates(&self) -> Vec<(String, ReceiptStatus)> {
        self.receipts.lock().clone()
    }

    pub fn transfer_in_enabled(&self) -> bool {
        self.transfer_in_enabled.load(Ordering::SeqCst)
    }

    pub fn transfer_out_enabled(&self) -> bool {
        self.transfer_out_enabled.load(Ordering::SeqCst)
    }
}

impl HostLink for SimHost {
    fn report_exception(&self, exception: HostException) {
        debug!(exception = ?exception, code = exception.code(), "Host exception");
        self.exceptions.lock().push(exception);
    }

    fn lock_completed(&self) {
        self.lock_completed.fetch_add(1, Ordering::SeqCst);
    }

    fn set_transfer_in_enabled(&self, enabled: bool) {
        self.transfer_in_enabled.store(enabled, Ordering::SeqCst);
    }

    fn set_transfer_out_enabled(&self, enabled: bool) {
        self.transfer_out_enabled.store(enabled, Ordering::SeqCst);
    }

    fn transfer_completed(&self, data: &TransferData) {
        self.completed.lock().push(data.clone());
    }

    fn transfer_failed(&self, data: &TransferData, status: TransferStatus) {
        self.failed.lock().push((data.clone(), status));
    }

    fn update_receipt_status(&self, transaction_id: &str, status: ReceiptStatus) {
        self.receipts
            .lock()
            .push((transaction_id.to_string(), status));
    }
}

// ============================================================================
// Machine (disables + game play)
// ============================================================================

pub struct SimMachine {
    idle: AtomicBool,
    autoplay: AtomicBool,
    funds_transferring: AtomicBool,
    disables: Mutex<Vec<(DisableReason, String)>>,
}

impl SimMachine {
    pub fn new() -> Self {
        Self {
            idle: AtomicBool::new(true),
            autoplay: AtomicBool::new(false),
            funds_transferring: AtomicBool::new(false),
            disables: Mutex::new(Vec::new()),
        }
    }

    pub fn set_idle(&self, idle: bool) {
        self.idle.store(idle, Ordering::SeqCst);
    }

    pub fn set_autoplay(&self, active: bool) {
        self.autoplay.store(active, Ordering::SeqCst);
    }

    pub fn funds_transferring(&self) -> bool {
        self.funds_transferring.load(Ordering::SeqCst)
    }

    /// Message shown for a disable, if present
    pub fn disable_message(&self, reason: DisableReason) -> Option<String> {
        self.disables
            .lock()
            .iter()
            .find(|(r, _)| *r == reason)
            .map(|(_, m)| m.clone())
    }
}

impl Default for SimMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl DisableMonitor for SimMachine {
    fn is_immediately_disabled(&self) -> bool {
        !self.disables.lock().is_empty()
    }

    fn current_disables(&self) -> Vec<DisableReason> {
        self.disables.lock().iter().map(|(r, _)| *r).collect()
    }

    fn disable(&self, reason: DisableReason, message: &str) {
        let mut disables = self.disables.lock();
        if !disables.iter().any(|(r, _)| *r == reason) {
            info!(reason = ?reason, message, "Machine disabled");
            disables.push((reason, message.to_string()));
        }
    }

    fn enable(&self, reason: DisableReason) {
        self.disables.lock().retain(|(r, _)| *r != reason);
    }
}

impl GamePlay for SimMachine {
    fn is_idle(&self) -> bool {
        self.idle.load(Ordering::SeqCst)
    }

    fn is_autoplay_active(&self) -> bool {
        self.autoplay.load(Ordering::SeqCst)
    }

    fn pause_autoplay(&self) {
        self.autoplay.store(false, Ordering::SeqCst);
    }

    fn resume_autoplay(&self) {
        self.autoplay.store(true, Ordering::SeqCst);
    }

    fn set_funds_transferring(&self, transferring: bool) {
        self.funds_transferring.store(transferring, Ordering::SeqCst);
    }
}

// ============================================================================
// Bank
// ============================================================================

#[derive(Default)]
pub struct SimBank {
    balances: Mutex<TransferAmounts>,
}

impl SimBank {
    pub fn new(balances: TransferAmounts) -> Self {
        Self {
            balances: Mutex::new(balances),
        }
    }

    pub fn set_balances(&self, balances: TransferAmounts) {
        *self.balances.lock() = balances;
    }

    pub fn credit(&self, amounts: &TransferAmounts) {
        let mut balances = self.balances.lock();
        *balances = balances.saturating_add(amounts);
    }

    /// Debit up to the available amount per bucket; returns what was taken
    pub fn debit(&self, amounts: &TransferAmounts) -> TransferAmounts {
        let mut balances = self.balances.lock();
        let taken = amounts.min_each(&balances);
        balances.cashable -= taken.cashable;
        balances.restricted -= taken.restricted;
        balances.nonrestricted -= taken.nonrestricted;
        taken
    }
}

impl Bank for SimBank {
    fn balances(&self) -> TransferAmounts {
        *self.balances.lock()
    }
}

// ============================================================================
// Wallet Transfer
// ============================================================================

#[derive(Default)]
struct WalletState {
    queued: VecDeque<WalletRequest>,
    processing: Option<String>,
    journal: Vec<WalletTransaction>,
    redeliveries: VecDeque<WalletTransaction>,
    acknowledged: Vec<String>,
}

/// Wallet that processes requests when told to, moving money in a [`SimBank`]
pub struct SimWallet {
    accept: AtomicBool,
    reject_commit: AtomicBool,
    requests: AtomicUsize,
    state: Mutex<WalletState>,
}

impl SimWallet {
    pub fn new() -> Self {
        Self {
            accept: AtomicBool::new(true),
            reject_commit: AtomicBool::new(false),
            requests: AtomicUsize::new(0),
            state: Mutex::new(WalletState::default()),
        }
    }

    /// Refuse new requests synchronously
    pub fn set_accept(&self, accept: bool) {
        self.accept.store(accept, Ordering::SeqCst);
    }

    /// Fail money movement for authorized transfers
    pub fn set_reject_commit(&self, reject: bool) {
        self.reject_commit.store(reject, Ordering::SeqCst);
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn queued(&self) -> usize {
        self.state.lock().queued.len()
    }

    pub fn acknowledged(&self) -> Vec<String> {
        self.state.lock().acknowledged.clone()
    }

    /// Start processing the oldest request without finishing it
    pub fn begin_next(&self) -> Option<WalletRequest> {
        let mut state = self.state.lock();
        let request = state.queued.pop_front()?;
        state.processing = Some(request.transaction_id.clone());
        Some(request)
    }

    /// Run the oldest queued request through authorize -> move money -> commit
    pub fn process_next(&self, provider: &dyn WalletTransferProvider, bank: &SimBank) -> bool {
        match self.begin_next() {
            Some(request) => {
                self.finish(request, provider, bank);
                true
            }
            None => false,
        }
    }

    /// Complete a request previously started with [`SimWallet::begin_next`]
    pub fn finish(
        &self,
        request: WalletRequest,
        provider: &dyn WalletTransferProvider,
        bank: &SimBank,
    ) {
        let mut tx = WalletTransaction::from_request(&request);
        if !provider.authorize_transfer(&mut tx) {
            tx.outcome = WalletOutcome::Rejected("not authorized".to_string());
        } else if self.reject_commit.load(Ordering::SeqCst) {
            tx.outcome = WalletOutcome::Rejected("bank error".to_string());
        } else {
            tx.transferred = match tx.direction {
                TransferDirection::Off => bank.debit(&tx.authorized),
                TransferDirection::On => {
                    bank.credit(&tx.authorized);
                    tx.authorized
                }
            };
            tx.outcome = WalletOutcome::Committed;
        }

        {
            let mut state = self.state.lock();
            state.processing = None;
            state.journal.push(tx.clone());
        }
        provider.commit_transfer(&tx);
    }

    /// Re-deliver commits queued by `recover_transfer`
    pub fn redeliver(&self, provider: &dyn WalletTransferProvider) -> usize {
        let pending: Vec<_> = self.state.lock().redeliveries.drain(..).collect();
        let count = pending.len();
        for tx in pending {
            provider.commit_transfer(&tx);
        }
        count
    }

    /// Seed the journal as if a transfer had committed before a restart
    pub fn seed_journal(&self, tx: WalletTransaction) {
        self.state.lock().journal.push(tx);
    }
}

impl Default for SimWallet {
    fn default() -> Self {
        Self::new()
    }
}

impl WalletTransferService for SimWallet {
    fn request_transfer(&self, request: WalletRequest) -> bool {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if !self.accept.load(Ordering::SeqCst) {
            return false;
        }
        self.state.lock().queued.push_back(request);
        true
    }

    fn cancel_transfer(&self, transaction_id: &str) -> CancelOutcome {
        let mut state = self.state.lock();
        if state.processing.as_deref() == Some(transaction_id) {
            return CancelOutcome::AlreadyProcessing;
        }
        let before = state.queued.len();
        state.queued.retain(|r| r.transaction_id != transaction_id);
        if state.queued.len() < before {
            CancelOutcome::Canceled
        } else {
            CancelOutcome::NotFound
        }
    }

    fn acknowledge_transfer(&self, transaction_id: &str) {
        self.state.lock().acknowledged.push(transaction_id.to_string());
    }

    fn recover_transfer(&self, transaction_id: &str) -> bool {
        let mut state = self.state.lock();
        let found = state
            .journal
            .iter()
            .rev()
            .find(|tx| tx.transaction_id == transaction_id)
            .cloned();
        match found {
            Some(tx) => {
                state.redeliveries.push_back(tx);
                true
            }
            None => false,
        }
    }
}

// ============================================================================
// Printer / Local Cash-Out
// ============================================================================

#[derive(Default)]
pub struct SimPrinter {
    fail: AtomicBool,
    printed: Mutex<Vec<String>>,
}

impl SimPrinter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn printed(&self) -> Vec<String> {
        self.printed.lock().clone()
    }
}

impl ReceiptPrinter for SimPrinter {
    fn print_receipt(&self, data: &TransferData) -> Result<(), String> {
        if self.fail.load(Ordering::SeqCst) {
            return Err("printer paper out".to_string());
        }
        self.printed.lock().push(data.transaction_id.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct SimCashOut {
    paid: Mutex<Vec<TransferAmounts>>,
}

impl SimCashOut {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn paid(&self) -> Vec<TransferAmounts> {
        self.paid.lock().clone()
    }
}

impl LocalCashOut for SimCashOut {
    fn cash_out(&self, amounts: TransferAmounts) -> bool {
        info!(%amounts, "Local cash-out");
        self.paid.lock().push(amounts);
        true
    }
}

// ============================================================================
// Rig
// ============================================================================

/// One of each simulated collaborator, wired for an [`AftEngine`]
///
/// [`AftEngine`]: crate::aft::engine::AftEngine
pub struct SimRig {
    pub coordinator: Arc<LocalCoordinator>,
    pub host: Arc<SimHost>,
    pub machine: Arc<SimMachine>,
    pub bank: Arc<SimBank>,
    pub wallet: Arc<SimWallet>,
    pub printer: Arc<SimPrinter>,
    pub cash_out: Arc<SimCashOut>,
}

impl SimRig {
    pub fn new(balances: TransferAmounts) -> Self {
        Self {
            coordinator: Arc::new(LocalCoordinator::new()),
            host: Arc::new(SimHost::new()),
            machine: Arc::new(SimMachine::new()),
            bank: Arc::new(SimBank::new(balances)),
            wallet: Arc::new(SimWallet::new()),
            printer: Arc::new(SimPrinter::new()),
            cash_out: Arc::new(SimCashOut::new()),
        }
    }

    pub fn collaborators(&self) -> AftCollaborators {
        AftCollaborators {
            coordinator: self.coordinator.clone(),
            host: self.host.clone(),
            game: self.machine.clone(),
            disables: self.machine.clone(),
            bank: self.bank.clone(),
            wallet: self.wallet.clone(),
            printer: self.printer.clone(),
            cash_out: self.cash_out.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bank_debit_caps_per_bucket() {
        let bank = SimBank::new(TransferAmounts::new(100, 50, 0));
        let taken = bank.debit(&TransferAmounts::new(200, 10, 5));
        assert_eq!(taken, TransferAmounts::new(100, 10, 0));
        assert_eq!(bank.balances(), TransferAmounts::new(0, 40, 0));
    }

    #[test]
    fn test_machine_disables() {
        let machine = SimMachine::new();
        assert!(!machine.is_immediately_disabled());
        machine.disable(DisableReason::DoorOpen, "Main door open");
        machine.disable(DisableReason::DoorOpen, "Main door open");
        assert_eq!(machine.current_disables(), vec![DisableReason::DoorOpen]);
        machine.enable(DisableReason::DoorOpen);
        assert!(!machine.is_immediately_disabled());
    }
}
