//! Transfer Orchestrator
//!
//! Drives one accepted transfer through the wallet-transfer subsystem:
//!
//! ```text
//!   Idle ──initiate──▶ AwaitingHandle ──handle──▶ AwaitingWallet
//!    ▲                     │                           │ authorize
//!    │                     │ timeout / denied          ▼
//!    └─────────────────────┴──────── finish ◀──── Processing ──commit
//!    │                                                 ▲
//!    └──recover──▶ Recovering ──────── re-delivery ────┘
//!                      │ timeout: failed
//! ```
//!
//! The handle comes from the game lock when it already holds one, from the
//! lock once a pending lock negotiation completes, or straight from the
//! coordinator. Direction-specific rules (admission while disabled, how
//! amounts are authorized, host cash-out signaling) live in a
//! [`DirectionPolicy`]; see `transfer_off` and `transfer_on`.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::AftSettings;
use crate::coordinator::{
    RequestorId, TransactionCoordinator, TransactionGrant, TransactionHandle, TransactionKind,
    TransactionRequestor,
};
use crate::events::{AftEvent, EventBus};

use super::context::TransferContext;
use super::lock::{GameLock, LockListener};
use super::ports::{
    CancelOutcome, HostLink, ReceiptPrinter, TransferDirection, WalletOutcome, WalletRequest,
    WalletTransaction, WalletTransferProvider, WalletTransferService,
};
use super::types::{ReceiptStatus, TransferAmounts, TransferData, TransferStatus};

/// Operations the transfer context drives
pub trait TransferOrchestrator: Send + Sync {
    /// Acquire the exclusive handle and hand the request to the wallet.
    /// False means the transfer cannot proceed.
    fn initiate(&self) -> bool;

    /// Take ownership of an accepted request and initiate it
    fn request(&self, data: &TransferData, partial_allowed: bool) -> bool;

    /// Host cancel. True if the transfer was stopped before money moved.
    fn cancel(&self) -> bool;

    /// Resume an interrupted transfer after a restart
    fn recover(&self, transaction_id: &str) -> bool;

    fn acknowledge(&self, transaction_id: &str);
}

/// Direction-specific rules plugged into [`Orchestrator`]
pub trait DirectionPolicy: Send + Sync + 'static {
    const DIRECTION: TransferDirection;

    /// Synchronous admission of a new request
    fn admit(&self, data: &TransferData) -> bool;

    /// Nothing to move; finalize without the wallet
    fn completes_without_wallet(&self, _data: &TransferData) -> bool {
        false
    }

    /// Fill `tx.authorized`. An error rejects the transfer with that status.
    fn authorize(&self, tx: &mut WalletTransaction) -> Result<(), TransferStatus>;

    fn on_completed(&self, _data: &TransferData) {}

    fn on_failed(&self) {}
}

/// Shared collaborators of both orchestrators
#[derive(Clone)]
pub struct OrchestratorDeps {
    pub settings: AftSettings,
    pub runtime: Handle,
    pub coordinator: Arc<dyn TransactionCoordinator>,
    pub lock: Arc<GameLock>,
    pub context: Arc<TransferContext>,
    pub wallet: Arc<dyn WalletTransferService>,
    pub printer: Arc<dyn ReceiptPrinter>,
    pub host: Arc<dyn HostLink>,
    pub events: EventBus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferPhase {
    #[default]
    Idle,
    AwaitingHandle,
    AwaitingWallet,
    Processing,
    Recovering,
}

#[derive(Default)]
struct OrchestratorState {
    phase: TransferPhase,
    request: Option<TransferData>,
    partial: bool,
    handle: Option<TransactionHandle>,
    reject_status: Option<TransferStatus>,
    generation: u64,
    wait_timer: Option<JoinHandle<()>>,
}

enum HandleOutcome {
    Submitted,
    Stale,
    Refused,
}

pub struct Orchestrator<P: DirectionPolicy> {
    id: RequestorId,
    weak_self: Weak<Orchestrator<P>>,
    deps: OrchestratorDeps,
    policy: P,
    state: Mutex<OrchestratorState>,
}

impl<P: DirectionPolicy> Orchestrator<P> {
    pub fn new(deps: OrchestratorDeps, policy: P) -> Arc<Self> {
        let orchestrator = Arc::new_cyclic(|weak: &Weak<Orchestrator<P>>| Orchestrator {
            id: RequestorId::new(),
            weak_self: weak.clone(),
            deps,
            policy,
            state: Mutex::new(OrchestratorState::default()),
        });
        let listener: Weak<dyn LockListener> =
            Arc::downgrade(&orchestrator) as Weak<dyn LockListener>;
        orchestrator.deps.lock.add_listener(listener);
        orchestrator
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    pub fn phase(&self) -> TransferPhase {
        self.state.lock().phase
    }

    pub fn holds_handle(&self) -> bool {
        self.state.lock().handle.is_some()
    }

    pub fn transaction_id(&self) -> Option<String> {
        self.state
            .lock()
            .request
            .as_ref()
            .map(|r| r.transaction_id.clone())
    }

    /// Stop a waiting transfer and fail it with `status`
    pub(crate) fn cancel_with(&self, status: TransferStatus) -> bool {
        let (phase, transaction_id) = {
            let state = self.state.lock();
            (
                state.phase,
                state.request.as_ref().map(|r| r.transaction_id.clone()),
            )
        };
        let Some(transaction_id) = transaction_id else {
            return false;
        };

        let stopped = match phase {
            TransferPhase::AwaitingHandle => {
                self.finish_if(Some(TransferPhase::AwaitingHandle), true)
            }
            TransferPhase::AwaitingWallet => {
                match self.deps.wallet.cancel_transfer(&transaction_id) {
                    CancelOutcome::Canceled | CancelOutcome::NotFound => {
                        self.finish_if(Some(TransferPhase::AwaitingWallet), true)
                    }
                    CancelOutcome::AlreadyProcessing => {
                        info!(
                            transaction_id = %transaction_id,
                            "Cancel refused, wallet already processing"
                        );
                        false
                    }
                }
            }
            TransferPhase::Processing => {
                info!(transaction_id = %transaction_id, "Cancel refused, transfer processing");
                false
            }
            TransferPhase::Idle | TransferPhase::Recovering => false,
        };

        if stopped {
            info!(transaction_id = %transaction_id, status = %status, "Transfer canceled");
            self.fail_context(status);
        }
        stopped
    }

    fn on_handle(&self, handle: TransactionHandle, generation: u64) -> HandleOutcome {
        let (data, partial) = {
            let mut state = self.state.lock();
            if state.phase != TransferPhase::AwaitingHandle || state.generation != generation {
                drop(state);
                debug!(handle = %handle, "Handle no longer needed, releasing");
                self.deps.coordinator.release(handle);
                return HandleOutcome::Stale;
            }
            let Some(data) = state.request.clone() else {
                drop(state);
                self.deps.coordinator.release(handle);
                return HandleOutcome::Stale;
            };
            if let Some(timer) = state.wait_timer.take() {
                timer.abort();
            }
            state.handle = Some(handle);
            state.phase = TransferPhase::AwaitingWallet;
            (data, state.partial)
        };

        let request = WalletRequest {
            handle,
            transaction_id: data.transaction_id.clone(),
            direction: P::DIRECTION,
            transfer_type: data.transfer_type,
            amounts: data.requested,
            allow_partial: partial,
        };
        if self.deps.wallet.request_transfer(request) {
            info!(
                transaction_id = %data.transaction_id,
                direction = ?P::DIRECTION,
                handle = %handle,
                "Wallet transfer requested"
            );
            HandleOutcome::Submitted
        } else {
            warn!(transaction_id = %data.transaction_id, "Wallet refused transfer request");
            self.finish_if(Some(TransferPhase::AwaitingWallet), true);
            HandleOutcome::Refused
        }
    }

    /// Handle delivered after `initiate` returned
    fn on_deferred_handle(&self, handle: TransactionHandle, generation: u64) {
        if let HandleOutcome::Refused = self.on_handle(handle, generation) {
            self.fail_context(TransferStatus::GamingMachineUnableToPerformTransfer);
        }
    }

    /// Bound a wait for the handle or for a re-delivery. Stale once the
    /// generation moves on.
    fn arm_wait_timer(&self, generation: u64, timeout: Duration) {
        let weak = self.weak_self.clone();
        let task = self.deps.runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(orchestrator) = weak.upgrade() {
                orchestrator.on_wait_timeout(generation);
            }
        });
        if let Some(previous) = self.state.lock().wait_timer.replace(task) {
            previous.abort();
        }
    }

    fn on_wait_timeout(&self, generation: u64) {
        let phase = {
            let mut state = self.state.lock();
            let waiting = matches!(
                state.phase,
                TransferPhase::AwaitingHandle | TransferPhase::Recovering
            );
            if !waiting || state.generation != generation {
                return;
            }
            state.wait_timer = None;
            state.phase
        };
        match phase {
            TransferPhase::Recovering => warn!("Timed out waiting for the wallet to re-deliver"),
            _ => warn!("Timed out waiting for the transaction handle"),
        }
        if self.finish_if(Some(phase), true) {
            self.fail_context(TransferStatus::GamingMachineUnableToPerformTransfer);
        }
    }

    /// Return to Idle: release or abandon the handle, end the game lock.
    /// With `expected` set, only if still in that phase.
    fn finish_if(&self, expected: Option<TransferPhase>, failed: bool) -> bool {
        let (handle, was_active) = {
            let mut state = self.state.lock();
            if expected.is_some_and(|phase| state.phase != phase) {
                return false;
            }
            if state.phase == TransferPhase::Idle && state.request.is_none() {
                return false;
            }
            if let Some(timer) = state.wait_timer.take() {
                timer.abort();
            }
            let was_active = state.phase != TransferPhase::Idle;
            state.phase = TransferPhase::Idle;
            state.request = None;
            state.reject_status = None;
            state.generation += 1;
            (state.handle.take(), was_active)
        };

        match handle {
            Some(handle) => {
                self.deps.coordinator.release(handle);
            }
            None => self.deps.coordinator.abandon_all(self.id),
        }
        if failed {
            self.policy.on_failed();
        }
        self.deps.lock.request_unlock();
        if was_active {
            self.deps
                .events
                .publish(AftEvent::TransferLockChanged { locked: false });
        }
        true
    }

    fn fail_context(&self, status: TransferStatus) {
        if let Err(e) = self.deps.context.transfer_failed(status) {
            error!(error = %e, code = e.code(), "Failed to record transfer failure");
        }
    }

    fn complete_without_wallet(&self, data: &TransferData) -> bool {
        let receipt = ReceiptStatus::NoReceiptRequested;
        match self.deps.context.update_final_aft_response_data(TransferAmounts::ZERO, receipt) {
            Ok(done) => {
                info!(transaction_id = %data.transaction_id, "Zero-amount transfer completed");
                self.policy.on_completed(&done);
                self.finish_if(None, false);
                true
            }
            Err(e) => {
                error!(
                    transaction_id = %data.transaction_id,
                    error = %e,
                    "Failed to complete zero-amount transfer"
                );
                self.finish_if(None, true);
                false
            }
        }
    }

    /// Receipt outcome never changes the money outcome
    fn attempt_receipt(
        &self,
        data: &TransferData,
        transferred: TransferAmounts,
    ) -> ReceiptStatus {
        if !data.receipt_requested() {
            return ReceiptStatus::NoReceiptRequested;
        }
        let mut printed = data.clone();
        printed.transferred = transferred;
        let status = match self.deps.printer.print_receipt(&printed) {
            Ok(()) => ReceiptStatus::ReceiptPrinted,
            Err(reason) => {
                error!(
                    transaction_id = %data.transaction_id,
                    reason = %reason,
                    "Receipt printing failed"
                );
                ReceiptStatus::NoReceiptRequested
            }
        };
        self.deps
            .host
            .update_receipt_status(&data.transaction_id, status);
        status
    }
}

impl<P: DirectionPolicy> TransferOrchestrator for Orchestrator<P> {
    fn initiate(&self) -> bool {
        let generation = {
            let mut state = self.state.lock();
            if state.request.is_none() || state.phase != TransferPhase::Idle {
                warn!(phase = ?state.phase, "Initiate without an idle request");
                return false;
            }
            state.phase = TransferPhase::AwaitingHandle;
            state.generation += 1;
            state.generation
        };
        self.deps
            .events
            .publish(AftEvent::TransferLockChanged { locked: true });

        if let Some(handle) = self.deps.lock.take_handle() {
            debug!(handle = %handle, "Using the game lock's handle");
            return matches!(self.on_handle(handle, generation), HandleOutcome::Submitted);
        }

        let handle_timeout = self.deps.settings.transfer_handle_timeout();
        if self.deps.lock.is_pending() {
            debug!("Waiting for the pending game lock");
            self.arm_wait_timer(generation, handle_timeout);
            return true;
        }

        let Some(requestor) = self.weak_self.upgrade() else {
            return false;
        };
        match self
            .deps
            .coordinator
            .request(requestor, Some(handle_timeout), TransactionKind::Write)
        {
            TransactionGrant::Granted(handle) => {
                matches!(self.on_handle(handle, generation), HandleOutcome::Submitted)
            }
            TransactionGrant::Pending => {
                debug!("Waiting for the transaction handle");
                self.arm_wait_timer(generation, handle_timeout);
                true
            }
            TransactionGrant::Denied => {
                warn!("Transaction handle denied");
                self.finish_if(Some(TransferPhase::AwaitingHandle), true);
                false
            }
        }
    }

    fn request(&self, data: &TransferData, partial_allowed: bool) -> bool {
        {
            let mut state = self.state.lock();
            if state.phase != TransferPhase::Idle {
                warn!(
                    transaction_id = %data.transaction_id,
                    phase = ?state.phase,
                    "Transfer already in progress"
                );
                return false;
            }
            state.request = Some(data.clone());
            state.partial = partial_allowed;
            state.reject_status = None;
        }

        if !self.policy.admit(data) {
            self.finish_if(None, true);
            return false;
        }
        if self.policy.completes_without_wallet(data) {
            return self.complete_without_wallet(data);
        }
        self.initiate()
    }

    fn cancel(&self) -> bool {
        self.cancel_with(TransferStatus::CanceledByHost)
    }

    fn recover(&self, transaction_id: &str) -> bool {
        let data = self.deps.context.current();
        if data.transaction_id != transaction_id || !data.status.is_pending() {
            return false;
        }
        let generation = {
            let mut state = self.state.lock();
            if state.phase != TransferPhase::Idle {
                return false;
            }
            state.phase = TransferPhase::Recovering;
            state.partial = data.partial_allowed();
            state.request = Some(data);
            state.generation += 1;
            state.generation
        };

        if self.deps.wallet.recover_transfer(transaction_id) {
            info!(transaction_id, "Wallet will re-deliver the interrupted transfer");
            self.arm_wait_timer(generation, self.deps.settings.recovery_timeout());
            true
        } else {
            let mut state = self.state.lock();
            state.phase = TransferPhase::Idle;
            state.request = None;
            false
        }
    }

    fn acknowledge(&self, transaction_id: &str) {
        self.deps.wallet.acknowledge_transfer(transaction_id);
    }
}

impl<P: DirectionPolicy> WalletTransferProvider for Orchestrator<P> {
    fn authorize_transfer(&self, tx: &mut WalletTransaction) -> bool {
        {
            let mut state = self.state.lock();
            let matches = state
                .request
                .as_ref()
                .is_some_and(|r| r.transaction_id == tx.transaction_id);
            if !matches || state.phase != TransferPhase::AwaitingWallet {
                warn!(
                    transaction_id = %tx.transaction_id,
                    phase = ?state.phase,
                    "Unexpected authorization"
                );
                return false;
            }
            state.phase = TransferPhase::Processing;
        }

        match self.policy.authorize(tx) {
            Ok(()) => {
                debug!(
                    transaction_id = %tx.transaction_id,
                    authorized = %tx.authorized,
                    "Transfer authorized"
                );
                true
            }
            Err(status) => {
                info!(
                    transaction_id = %tx.transaction_id,
                    status = %status,
                    "Transfer not authorized"
                );
                self.state.lock().reject_status = Some(status);
                false
            }
        }
    }

    fn commit_transfer(&self, tx: &WalletTransaction) {
        let (data, reject_status) = {
            let mut state = self.state.lock();
            let matches = state
                .request
                .as_ref()
                .is_some_and(|r| r.transaction_id == tx.transaction_id);
            let expected = matches!(
                state.phase,
                TransferPhase::AwaitingWallet
                    | TransferPhase::Processing
                    | TransferPhase::Recovering
            );
            let Some(data) = state.request.clone().filter(|_| matches && expected) else {
                warn!(
                    transaction_id = %tx.transaction_id,
                    phase = ?state.phase,
                    "Unexpected commit"
                );
                return;
            };
            state.phase = TransferPhase::Processing;
            if let Some(timer) = state.wait_timer.take() {
                timer.abort();
            }
            (data, state.reject_status.take())
        };

        if tx.is_committed() {
            let receipt = self.attempt_receipt(&data, tx.transferred);
            match self
                .deps
                .context
                .update_final_aft_response_data(tx.transferred, receipt)
            {
                Ok(done) => {
                    self.policy.on_completed(&done);
                    self.finish_if(None, false);
                }
                Err(e) => {
                    error!(
                        transaction_id = %data.transaction_id,
                        transferred = %tx.transferred,
                        error = %e,
                        "Money moved but the final record could not be saved"
                    );
                    self.finish_if(None, true);
                    self.fail_context(TransferStatus::UnexpectedError);
                }
            }
        } else {
            if let WalletOutcome::Rejected(reason) = &tx.outcome {
                warn!(
                    transaction_id = %data.transaction_id,
                    reason = %reason,
                    "Wallet rejected transfer"
                );
            }
            self.finish_if(None, true);
            let status =
                reject_status.unwrap_or(TransferStatus::GamingMachineUnableToPerformTransfer);
            self.fail_context(status);
        }
    }
}

impl<P: DirectionPolicy> TransactionRequestor for Orchestrator<P> {
    fn requestor_id(&self) -> RequestorId {
        self.id
    }

    fn notify_transaction_ready(&self, handle: TransactionHandle) {
        let generation = {
            let state = self.state.lock();
            if state.phase != TransferPhase::AwaitingHandle {
                drop(state);
                self.deps.coordinator.release(handle);
                return;
            }
            state.generation
        };
        self.on_deferred_handle(handle, generation);
    }
}

impl<P: DirectionPolicy> LockListener for Orchestrator<P> {
    fn on_game_locked(&self) {
        let generation = {
            let state = self.state.lock();
            if state.phase != TransferPhase::AwaitingHandle {
                return;
            }
            state.generation
        };
        if let Some(handle) = self.deps.lock.take_handle() {
            self.deps.coordinator.abandon_all(self.id);
            debug!(handle = %handle, "Game lock completed, taking its handle");
            self.on_deferred_handle(handle, generation);
        }
    }
}
