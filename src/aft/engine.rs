//! AFT Engine
//!
//! Wires the subsystem together and exposes the host command surface.
//! Requests are screened against an ordered rule list first; a protocol
//! rejection is answered with the failing status and never touches the
//! persisted current transfer.
//!
//! Timers run on the tokio runtime the engine was built in. Host commands
//! may then arrive on any thread.

use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{error, info, warn};

use crate::config::AftSettings;
use crate::coordinator::TransactionCoordinator;
use crate::events::EventBus;
use crate::store::Store;

use super::context::{ErrorRule, TransferContext, is_transaction_id_valid};
use super::error::AftError;
use super::hard_cashout::HardCashOutLock;
use super::history::PersistedHistory;
use super::host_cashout::{HostCashOutOutcome, HostCashOutProvider};
use super::lock::{GameLock, LockState};
use super::meters::{AftMeters, MeterSet};
use super::orchestrator::{OrchestratorDeps, TransferOrchestrator};
use super::ports::{
    Bank, DisableMonitor, GamePlay, HostLink, LocalCashOut, ReceiptPrinter, WalletTransferService,
};
use super::registration::{
    REGISTRATION_KEY_LEN, RegistrationCode, RegistrationRecord, RegistrationState,
    RegistrationStateMachine, ZERO_KEY,
};
use super::transfer_off::{OffPolicy, TransferOffOrchestrator};
use super::transfer_on::{OnPolicy, TransferOnOrchestrator};
use super::types::{
    AftFlags, TransferAmounts, TransferCode, TransferConditions, TransferData, TransferStatus,
};

/// External collaborators the engine is built from
#[derive(Clone)]
pub struct AftCollaborators {
    pub coordinator: Arc<dyn TransactionCoordinator>,
    pub host: Arc<dyn HostLink>,
    pub game: Arc<dyn GamePlay>,
    pub disables: Arc<dyn DisableMonitor>,
    pub bank: Arc<dyn Bank>,
    pub wallet: Arc<dyn WalletTransferService>,
    pub printer: Arc<dyn ReceiptPrinter>,
    pub cash_out: Arc<dyn LocalCashOut>,
}

pub struct AftEngine {
    settings: AftSettings,
    host: Arc<dyn HostLink>,
    bank: Arc<dyn Bank>,
    events: EventBus,
    context: Arc<TransferContext>,
    meters: Arc<AftMeters>,
    registration: Arc<RegistrationStateMachine>,
    lock: Arc<GameLock>,
    hard_lock: Arc<HardCashOutLock>,
    host_cashout: Arc<HostCashOutProvider>,
    off: Arc<TransferOffOrchestrator>,
    on: Arc<TransferOnOrchestrator>,
}

impl AftEngine {
    /// Build the subsystem on the current tokio runtime and restore its
    /// persisted state
    pub fn new(
        settings: AftSettings,
        store: Arc<dyn Store>,
        collaborators: AftCollaborators,
        events: EventBus,
    ) -> Result<Self, AftError> {
        let runtime = Handle::try_current().map_err(|_| AftError::RuntimeUnavailable)?;
        Self::with_runtime(settings, store, collaborators, events, runtime)
    }

    /// Build the subsystem with its timers on `runtime`
    pub fn with_runtime(
        settings: AftSettings,
        store: Arc<dyn Store>,
        collaborators: AftCollaborators,
        events: EventBus,
        runtime: Handle,
    ) -> Result<Self, AftError> {
        settings.validate()?;
        let AftCollaborators {
            coordinator,
            host,
            game,
            disables,
            bank,
            wallet,
            printer,
            cash_out,
        } = collaborators;

        let hard_lock = HardCashOutLock::new(
            &settings,
            coordinator.clone(),
            disables.clone(),
            cash_out,
            events.clone(),
        );
        let history = Arc::new(PersistedHistory::new(store.clone(), settings.history_capacity));
        let meters = Arc::new(AftMeters::new(store.clone()));
        let context = TransferContext::new(
            &settings,
            runtime.clone(),
            store.clone(),
            history,
            meters.clone(),
            host.clone(),
        )?;
        let host_cashout = HostCashOutProvider::new(
            &settings,
            runtime.clone(),
            context.clone(),
            hard_lock.clone(),
            host.clone(),
        );
        let lock = GameLock::new(
            &settings,
            runtime.clone(),
            coordinator.clone(),
            game,
            disables.clone(),
            host.clone(),
            host_cashout.clone(),
            events.clone(),
        );
        let registration =
            RegistrationStateMachine::new(&settings, runtime.clone(), store, host.clone())?;

        let deps = OrchestratorDeps {
            settings: settings.clone(),
            runtime,
            coordinator,
            lock: lock.clone(),
            context: context.clone(),
            wallet,
            printer,
            host: host.clone(),
            events: events.clone(),
        };
        let off = TransferOffOrchestrator::new(
            deps.clone(),
            OffPolicy::new(
                settings.transfer_limit,
                bank.clone(),
                disables.clone(),
                host_cashout.clone(),
                hard_lock.clone(),
            ),
        );
        let on = TransferOnOrchestrator::new(
            deps,
            OnPolicy::new(settings.transfer_limit, settings.credit_limit, bank.clone(), disables),
        );

        info!(asset_number = settings.asset_number, "AFT engine ready");
        Ok(Self {
            settings,
            host,
            bank,
            events,
            context,
            meters,
            registration,
            lock,
            hard_lock,
            host_cashout,
            off,
            on,
        })
    }

    /// Host link is up: announce capabilities, then recover
    pub fn startup(&self) {
        let transfer_in = self.settings.transfer_on_enabled || self.settings.bonus_enabled;
        self.host.set_transfer_in_enabled(transfer_in);
        self.host
            .set_transfer_out_enabled(self.settings.transfer_off_enabled);
        self.registration.on_sas_initialized();
        self.context
            .on_sas_initialized(self.off.as_ref(), self.on.as_ref());
    }

    // ------------------------------------------------------------------------
    // Transfers
    // ------------------------------------------------------------------------

    /// Host transfer command (0x72). Returns the response record.
    pub fn transfer(&self, mut request: TransferData) -> TransferData {
        let current = self.context.current();
        let same_pending =
            current.status.is_pending() && current.transaction_id == request.transaction_id;

        match request.transfer_code {
            TransferCode::Interrogation => return current,
            TransferCode::CancelRequest => {
                if same_pending {
                    let stopped = self.orchestrator_for(&current).cancel();
                    info!(transaction_id = %current.transaction_id, stopped, "Host cancel");
                } else {
                    warn!(
                        transaction_id = %request.transaction_id,
                        "Cancel does not match a pending transfer"
                    );
                }
                return self.context.current();
            }
            TransferCode::FullOnly | TransferCode::PartialAllowed => {}
        }
        if same_pending {
            return current;
        }

        if self.reject(&mut request, &current) {
            return request;
        }

        if let Err(e) = self.context.update_host_cashout_flags(&request) {
            error!(
                transaction_id = %request.transaction_id,
                error = %e,
                "Failed to store host cash-out flags"
            );
        }

        if request.transfer_type.is_transfer_off() {
            self.context.do_aft_off(request, self.off.as_ref())
        } else if request.transfer_type.is_bonus() {
            self.context.do_bonus(request, self.on.as_ref())
        } else {
            self.context.do_aft_on(request, self.on.as_ref())
        }
    }

    fn reject(&self, request: &mut TransferData, current: &TransferData) -> bool {
        let settings = &self.settings;
        let data = request.clone();
        let transfer_type = data.transfer_type;
        let off = transfer_type.is_transfer_off();
        let keyed = data.registration_key != ZERO_KEY || transfer_type.is_debit();

        let rules = [
            ErrorRule::new(TransferStatus::AssetNumberZeroOrDoesNotMatch, || {
                data.asset_number == 0 || data.asset_number != settings.asset_number
            }),
            ErrorRule::new(TransferStatus::TransactionIdNotValid, || {
                !is_transaction_id_valid(&data.transaction_id)
            }),
            ErrorRule::new(TransferStatus::NotCompatibleWithCurrentTransfer, || {
                current.status.is_pending()
            }),
            ErrorRule::new(TransferStatus::TransactionIdNotUnique, || {
                !self.context.is_transaction_id_unique(&data.transaction_id)
            }),
            ErrorRule::new(TransferStatus::GamingMachineNotRegistered, || {
                keyed && !self.registration.is_aft_registered()
            }),
            ErrorRule::new(TransferStatus::RegistrationKeyDoesNotMatch, || {
                keyed && !self.registration.key_matches(&data.registration_key)
            }),
            ErrorRule::new(TransferStatus::NoPosId, || {
                transfer_type.is_debit() && self.registration.pos_id() == 0
            }),
            ErrorRule::new(TransferStatus::NotValidTransferFunction, || {
                !self.function_enabled(&data)
            }),
            ErrorRule::new(TransferStatus::GamingMachineUnableToPerformPartial, || {
                data.partial_allowed() && !settings.partial_transfers_allowed
            }),
            ErrorRule::new(TransferStatus::NotValidTransferAmountOrExpirationDate, || {
                !off && data.requested.is_zero()
            }),
            ErrorRule::new(TransferStatus::TransferAmountExceedsGameLimit, || {
                !data.partial_allowed() && data.requested.total() > settings.transfer_limit
            }),
            ErrorRule::new(TransferStatus::GamingMachineNotLocked, || {
                data.flags.contains(AftFlags::ACCEPT_TRANSFER_ONLY_IF_LOCKED)
                    && self.lock.state() != LockState::Locked
            }),
            ErrorRule::new(
                TransferStatus::UnableToAcceptTransferDueToExistingRestrictedAmounts,
                || {
                    !off && data.requested.restricted > 0
                        && self.bank.balances().restricted > 0
                        && data.pool_id != self.context.restricted_pool_id()
                },
            ),
        ];

        let rejected = TransferContext::check_for_error_conditions(request, &rules);
        if rejected {
            warn!(
                transaction_id = %request.transaction_id,
                status = %request.status,
                "Transfer request rejected"
            );
        }
        rejected
    }

    fn function_enabled(&self, data: &TransferData) -> bool {
        let settings = &self.settings;
        let transfer_type = data.transfer_type;
        if transfer_type.is_transfer_off() {
            settings.transfer_off_enabled
        } else if transfer_type.is_bonus() {
            settings.bonus_enabled
        } else if transfer_type.is_debit() {
            settings.transfer_on_enabled && self.registration.is_debit_transfer_enabled()
        } else {
            settings.transfer_on_enabled
        }
    }

    fn orchestrator_for(&self, data: &TransferData) -> &dyn TransferOrchestrator {
        if data.transfer_type.is_transfer_off() {
            self.off.as_ref()
        } else {
            self.on.as_ref()
        }
    }

    /// Host acknowledged the completion of `transaction_id`
    pub fn acknowledge(&self, transaction_id: &str) -> bool {
        if !self.context.acknowledge(transaction_id) {
            return false;
        }
        let current = self.context.current();
        self.orchestrator_for(&current).acknowledge(transaction_id);
        true
    }

    pub fn current_transfer(&self) -> TransferData {
        self.context.current()
    }

    pub fn meters(&self) -> Result<MeterSet, AftError> {
        Ok(self.meters.snapshot()?)
    }

    pub fn transfer_off(&self) -> &Arc<TransferOffOrchestrator> {
        &self.off
    }

    pub fn transfer_on(&self) -> &Arc<TransferOnOrchestrator> {
        &self.on
    }

    /// Immediate system disable. True if a waiting transfer-off was canceled.
    pub fn on_system_disabled(&self) -> bool {
        self.off.on_system_disabled()
    }

    // ------------------------------------------------------------------------
    // Lock / Registration
    // ------------------------------------------------------------------------

    /// Host lock command (0x74); `hundredths` of a second, zero unlocks
    pub fn request_lock(&self, hundredths: u16, conditions: TransferConditions) -> LockState {
        let timeout = Duration::from_millis(u64::from(hundredths) * 10);
        self.lock.request_lock(timeout, conditions);
        self.lock.state()
    }

    pub fn lock_state(&self) -> LockState {
        self.lock.state()
    }

    /// Host registration command (0x73)
    pub fn register(
        &self,
        code: RegistrationCode,
        asset_number: u32,
        key: [u8; REGISTRATION_KEY_LEN],
        pos_id: u32,
    ) -> Result<RegistrationRecord, AftError> {
        self.registration
            .process_registration(code, asset_number, key, pos_id)
    }

    pub fn registration_state(&self) -> RegistrationState {
        self.registration.state()
    }

    pub fn is_aft_registered(&self) -> bool {
        self.registration.is_aft_registered()
    }

    // ------------------------------------------------------------------------
    // Cash-Out
    // ------------------------------------------------------------------------

    /// Machine-initiated cash-out through the host
    pub async fn host_cash_out(&self, amounts: TransferAmounts, win: bool) -> HostCashOutOutcome {
        self.host_cashout.handle_cash_out(amounts, win).await
    }

    pub fn hard_lockup_active(&self) -> bool {
        self.hard_lock.is_active()
    }

    /// Attendant key-off of the hard cash-out lockup
    pub fn key_off(&self) -> bool {
        self.hard_lock.key_off()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aft::types::TransferType;
    use crate::sim::SimRig;
    use crate::store::MemoryStore;

    const ASSET: u32 = 1001;

    fn engine(rig: &SimRig) -> AftEngine {
        let settings = AftSettings {
            asset_number: ASSET,
            transfer_limit: 100_000,
            ..AftSettings::default()
        };
        AftEngine::new(
            settings,
            Arc::new(MemoryStore::new()),
            rig.collaborators(),
            EventBus::default(),
        )
        .unwrap()
    }

    fn on_request(id: &str, cashable: u64) -> TransferData {
        let mut data = TransferData::new(
            id,
            TransferType::InHouseToGamingMachine,
            TransferCode::FullOnly,
            TransferAmounts::new(cashable, 0, 0),
        );
        data.asset_number = ASSET;
        data
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_is_not_persisted() {
        let rig = SimRig::new(TransferAmounts::ZERO);
        let engine = engine(&rig);

        let mut request = on_request("T-1", 500);
        request.asset_number = 7;
        let response = engine.transfer(request);
        assert_eq!(response.status, TransferStatus::AssetNumberZeroOrDoesNotMatch);
        assert_eq!(
            engine.current_transfer().status,
            TransferStatus::NoTransferInfoAvailable
        );
        assert_eq!(rig.wallet.request_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rule_order_asset_before_transaction_id() {
        let rig = SimRig::new(TransferAmounts::ZERO);
        let engine = engine(&rig);

        let mut request = on_request("", 500);
        request.asset_number = 0;
        assert_eq!(
            engine.transfer(request).status,
            TransferStatus::AssetNumberZeroOrDoesNotMatch
        );
        assert_eq!(
            engine.transfer(on_request("", 500)).status,
            TransferStatus::TransactionIdNotValid
        );
        assert_eq!(
            engine.transfer(on_request(&"X".repeat(21), 500)).status,
            TransferStatus::TransactionIdNotValid
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_debit_requires_registration() {
        let rig = SimRig::new(TransferAmounts::ZERO);
        let engine = engine(&rig);

        let mut request = on_request("D-1", 500);
        request.transfer_type = TransferType::DebitToGamingMachine;
        assert_eq!(
            engine.transfer(request).status,
            TransferStatus::GamingMachineNotRegistered
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_only_over_limit_and_only_if_locked() {
        let rig = SimRig::new(TransferAmounts::ZERO);
        let engine = engine(&rig);

        assert_eq!(
            engine.transfer(on_request("L-1", 100_001)).status,
            TransferStatus::TransferAmountExceedsGameLimit
        );

        let mut request = on_request("L-2", 500);
        request.flags = AftFlags::ACCEPT_TRANSFER_ONLY_IF_LOCKED;
        assert_eq!(
            engine.transfer(request).status,
            TransferStatus::GamingMachineNotLocked
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_transfer_blocks_other_ids() {
        let rig = SimRig::new(TransferAmounts::ZERO);
        let engine = engine(&rig);

        let response = engine.transfer(on_request("P-1", 500));
        assert_eq!(response.status, TransferStatus::TransferPending);

        // a retry of the same id reports the pending transfer
        assert_eq!(
            engine.transfer(on_request("P-1", 500)).status,
            TransferStatus::TransferPending
        );
        assert_eq!(
            engine.transfer(on_request("P-2", 500)).status,
            TransferStatus::NotCompatibleWithCurrentTransfer
        );
        assert_eq!(rig.wallet.request_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_id_after_completion_is_not_unique() {
        let rig = SimRig::new(TransferAmounts::ZERO);
        let engine = engine(&rig);

        engine.transfer(on_request("U-1", 500));
        assert!(rig.wallet.process_next(engine.transfer_on().as_ref(), &rig.bank));
        assert_eq!(
            engine.current_transfer().status,
            TransferStatus::FullTransferSuccessful
        );
        assert!(engine.acknowledge("U-1"));
        assert_eq!(rig.wallet.acknowledged(), vec!["U-1".to_string()]);

        assert_eq!(
            engine.transfer(on_request("U-1", 500)).status,
            TransferStatus::TransactionIdNotUnique
        );
        let mut interrogation = on_request("U-1", 0);
        interrogation.transfer_code = TransferCode::Interrogation;
        assert_eq!(
            engine.transfer(interrogation).status,
            TransferStatus::FullTransferSuccessful
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_lock_in_hundredths() {
        let rig = SimRig::new(TransferAmounts::ZERO);
        let engine = engine(&rig);

        assert_eq!(
            engine.request_lock(500, TransferConditions::TRANSFER_TO_GAMING_MACHINE_OK),
            LockState::LockPending
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(engine.lock_state(), LockState::Locked);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(engine.lock_state(), LockState::NotLocked);
    }

    #[test]
    fn test_new_without_runtime_fails() {
        let rig = SimRig::new(TransferAmounts::ZERO);
        let result = AftEngine::new(
            AftSettings::default(),
            Arc::new(MemoryStore::new()),
            rig.collaborators(),
            EventBus::default(),
        );
        assert!(matches!(result, Err(AftError::RuntimeUnavailable)));
    }

    #[test]
    fn test_commands_from_thread_outside_runtime() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let rig = SimRig::new(TransferAmounts::ZERO);
        let engine = AftEngine::with_runtime(
            AftSettings {
                asset_number: ASSET,
                transfer_limit: 100_000,
                ..AftSettings::default()
            },
            Arc::new(MemoryStore::new()),
            rig.collaborators(),
            EventBus::default(),
            runtime.handle().clone(),
        )
        .unwrap();
        engine.startup();

        // 0.1s lock, requested from this plain thread
        engine.request_lock(10, TransferConditions::TRANSFER_TO_GAMING_MACHINE_OK);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(engine.lock_state(), LockState::Locked);
        std::thread::sleep(Duration::from_millis(500));
        assert_eq!(engine.lock_state(), LockState::NotLocked);

        drop(engine);
        runtime.shutdown_background();
    }
}
