//! Transfer Context
//!
//! Owns the canonical "current transfer" record. Every mutation is durably
//! persisted before the host can observe it: a request is persisted as
//! pending before an orchestrator is invoked, and success or failure is
//! persisted before it is reported.
//!
//! # Persisted Record
//!
//! ```text
//! TransferOptions {
//!     current_transfer:      bincode(TransferData)
//!     acknowledged:          host acknowledged the last completion
//!     current_flags:         host cash-out flag bits
//!     restricted_expiration: expiration of restricted credits on the machine
//!     restricted_pool_id:    pool of restricted credits on the machine
//! }
//! ```

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

use crate::config::AftSettings;
use crate::store::{Persisted, Store, StoreError, UnitOfWork};

use super::error::AftError;
use super::history::{HistoryIndex, TransferHistory, TransferHistoryEntry};
use super::meters::{AftMeters, MeterCategory};
use super::notifier::ExceptionNotifier;
use super::orchestrator::TransferOrchestrator;
use super::ports::HostLink;
use super::types::{
    AftFlags, HostException, MAX_TRANSACTION_ID_LEN, ReceiptStatus, RestrictedExpiration,
    TransferAmounts, TransferData, TransferStatus, today,
};

const OPTIONS_KEY: &str = "aft.transfer_options";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferOptions {
    pub current_transfer: Vec<u8>,
    pub acknowledged: bool,
    pub current_flags: u8,
    pub restricted_expiration: RestrictedExpiration,
    pub restricted_pool_id: u16,
}

/// Valid ids are 1..=20 characters with no control characters
pub fn is_transaction_id_valid(id: &str) -> bool {
    let len = id.chars().count();
    (1..=MAX_TRANSACTION_ID_LEN).contains(&len) && !id.chars().any(char::is_control)
}

/// One entry of an ordered rejection list
pub struct ErrorRule<'a> {
    check: Box<dyn Fn() -> bool + 'a>,
    status: TransferStatus,
}

impl<'a> ErrorRule<'a> {
    pub fn new(status: TransferStatus, check: impl Fn() -> bool + 'a) -> Self {
        Self {
            check: Box::new(check),
            status,
        }
    }
}

#[derive(Debug, Clone)]
struct ContextInner {
    current: TransferData,
    acknowledged: bool,
    host_cashout_flags: AftFlags,
    restricted_expiration: RestrictedExpiration,
    restricted_pool_id: u16,
}

impl ContextInner {
    fn to_options(&self) -> Result<TransferOptions, StoreError> {
        let current_transfer =
            bincode::serialize(&self.current).map_err(|e| StoreError::Codec {
                key: OPTIONS_KEY.to_string(),
                reason: e.to_string(),
            })?;
        Ok(TransferOptions {
            current_transfer,
            acknowledged: self.acknowledged,
            current_flags: self.host_cashout_flags.0,
            restricted_expiration: self.restricted_expiration,
            restricted_pool_id: self.restricted_pool_id,
        })
    }

    fn from_options(options: TransferOptions) -> Result<Self, AftError> {
        let current = if options.current_transfer.is_empty() {
            TransferData::default()
        } else {
            bincode::deserialize(&options.current_transfer)
                .map_err(|e| AftError::RecordDecode(e.to_string()))?
        };
        Ok(Self {
            current,
            acknowledged: options.acknowledged,
            host_cashout_flags: AftFlags(options.current_flags),
            restricted_expiration: options.restricted_expiration,
            restricted_pool_id: options.restricted_pool_id,
        })
    }

    fn completion_outstanding(&self) -> bool {
        !self.acknowledged && self.current.status.is_terminal()
    }
}

pub struct TransferContext {
    store: Arc<dyn Store>,
    options: Persisted<TransferOptions>,
    history: Arc<dyn TransferHistory>,
    meters: Arc<AftMeters>,
    host: Arc<dyn HostLink>,
    inner: Mutex<ContextInner>,
    completion_notifier: ExceptionNotifier,
}

impl TransferContext {
    /// Restore the current transfer from the store
    pub fn new(
        settings: &AftSettings,
        runtime: Handle,
        store: Arc<dyn Store>,
        history: Arc<dyn TransferHistory>,
        meters: Arc<AftMeters>,
        host: Arc<dyn HostLink>,
    ) -> Result<Arc<Self>, AftError> {
        let options = Persisted::<TransferOptions>::new(store.clone(), OPTIONS_KEY);
        let inner = ContextInner::from_options(options.get()?)?;
        info!(
            transaction_id = %inner.current.transaction_id,
            status = %inner.current.status,
            acknowledged = inner.acknowledged,
            "Transfer context restored"
        );

        let interval = settings.completion_exception_interval();
        Ok(Arc::new_cyclic(|weak: &Weak<TransferContext>| {
            let report_host = host.clone();
            let active = weak.clone();
            TransferContext {
                store,
                options,
                history,
                meters,
                host,
                inner: Mutex::new(inner),
                completion_notifier: ExceptionNotifier::new(
                    "transfer_complete",
                    runtime,
                    move || report_host.report_exception(HostException::AftTransferComplete),
                    move || {
                        active
                            .upgrade()
                            .is_some_and(|ctx| ctx.inner.lock().completion_outstanding())
                    },
                    interval,
                ),
            }
        }))
    }

    /// Snapshot of the current transfer
    pub fn current(&self) -> TransferData {
        self.inner.lock().current.clone()
    }

    pub fn is_acknowledged(&self) -> bool {
        self.inner.lock().acknowledged
    }

    pub fn has_pending_transfer(&self) -> bool {
        self.inner.lock().current.status.is_pending()
    }

    pub fn host_cashout_flags(&self) -> AftFlags {
        self.inner.lock().host_cashout_flags
    }

    pub fn restricted_expiration(&self) -> RestrictedExpiration {
        self.inner.lock().restricted_expiration
    }

    pub fn restricted_pool_id(&self) -> u16 {
        self.inner.lock().restricted_pool_id
    }

    pub fn completion_notifier_armed(&self) -> bool {
        self.completion_notifier.is_armed()
    }

    /// Differs from the most recent completed non-zero transfer
    pub fn is_transaction_id_unique(&self, id: &str) -> bool {
        self.history
            .get_entry(HistoryIndex::MostRecent)
            .is_none_or(|entry| entry.transaction_id != id)
    }

    /// First matching rule sets its status on `data`. Returns true if one matched.
    pub fn check_for_error_conditions(data: &mut TransferData, rules: &[ErrorRule<'_>]) -> bool {
        match rules.iter().find(|rule| (rule.check)()) {
            Some(rule) => {
                debug!(
                    transaction_id = %data.transaction_id,
                    status = %rule.status,
                    "Transfer rejected"
                );
                data.status = rule.status;
                true
            }
            None => false,
        }
    }

    /// Take the host cash-out bits from `request` when it asks for it.
    /// Returns true if the stored flags changed.
    pub fn update_host_cashout_flags(&self, request: &TransferData) -> Result<bool, AftError> {
        let controlled = request.flags.contains(AftFlags::HOST_CASHOUT_ENABLE_CONTROL);
        if !controlled || request.status.is_failure() {
            return Ok(false);
        }
        let requested = request.flags.host_cashout_bits();

        let mut inner = self.inner.lock();
        if inner.host_cashout_flags == requested {
            return Ok(false);
        }
        let previous = inner.host_cashout_flags;
        inner.host_cashout_flags = requested;
        if let Err(e) = self.persist(&inner) {
            inner.host_cashout_flags = previous;
            return Err(e.into());
        }
        info!(from = previous.0, to = requested.0, "Host cash-out flags updated");
        Ok(true)
    }

    pub fn do_aft_off(
        &self,
        data: TransferData,
        orchestrator: &dyn TransferOrchestrator,
    ) -> TransferData {
        debug_assert!(data.transfer_type.is_transfer_off());
        self.start_transfer(data, orchestrator)
    }

    pub fn do_aft_on(
        &self,
        data: TransferData,
        orchestrator: &dyn TransferOrchestrator,
    ) -> TransferData {
        debug_assert!(!data.transfer_type.is_transfer_off());
        self.start_transfer(data, orchestrator)
    }

    pub fn do_bonus(
        &self,
        data: TransferData,
        orchestrator: &dyn TransferOrchestrator,
    ) -> TransferData {
        debug_assert!(data.transfer_type.is_bonus());
        self.start_transfer(data, orchestrator)
    }

    fn start_transfer(
        &self,
        mut data: TransferData,
        orchestrator: &dyn TransferOrchestrator,
    ) -> TransferData {
        data.status = TransferStatus::TransferPending;
        data.transferred = TransferAmounts::ZERO;
        data.transaction_date = None;
        data.receipt_status = if data.receipt_requested() {
            ReceiptStatus::ReceiptPending
        } else {
            ReceiptStatus::NoReceiptRequested
        };

        {
            let mut inner = self.inner.lock();
            let previous = inner.clone();
            inner.current = data.clone();
            inner.acknowledged = false;
            if let Err(e) = self.persist(&inner) {
                error!(
                    transaction_id = %data.transaction_id,
                    error = %e,
                    "Failed to persist transfer request"
                );
                *inner = previous;
                data.status = TransferStatus::UnexpectedError;
                return data;
            }
        }
        self.completion_notifier.stop();

        info!(
            transaction_id = %data.transaction_id,
            transfer_type = ?data.transfer_type,
            requested = %data.requested,
            "Transfer pending"
        );

        if !orchestrator.request(&data, data.partial_allowed()) {
            warn!(transaction_id = %data.transaction_id, "Transfer refused by orchestrator");
            let refused =
                self.transfer_failed(TransferStatus::GamingMachineUnableToPerformTransfer);
            if let Err(e) = refused {
                error!(
                    transaction_id = %data.transaction_id,
                    error = %e,
                    "Failed to record refusal"
                );
            }
        }
        self.current()
    }

    /// Fail the pending transfer: persist, report, arm the completion notifier
    pub fn transfer_failed(&self, status: TransferStatus) -> Result<TransferData, AftError> {
        let data = {
            let mut inner = self.inner.lock();
            if !inner.current.status.is_pending() {
                return Err(AftError::InvalidStateTransition(format!(
                    "{} -> {}",
                    inner.current.status, status
                )));
            }
            let previous = inner.clone();
            let current = &mut inner.current;
            current.status = status;
            current.transferred = TransferAmounts::ZERO;
            current.transaction_date = Some(Utc::now());
            if current.receipt_status == ReceiptStatus::ReceiptPending {
                current.receipt_status = ReceiptStatus::NoReceiptRequested;
            }
            inner.acknowledged = false;
            if let Err(e) = self.persist(&inner) {
                *inner = previous;
                return Err(e.into());
            }
            inner.current.clone()
        };

        warn!(transaction_id = %data.transaction_id, status = %status, "Transfer failed");
        self.host.transfer_failed(&data, status);
        self.completion_notifier.start(true);
        Ok(data)
    }

    /// Record a successful money movement. Transfer record, meters and
    /// history commit in one unit of work before the host hears about it.
    pub fn update_final_aft_response_data(
        &self,
        transferred: TransferAmounts,
        receipt_status: ReceiptStatus,
    ) -> Result<TransferData, AftError> {
        let data = {
            let mut inner = self.inner.lock();
            if !inner.current.status.is_pending() {
                return Err(AftError::InvalidStateTransition(format!(
                    "{} -> complete",
                    inner.current.status
                )));
            }

            let mut staged = inner.clone();
            let current = &mut staged.current;
            current.transferred = transferred;
            current.status = if transferred == current.requested {
                TransferStatus::FullTransferSuccessful
            } else {
                TransferStatus::PartialTransferSuccessful
            };
            current.receipt_status = receipt_status;
            current.transaction_date = Some(Utc::now());
            if transferred.restricted > 0 && !current.transfer_type.is_transfer_off() {
                let expiration = staged
                    .restricted_expiration
                    .higher_priority(current.expiration, today());
                current.expiration = expiration;
                staged.restricted_expiration = expiration;
                staged.restricted_pool_id = current.pool_id;
            }
            staged.acknowledged = false;

            let mut work = UnitOfWork::new();
            if !transferred.is_zero() {
                let category = MeterCategory::for_transfer(staged.current.transfer_type);
                self.meters.accumulate(category, &transferred, &mut work)?;
                self.history
                    .add_entry(TransferHistoryEntry::from(&staged.current), &mut work)?;
            }
            self.options.save(&staged.to_options()?, Some(&mut work))?;
            self.store.commit(work)?;

            *inner = staged;
            inner.current.clone()
        };

        info!(
            transaction_id = %data.transaction_id,
            status = %data.status,
            transferred = %data.transferred,
            "Transfer complete"
        );
        self.host.transfer_completed(&data);
        self.completion_notifier.start(true);
        Ok(data)
    }

    /// Host acknowledged the completion of `transaction_id`
    pub fn acknowledge(&self, transaction_id: &str) -> bool {
        {
            let mut inner = self.inner.lock();
            let current = &inner.current;
            if current.transaction_id != transaction_id || !current.status.is_terminal() {
                debug!(transaction_id, "Acknowledge does not match a completed transfer");
                return false;
            }
            if inner.acknowledged {
                return true;
            }
            inner.acknowledged = true;
            if let Err(e) = self.persist(&inner) {
                error!(transaction_id, error = %e, "Failed to persist acknowledgement");
                inner.acknowledged = false;
                return false;
            }
        }
        self.completion_notifier.stop();
        info!(transaction_id, "Transfer acknowledged");
        true
    }

    /// Crash recovery once the host link is up again
    pub fn on_sas_initialized(
        &self,
        off: &dyn TransferOrchestrator,
        on: &dyn TransferOrchestrator,
    ) {
        let (data, acknowledged) = {
            let inner = self.inner.lock();
            (inner.current.clone(), inner.acknowledged)
        };
        if acknowledged {
            return;
        }

        if data.status.is_pending() {
            let orchestrator = if data.transfer_type.is_transfer_off() { off } else { on };
            info!(transaction_id = %data.transaction_id, "Recovering interrupted transfer");
            if !orchestrator.recover(&data.transaction_id) {
                warn!(transaction_id = %data.transaction_id, "Recovery failed, failing transfer");
                let failed =
                    self.transfer_failed(TransferStatus::GamingMachineUnableToPerformTransfer);
                if let Err(e) = failed {
                    error!(
                        transaction_id = %data.transaction_id,
                        error = %e,
                        "Failed to record recovery failure"
                    );
                }
            }
        } else if data.status.is_terminal() {
            debug!(
                transaction_id = %data.transaction_id,
                "Re-announcing unacknowledged completion"
            );
            self.completion_notifier.start(true);
        }
    }

    fn persist(&self, inner: &ContextInner) -> Result<(), StoreError> {
        self.options.save(&inner.to_options()?, None)
    }
}
