//! AFT Registration State Machine
//!
//! Tracks whether the host has registered this machine for AFT. Independent
//! of transfers except that debit transfers require a registration.
//!
//! Exactly these edges:
//! - Ready -> Registered | Pending | NotRegistered
//! - Registered -> Ready | NotRegistered
//! - Pending -> Ready | NotRegistered
//! - NotRegistered -> Ready (re-entered on Register / RequestAck)

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::config::AftSettings;
use crate::store::{Persisted, Store};

use super::error::AftError;
use super::notifier::ExceptionNotifier;
use super::ports::HostLink;
use super::types::HostException;

pub const REGISTRATION_KEY_LEN: usize = 20;
pub const ZERO_KEY: [u8; REGISTRATION_KEY_LEN] = [0; REGISTRATION_KEY_LEN];

/// POS id value meaning "keep the stored one"
pub const POS_ID_NO_CHANGE: u32 = u32::MAX;

const REGISTRATION_KEY: &str = "aft.registration";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum RegistrationState {
    Ready = 0x00,
    Registered = 0x01,
    Pending = 0x40,
    #[default]
    NotRegistered = 0x80,
}

impl RegistrationState {
    pub fn can_transition_to(&self, next: RegistrationState) -> bool {
        use RegistrationState::*;
        matches!(
            (self, next),
            (Ready, Registered)
                | (Ready, Pending)
                | (Ready, NotRegistered)
                | (Registered, Ready)
                | (Registered, NotRegistered)
                | (Pending, Ready)
                | (Pending, NotRegistered)
                | (NotRegistered, Ready)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RegistrationCode {
    Initialize = 0x00,
    Register = 0x01,
    RequestAck = 0x40,
    Unregister = 0x80,
    ReadCurrent = 0xFF,
}

impl RegistrationCode {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x00 => Some(RegistrationCode::Initialize),
            0x01 => Some(RegistrationCode::Register),
            0x40 => Some(RegistrationCode::RequestAck),
            0x80 => Some(RegistrationCode::Unregister),
            0xFF => Some(RegistrationCode::ReadCurrent),
            _ => None,
        }
    }

    /// State the code drives towards
    fn target(&self) -> Option<RegistrationState> {
        match self {
            RegistrationCode::Initialize => Some(RegistrationState::Ready),
            RegistrationCode::Register => Some(RegistrationState::Registered),
            RegistrationCode::RequestAck => Some(RegistrationState::Pending),
            RegistrationCode::Unregister => Some(RegistrationState::NotRegistered),
            RegistrationCode::ReadCurrent => None,
        }
    }

    fn checks_asset_number(&self) -> bool {
        matches!(
            self,
            RegistrationCode::Initialize | RegistrationCode::Register | RegistrationCode::RequestAck
        )
    }
}

/// Persisted registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RegistrationRecord {
    pub key: [u8; REGISTRATION_KEY_LEN],
    pub pos_id: u32,
    pub status: RegistrationState,
}

pub struct RegistrationStateMachine {
    asset_number: u32,
    debit_transfers_allowed: bool,
    host: Arc<dyn HostLink>,
    persisted: Persisted<RegistrationRecord>,
    inner: Mutex<RegistrationRecord>,
    pending_notifier: ExceptionNotifier,
}

impl RegistrationStateMachine {
    /// Restore the last persisted registration
    pub fn new(
        settings: &AftSettings,
        runtime: Handle,
        store: Arc<dyn Store>,
        host: Arc<dyn HostLink>,
    ) -> Result<Arc<Self>, AftError> {
        let persisted = Persisted::<RegistrationRecord>::new(store, REGISTRATION_KEY);
        let record = persisted.get()?;
        info!(
            status = ?record.status,
            pos_id = record.pos_id,
            "Registration restored"
        );

        let interval = settings.registration_exception_interval();
        Ok(Arc::new_cyclic(|weak: &Weak<RegistrationStateMachine>| {
            let report_host = host.clone();
            let active = weak.clone();
            RegistrationStateMachine {
                asset_number: settings.asset_number,
                debit_transfers_allowed: settings.debit_transfers_allowed,
                host,
                persisted,
                inner: Mutex::new(record),
                pending_notifier: ExceptionNotifier::new(
                    "registration_pending",
                    runtime,
                    move || report_host.report_exception(HostException::AftRequestToRegister),
                    move || {
                        active
                            .upgrade()
                            .is_some_and(|r| r.state() == RegistrationState::Pending)
                    },
                    interval,
                ),
            }
        }))
    }

    pub fn state(&self) -> RegistrationState {
        self.inner.lock().status
    }

    pub fn record(&self) -> RegistrationRecord {
        *self.inner.lock()
    }

    pub fn pos_id(&self) -> u32 {
        self.inner.lock().pos_id
    }

    pub fn key_matches(&self, key: &[u8; REGISTRATION_KEY_LEN]) -> bool {
        self.inner.lock().key == *key
    }

    pub fn is_aft_registered(&self) -> bool {
        let inner = self.inner.lock();
        inner.status == RegistrationState::Registered
            && self.asset_number != 0
            && inner.key != ZERO_KEY
    }

    pub fn is_debit_transfer_enabled(&self) -> bool {
        self.is_aft_registered() && self.debit_transfers_allowed && self.pos_id() != 0
    }

    /// Apply a host registration command and return the resulting record.
    ///
    /// The record is persisted before any entry action reaches the host.
    pub fn process_registration(
        &self,
        code: RegistrationCode,
        asset_number: u32,
        key: [u8; REGISTRATION_KEY_LEN],
        pos_id: u32,
    ) -> Result<RegistrationRecord, AftError> {
        let Some(target) = code.target() else {
            return Ok(self.record());
        };

        let (previous, next, reentry) = {
            let mut inner = self.inner.lock();
            let mut next = *inner;

            let asset_mismatch = asset_number == 0 || asset_number != self.asset_number;
            let requested = if code.checks_asset_number() && asset_mismatch {
                warn!(asset_number, configured = self.asset_number, ?code, "Asset number mismatch");
                RegistrationState::NotRegistered
            } else {
                match code {
                    RegistrationCode::Initialize => {
                        if key == ZERO_KEY {
                            next.key = ZERO_KEY;
                        }
                        if pos_id == 0 {
                            next.pos_id = 0;
                        }
                        target
                    }
                    RegistrationCode::Register if key == ZERO_KEY => {
                        warn!("Register with zero key");
                        RegistrationState::NotRegistered
                    }
                    RegistrationCode::Register => {
                        next.key = key;
                        if pos_id != POS_ID_NO_CHANGE {
                            next.pos_id = pos_id;
                        }
                        target
                    }
                    _ => target,
                }
            };

            let reentry = inner.status == RegistrationState::NotRegistered
                && matches!(code, RegistrationCode::Register | RegistrationCode::RequestAck);
            if reentry {
                next.status = RegistrationState::NotRegistered;
            } else if inner.status.can_transition_to(requested) {
                next.status = requested;
            } else if inner.status != requested {
                debug!(
                    from = ?inner.status,
                    to = ?requested,
                    "Registration transition not permitted"
                );
            }

            self.persisted.save(&next, None)?;
            let previous = inner.status;
            *inner = next;
            (previous, next, reentry)
        };

        let entered = previous != next.status || reentry;
        info!(
            ?code,
            from = ?previous,
            to = ?next.status,
            pos_id = next.pos_id,
            key = %hex::encode(next.key),
            "Registration processed"
        );

        if previous == RegistrationState::Pending && next.status != RegistrationState::Pending {
            self.pending_notifier.stop();
        }
        if entered {
            self.on_enter(next.status);
        }
        Ok(next)
    }

    /// Resume the acknowledgement request after a restart
    pub fn on_sas_initialized(&self) {
        if self.state() == RegistrationState::Pending {
            self.pending_notifier.start(true);
        }
    }

    fn on_enter(&self, state: RegistrationState) {
        match state {
            RegistrationState::Pending => self.pending_notifier.start(true),
            RegistrationState::NotRegistered => self
                .host
                .report_exception(HostException::AftRegistrationCanceled),
            RegistrationState::Registered => self
                .host
                .report_exception(HostException::AftRegistrationAcknowledged),
            RegistrationState::Ready => {}
        }
    }
}
