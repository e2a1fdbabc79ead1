//! Game Lock State Machine
//!
//! Suspends game play and holds the exclusive transaction while the host
//! negotiates a transfer.
//!
//! ```text
//! NotLocked ──request_lock──▶ LockPending ──handle acquired──▶ Locked
//!     ▲                            │                             │
//!     └──── unlock / timeout / acquisition failure ◀─────────────┘
//! ```
//!
//! All fields sit behind one mutex. Anything that can call back into another
//! component (host notification, listeners, the coordinator) runs after the
//! mutex is released.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::AftSettings;
use crate::coordinator::{
    RequestorId, TransactionCoordinator, TransactionGrant, TransactionHandle, TransactionKind,
    TransactionRequestor,
};
use crate::events::{AftEvent, EventBus};

use super::notifier::ExceptionNotifier;
use super::ports::{DisableMonitor, GamePlay, HostLink};
use super::types::{HostException, TransferConditions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum LockState {
    #[default]
    NotLocked,
    LockPending,
    Locked,
}

impl LockState {
    /// Whether `self -> next` is an edge of the lock cycle
    pub fn can_transition_to(&self, next: LockState) -> bool {
        matches!(
            (self, next),
            (LockState::NotLocked, LockState::LockPending)
                | (LockState::LockPending, LockState::Locked)
                | (LockState::LockPending, LockState::NotLocked)
                | (LockState::Locked, LockState::NotLocked)
        )
    }
}

/// Lets a pending host cash-out lock the game even when play is not idle
pub trait LockOverride: Send + Sync {
    fn host_cashout_in_progress(&self) -> bool;
}

/// Told when the lock reaches `Locked`; called outside the lock's mutex
pub trait LockListener: Send + Sync {
    fn on_game_locked(&self);
}

#[derive(Default)]
struct LockInner {
    state: LockState,
    timeout: Duration,
    conditions: TransferConditions,
    handle: Option<TransactionHandle>,
    timer: Option<JoinHandle<()>>,
    paused_autoplay: bool,
    /// The handle went to a transfer; the transfer ends the lock
    handed_off: bool,
    generation: u64,
}

pub struct GameLock {
    id: RequestorId,
    weak_self: Weak<GameLock>,
    runtime: Handle,
    coordinator: Arc<dyn TransactionCoordinator>,
    game: Arc<dyn GamePlay>,
    disables: Arc<dyn DisableMonitor>,
    host: Arc<dyn HostLink>,
    lock_override: Arc<dyn LockOverride>,
    events: EventBus,
    inner: Mutex<LockInner>,
    notifier: ExceptionNotifier,
    listeners: Mutex<Vec<Weak<dyn LockListener>>>,
}

impl GameLock {
    pub fn new(
        settings: &AftSettings,
        runtime: Handle,
        coordinator: Arc<dyn TransactionCoordinator>,
        game: Arc<dyn GamePlay>,
        disables: Arc<dyn DisableMonitor>,
        host: Arc<dyn HostLink>,
        lock_override: Arc<dyn LockOverride>,
        events: EventBus,
    ) -> Arc<Self> {
        let interval = settings.lock_exception_interval();
        Arc::new_cyclic(|weak: &Weak<GameLock>| {
            let report_host = host.clone();
            let active = weak.clone();
            GameLock {
                id: RequestorId::new(),
                weak_self: weak.clone(),
                runtime: runtime.clone(),
                coordinator,
                game,
                disables,
                host,
                lock_override,
                events,
                inner: Mutex::new(LockInner::default()),
                notifier: ExceptionNotifier::new(
                    "game_locked",
                    runtime,
                    move || report_host.report_exception(HostException::GameLocked),
                    move || {
                        active
                            .upgrade()
                            .is_some_and(|lock| lock.state() == LockState::Locked)
                    },
                    interval,
                ),
                listeners: Mutex::new(Vec::new()),
            }
        })
    }

    pub fn state(&self) -> LockState {
        self.inner.lock().state
    }

    pub fn conditions(&self) -> TransferConditions {
        self.inner.lock().conditions
    }

    pub fn timeout(&self) -> Duration {
        self.inner.lock().timeout
    }

    /// A lock negotiation is in flight (no handle yet)
    pub fn is_pending(&self) -> bool {
        self.state() == LockState::LockPending
    }

    /// Whether the lock currently owns a transaction handle
    pub fn holds_handle(&self) -> bool {
        self.inner.lock().handle.is_some()
    }

    pub fn add_listener(&self, listener: Weak<dyn LockListener>) {
        self.listeners.lock().push(listener);
    }

    /// Lock may be taken: not disabled and (idle or bonus award ok), or a
    /// host cash-out is driving the lock
    pub fn can_lock(&self, conditions: TransferConditions) -> bool {
        (!self.disables.is_immediately_disabled()
            && (self.game.is_idle() || conditions.bonus_award_ok()))
            || self.lock_override.host_cashout_in_progress()
    }

    /// Host lock request. A zero timeout is an unlock request.
    pub fn request_lock(&self, timeout: Duration, conditions: TransferConditions) {
        if timeout.is_zero() {
            self.request_unlock();
            return;
        }

        let (generation, pause) = {
            let mut inner = self.inner.lock();
            let current = inner.state;
            match current {
                LockState::LockPending => {
                    warn!("Lock request ignored, a lock is already pending");
                    return;
                }
                LockState::Locked => {
                    inner.timeout = timeout;
                    inner.conditions = conditions;
                    if !inner.handed_off {
                        self.arm_timer(&mut inner);
                    }
                    let handed_off = inner.handed_off;
                    drop(inner);
                    debug!(timeout_ms = timeout.as_millis() as u64, handed_off, "Lock refreshed");
                    self.host.lock_completed();
                    return;
                }
                LockState::NotLocked => {}
            }

            inner.state = LockState::LockPending;
            inner.timeout = timeout;
            inner.conditions = conditions;
            inner.generation += 1;
            let pause = self.game.is_autoplay_active();
            inner.paused_autoplay = pause;
            self.arm_timer(&mut inner);
            (inner.generation, pause)
        };

        info!(
            timeout_ms = timeout.as_millis() as u64,
            conditions = conditions.0,
            "Game lock pending"
        );
        if pause {
            self.game.pause_autoplay();
        }
        self.events.publish(AftEvent::LockStateChanged(LockState::LockPending));

        let weak = self.weak_self.clone();
        self.runtime.spawn(async move {
            if let Some(lock) = weak.upgrade() {
                lock.try_acquire(generation);
            }
        });
    }

    /// Leave any lock state. Safe to call when already unlocked.
    pub fn request_unlock(&self) {
        let (handle, resume, previous) = {
            let mut inner = self.inner.lock();
            if inner.state == LockState::NotLocked {
                debug!("Unlock requested while not locked");
                return;
            }
            if let Some(timer) = inner.timer.take() {
                timer.abort();
            }
            let previous = inner.state;
            inner.state = LockState::NotLocked;
            inner.conditions = TransferConditions::NONE;
            inner.handed_off = false;
            let resume = std::mem::take(&mut inner.paused_autoplay);
            (inner.handle.take(), resume, previous)
        };

        info!(from = ?previous, "Game unlocked");
        if resume {
            self.game.resume_autoplay();
        }
        match handle {
            Some(handle) => {
                self.coordinator.release(handle);
            }
            None => self.coordinator.abandon_all(self.id),
        }
        self.notifier.stop();
        self.game.set_funds_transferring(false);
        self.events.publish(AftEvent::LockStateChanged(LockState::NotLocked));
    }

    /// Hand the lock's handle to a transfer orchestrator. The lock stays
    /// `Locked` but its timeout no longer applies, host refreshes included;
    /// the orchestrator ends the lock when the transfer finishes.
    pub fn take_handle(&self) -> Option<TransactionHandle> {
        let mut inner = self.inner.lock();
        if inner.state != LockState::Locked {
            return None;
        }
        let handle = inner.handle.take();
        if handle.is_some() {
            inner.handed_off = true;
            if let Some(timer) = inner.timer.take() {
                timer.abort();
            }
        }
        handle
    }

    fn try_acquire(&self, generation: u64) {
        let (conditions, timeout) = {
            let inner = self.inner.lock();
            if inner.state != LockState::LockPending || inner.generation != generation {
                return;
            }
            (inner.conditions, inner.timeout)
        };

        if !self.can_lock(conditions) {
            info!("Lock conditions not met, lock abandoned");
            self.abandon_pending(generation);
            return;
        }

        let Some(requestor) = self.weak_self.upgrade() else {
            return;
        };
        match self
            .coordinator
            .request(requestor, Some(timeout), TransactionKind::Write)
        {
            TransactionGrant::Granted(handle) => self.on_handle_acquired(handle),
            TransactionGrant::Pending => debug!("Lock waiting for transaction"),
            TransactionGrant::Denied => {
                warn!("Transaction denied, lock abandoned");
                self.abandon_pending(generation);
            }
        }
    }

    fn abandon_pending(&self, generation: u64) {
        let resume = {
            let mut inner = self.inner.lock();
            if inner.state != LockState::LockPending || inner.generation != generation {
                return;
            }
            if let Some(timer) = inner.timer.take() {
                timer.abort();
            }
            inner.state = LockState::NotLocked;
            inner.conditions = TransferConditions::NONE;
            std::mem::take(&mut inner.paused_autoplay)
        };
        if resume {
            self.game.resume_autoplay();
        }
        self.coordinator.abandon_all(self.id);
        self.events.publish(AftEvent::LockStateChanged(LockState::NotLocked));
    }

    fn on_handle_acquired(&self, handle: TransactionHandle) {
        {
            let mut inner = self.inner.lock();
            if inner.state != LockState::LockPending {
                drop(inner);
                warn!(handle = %handle, "Handle arrived after lock was abandoned, releasing");
                self.coordinator.release(handle);
                return;
            }
            inner.state = LockState::Locked;
            inner.handle = Some(handle);
            inner.handed_off = false;
            self.arm_timer(&mut inner);
        }

        info!(handle = %handle, "Game locked");
        self.notifier.start(true);
        self.events.publish(AftEvent::LockStateChanged(LockState::Locked));
        self.game.set_funds_transferring(true);
        self.host.lock_completed();

        let listeners: Vec<_> = {
            let mut listeners = self.listeners.lock();
            listeners.retain(|l| l.strong_count() > 0);
            listeners.iter().filter_map(Weak::upgrade).collect()
        };
        for listener in listeners {
            listener.on_game_locked();
        }
    }

    fn arm_timer(&self, inner: &mut LockInner) {
        if let Some(timer) = inner.timer.take() {
            timer.abort();
        }
        let weak = self.weak_self.clone();
        let timeout = inner.timeout;
        let generation = inner.generation;
        inner.timer = Some(self.runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(lock) = weak.upgrade() {
                lock.on_timeout(generation);
            }
        }));
    }

    fn on_timeout(&self, generation: u64) {
        {
            let mut inner = self.inner.lock();
            if inner.generation != generation || inner.state == LockState::NotLocked {
                return;
            }
            // Running inside the timer task; drop the handle instead of aborting ourselves.
            inner.timer = None;
        }
        info!("Game lock timed out");
        self.request_unlock();
    }
}

impl TransactionRequestor for GameLock {
    fn requestor_id(&self) -> RequestorId {
        self.id
    }

    fn notify_transaction_ready(&self, handle: TransactionHandle) {
        self.on_handle_acquired(handle);
    }
}
