//! Host Cash-Out Provider
//!
//! Machine-initiated cash-out through the host: raise the host cash-out
//! exception, wait a bounded time for the host to pull the credits with a
//! transfer-off, and in hard mode fall back to the [`HardCashOutLock`].

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::config::AftSettings;

use super::context::TransferContext;
use super::hard_cashout::HardCashOutLock;
use super::lock::LockOverride;
use super::notifier::ExceptionNotifier;
use super::ports::HostLink;
use super::types::{AftFlags, HostException, TransferAmounts};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostCashOutOutcome {
    /// Host cash-out not enabled; caller cashes out locally
    NotHandled,
    /// Host took the credits
    Accepted,
    /// Denied or timed out in soft mode
    Failed,
    /// Denied or timed out in hard mode; lockup presented
    Escalated,
}

#[derive(Default)]
struct CashOutInner {
    pending: bool,
    win: bool,
    signal: Option<oneshot::Sender<bool>>,
}

pub struct HostCashOutProvider {
    wait: Duration,
    context: Arc<TransferContext>,
    hard_lock: Arc<HardCashOutLock>,
    inner: Mutex<CashOutInner>,
    cashout_notifier: ExceptionNotifier,
    win_notifier: ExceptionNotifier,
}

impl HostCashOutProvider {
    pub fn new(
        settings: &AftSettings,
        runtime: Handle,
        context: Arc<TransferContext>,
        hard_lock: Arc<HardCashOutLock>,
        host: Arc<dyn HostLink>,
    ) -> Arc<Self> {
        let interval = settings.host_cashout_exception_interval();
        Arc::new_cyclic(|weak: &Weak<HostCashOutProvider>| {
            let notifier = |name: &'static str, exception: HostException, win: bool| {
                let host = host.clone();
                let active = weak.clone();
                ExceptionNotifier::new(
                    name,
                    runtime.clone(),
                    move || host.report_exception(exception),
                    move || {
                        active.upgrade().is_some_and(|provider| {
                            let inner = provider.inner.lock();
                            inner.pending && inner.win == win
                        })
                    },
                    interval,
                )
            };
            HostCashOutProvider {
                wait: settings.host_cashout_wait(),
                cashout_notifier: notifier(
                    "host_cashout",
                    HostException::AftRequestForHostCashOut,
                    false,
                ),
                win_notifier: notifier(
                    "host_cashout_win",
                    HostException::AftRequestForHostToCashOutWin,
                    true,
                ),
                context,
                hard_lock,
                inner: Mutex::new(CashOutInner::default()),
            }
        })
    }

    /// Host cash-out enabled by the stored host flags
    pub fn is_enabled(&self) -> bool {
        self.context
            .host_cashout_flags()
            .contains(AftFlags::HOST_CASHOUT_ENABLE)
    }

    pub fn is_hard_mode(&self) -> bool {
        self.context
            .host_cashout_flags()
            .contains(AftFlags::HOST_CASHOUT_MODE_HARD)
    }

    /// A host cash-out request is waiting for the host
    pub fn cash_out_pending(&self) -> bool {
        self.inner.lock().pending
    }

    /// Transfer-off may proceed while the machine is disabled
    pub fn can_cash_out(&self) -> bool {
        (self.cash_out_pending() || self.hard_lock.is_active()) && self.hard_lock.can_cash_out()
    }

    pub fn cash_out_accepted(&self) {
        self.signal(true);
    }

    pub fn cash_out_denied(&self) {
        self.signal(false);
    }

    fn signal(&self, accepted: bool) {
        let sender = self.inner.lock().signal.take();
        if let Some(sender) = sender {
            info!(accepted, "Host answered cash-out request");
            let _ = sender.send(accepted);
        }
    }

    /// Ask the host to take `amounts`. `win` raises the cash-out-win exception.
    pub async fn handle_cash_out(&self, amounts: TransferAmounts, win: bool) -> HostCashOutOutcome {
        if !self.is_enabled() || amounts.is_zero() {
            return HostCashOutOutcome::NotHandled;
        }

        let receiver = {
            let mut inner = self.inner.lock();
            if inner.pending {
                warn!("Host cash-out already pending");
                return HostCashOutOutcome::Failed;
            }
            let (sender, receiver) = oneshot::channel();
            inner.pending = true;
            inner.win = win;
            inner.signal = Some(sender);
            receiver
        };

        info!(%amounts, win, "Requesting host cash-out");
        let notifier = if win { &self.win_notifier } else { &self.cashout_notifier };
        notifier.start(true);

        let accepted = match tokio::time::timeout(self.wait, receiver).await {
            Ok(Ok(accepted)) => accepted,
            _ => {
                warn!(wait_ms = self.wait.as_millis() as u64, "Host cash-out timed out");
                false
            }
        };

        {
            let mut inner = self.inner.lock();
            inner.pending = false;
            inner.signal = None;
        }
        notifier.stop();

        if accepted {
            return HostCashOutOutcome::Accepted;
        }
        if self.is_hard_mode() {
            if self.hard_lock.lockup_and_cash_out(amounts).await {
                return HostCashOutOutcome::Escalated;
            }
            warn!("Hard cash-out lockup could not be started");
        }
        HostCashOutOutcome::Failed
    }
}

impl LockOverride for HostCashOutProvider {
    fn host_cashout_in_progress(&self) -> bool {
        self.cash_out_pending()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aft::history::PersistedHistory;
    use crate::aft::meters::AftMeters;
    use crate::aft::types::{TransferCode, TransferData, TransferType};
    use crate::coordinator::LocalCoordinator;
    use crate::events::EventBus;
    use crate::sim::{SimCashOut, SimHost, SimMachine};
    use crate::store::MemoryStore;

    struct Fixture {
        provider: Arc<HostCashOutProvider>,
        context: Arc<TransferContext>,
        hard_lock: Arc<HardCashOutLock>,
        host: Arc<SimHost>,
        cash_out: Arc<SimCashOut>,
    }

    fn fixture() -> Fixture {
        let settings = AftSettings::default();
        let store = Arc::new(MemoryStore::new());
        let host = Arc::new(SimHost::new());
        let context = TransferContext::new(
            &settings,
            Handle::current(),
            store.clone(),
            Arc::new(PersistedHistory::new(store.clone(), 8)),
            Arc::new(AftMeters::new(store)),
            host.clone(),
        )
        .unwrap();
        let cash_out = Arc::new(SimCashOut::new());
        let hard_lock = HardCashOutLock::new(
            &settings,
            Arc::new(LocalCoordinator::new()),
            Arc::new(SimMachine::new()),
            cash_out.clone(),
            EventBus::default(),
        );
        let provider = HostCashOutProvider::new(
            &settings,
            Handle::current(),
            context.clone(),
            hard_lock.clone(),
            host.clone(),
        );
        Fixture {
            provider,
            context,
            hard_lock,
            host,
            cash_out,
        }
    }

    fn enable(context: &TransferContext, flags: AftFlags) {
        let mut request = TransferData::new(
            "FLAGS",
            TransferType::InHouseToHost,
            TransferCode::FullOnly,
            TransferAmounts::ZERO,
        );
        request.flags = AftFlags::HOST_CASHOUT_ENABLE_CONTROL | flags;
        context.update_host_cashout_flags(&request).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_enabled_is_not_handled() {
        let f = fixture();
        let outcome = f
            .provider
            .handle_cash_out(TransferAmounts::new(100, 0, 0), false)
            .await;
        assert_eq!(outcome, HostCashOutOutcome::NotHandled);
        assert!(f.host.exceptions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_soft_mode_times_out_and_fails() {
        let f = fixture();
        enable(&f.context, AftFlags::HOST_CASHOUT_ENABLE);

        let outcome = f
            .provider
            .handle_cash_out(TransferAmounts::new(100, 0, 0), false)
            .await;
        assert_eq!(outcome, HostCashOutOutcome::Failed);
        assert!(!f.provider.cash_out_pending());
        // immediate report plus one every 0.8s during the 8s wait
        let reported = f.host.exception_count(HostException::AftRequestForHostCashOut);
        assert!((10..=11).contains(&reported), "reported {reported}");
        assert!(!f.hard_lock.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_accepted_by_host() {
        let f = fixture();
        enable(&f.context, AftFlags::HOST_CASHOUT_ENABLE | AftFlags::HOST_CASHOUT_MODE_HARD);

        let provider = f.provider.clone();
        let task = tokio::spawn(async move {
            provider
                .handle_cash_out(TransferAmounts::new(100, 0, 0), true)
                .await
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(f.provider.cash_out_pending());
        assert!(f.provider.host_cashout_in_progress());
        assert!(f.host.exception_count(HostException::AftRequestForHostToCashOutWin) >= 1);

        f.provider.cash_out_accepted();
        assert_eq!(task.await.unwrap(), HostCashOutOutcome::Accepted);
        assert!(!f.hard_lock.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hard_mode_denial_escalates() {
        let f = fixture();
        enable(&f.context, AftFlags::HOST_CASHOUT_ENABLE | AftFlags::HOST_CASHOUT_MODE_HARD);

        let provider = f.provider.clone();
        let task = tokio::spawn(async move {
            provider
                .handle_cash_out(TransferAmounts::new(100, 0, 0), false)
                .await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        f.provider.cash_out_denied();
        assert_eq!(task.await.unwrap(), HostCashOutOutcome::Escalated);
        assert!(f.hard_lock.is_active());

        assert!(f.hard_lock.key_off());
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(f.cash_out.paid(), vec![TransferAmounts::new(100, 0, 0)]);
    }
}
