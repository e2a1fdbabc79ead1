//! Exception Notifier
//!
//! The host only stops polling for a condition once it acknowledges it, so
//! every nagging condition (game locked, registration pending, transfer
//! complete, host cash-out pending) is re-announced on a fixed interval until
//! its predicate turns false.
//!
//! Timers run on the runtime handle given at construction, so `start` may be
//! called from a command thread that is not inside the runtime.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::trace;

use crate::logging::TRACE_TARGET;

type ReportFn = Arc<dyn Fn() + Send + Sync>;
type ActiveFn = Arc<dyn Fn() -> bool + Send + Sync>;

pub struct ExceptionNotifier {
    name: &'static str,
    runtime: Handle,
    report: ReportFn,
    active: ActiveFn,
    interval: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ExceptionNotifier {
    pub fn new(
        name: &'static str,
        runtime: Handle,
        report: impl Fn() + Send + Sync + 'static,
        active: impl Fn() -> bool + Send + Sync + 'static,
        interval: Duration,
    ) -> Self {
        Self {
            name,
            runtime,
            report: Arc::new(report),
            active: Arc::new(active),
            interval,
            task: Mutex::new(None),
        }
    }

    /// Arm the repeating report. With `immediate` the first report happens
    /// synchronously on the caller's thread.
    pub fn start(&self, immediate: bool) {
        if immediate {
            (self.report)();
        }

        let report = self.report.clone();
        let active = self.active.clone();
        let interval = self.interval;
        let name = self.name;

        let handle = self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !active() {
                    trace!(target: TRACE_TARGET, notifier = name, "Condition cleared, disarming");
                    break;
                }
                trace!(target: TRACE_TARGET, notifier = name, "Re-announcing exception");
                report();
            }
        });

        if let Some(previous) = self.task.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Cancel any armed timer; safe to call repeatedly
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }

    pub fn is_armed(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

impl Drop for ExceptionNotifier {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn notifier(interval_ms: u64) -> (ExceptionNotifier, Arc<AtomicUsize>, Arc<AtomicBool>) {
        let count = Arc::new(AtomicUsize::new(0));
        let active = Arc::new(AtomicBool::new(true));
        let notifier = ExceptionNotifier::new(
            "test",
            Handle::current(),
            {
                let count = count.clone();
                move || {
                    count.fetch_add(1, Ordering::SeqCst);
                }
            },
            {
                let active = active.clone();
                move || active.load(Ordering::SeqCst)
            },
            Duration::from_millis(interval_ms),
        );
        (notifier, count, active)
    }

    #[tokio::test(start_paused = true)]
    async fn test_reports_every_interval_while_active() {
        let (notifier, count, active) = notifier(100);
        notifier.start(false);
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);

        active.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!notifier.is_armed());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_report_and_stop() {
        let (notifier, count, _active) = notifier(100);
        notifier.start(true);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);

        notifier.stop();
        notifier.stop();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_start_from_thread_outside_runtime() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let notifier = ExceptionNotifier::new(
            "outside",
            runtime.handle().clone(),
            {
                let count = count.clone();
                move || {
                    count.fetch_add(1, Ordering::SeqCst);
                }
            },
            || true,
            Duration::from_millis(10),
        );

        notifier.start(true);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        std::thread::sleep(Duration::from_millis(200));
        assert!(count.load(Ordering::SeqCst) >= 2);

        notifier.stop();
        drop(notifier);
        runtime.shutdown_background();
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_replaces_timer() {
        let (notifier, count, _active) = notifier(100);
        notifier.start(false);
        notifier.start(false);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
