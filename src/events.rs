//! Domain Event Bus
//!
//! Fire-and-forget events for the rest of the platform (UI, audit, runtime).
//! Publishing never blocks: when the queue is full the event is dropped.

use crossbeam_queue::ArrayQueue;
use std::sync::Arc;
use tracing::debug;

use crate::aft::lock::LockState;
use crate::money::TransferAmounts;

/// Default bus capacity
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AftEvent {
    /// Game lock state machine changed state
    LockStateChanged(LockState),
    /// An orchestrator took or gave back the exclusive transaction
    TransferLockChanged { locked: bool },
    /// Hard cash-out lockup presented with the surfaced amounts
    HardCashLockout(TransferAmounts),
    /// Attendant key-off cleared a hard cash-out lockup
    KeyOff,
}

/// Shared bounded event queue
#[derive(Clone)]
pub struct EventBus {
    queue: Arc<ArrayQueue<AftEvent>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Arc::new(ArrayQueue::new(capacity.max(1))),
        }
    }

    pub fn publish(&self, event: AftEvent) {
        if let Err(dropped) = self.queue.push(event) {
            debug!(event = ?dropped, "Event bus full, dropping event");
        }
    }

    /// Pop the oldest pending event
    pub fn try_next(&self) -> Option<AftEvent> {
        self.queue.pop()
    }

    /// Drain everything currently queued
    pub fn drain(&self) -> Vec<AftEvent> {
        std::iter::from_fn(|| self.queue.pop()).collect()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_and_drain_in_order() {
        let bus = EventBus::new(4);
        bus.publish(AftEvent::TransferLockChanged { locked: true });
        bus.publish(AftEvent::KeyOff);
        assert_eq!(
            bus.drain(),
            vec![AftEvent::TransferLockChanged { locked: true }, AftEvent::KeyOff]
        );
        assert!(bus.try_next().is_none());
    }

    #[test]
    fn test_full_bus_drops_newest() {
        let bus = EventBus::new(1);
        bus.publish(AftEvent::KeyOff);
        bus.publish(AftEvent::TransferLockChanged { locked: false });
        assert_eq!(bus.drain(), vec![AftEvent::KeyOff]);
    }
}
