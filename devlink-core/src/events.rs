//! Local event bus for UI / observer consumption.
//!
//! Backed by a bounded `tokio::sync::broadcast` channel: observers that
//! fall behind lose the oldest events and see `RecvError::Lagged`. The
//! controller never blocks on a slow observer.

use tokio::sync::broadcast;
use tracing::trace;

use crate::message::StatePatch;
use crate::state::PeerId;

/// Default number of buffered events per observer.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Notifications raised by the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// Our own identity / display name changed.
    SelfInfoChanged { name: String },
    /// The roster changed (peers added, removed, or changed status).
    DeviceListChanged,
    /// Device state changed. `peer` is `None` for the local device.
    DeviceStatusChanged {
        peer: Option<PeerId>,
        patch: StatePatch,
    },
}

/// Cloneable publisher side of the bus.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DeviceEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Register a new observer.
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: DeviceEvent) {
        if self.tx.send(event).is_err() {
            trace!("no event observers registered");
        }
    }

    pub fn observer_count(&self) -> usize {
        self.tx.receiver_count()
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
    use tokio::sync::broadcast::error::TryRecvError;

    #[test]
    fn observers_receive_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.emit(DeviceEvent::DeviceListChanged);
        assert_eq!(rx.try_recv().unwrap(), DeviceEvent::DeviceListChanged);
    }

    #[test]
    fn emit_without_observers_is_fine() {
        let bus = EventBus::default();
        bus.emit(DeviceEvent::DeviceListChanged);
        assert_eq!(bus.observer_count(), 0);
    }

    #[test]
    fn slow_observer_drops_oldest() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for name in ["a", "b", "c"] {
            bus.emit(DeviceEvent::SelfInfoChanged { name: name.into() });
        }
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Lagged(1))));
        assert_eq!(
            rx.try_recv().unwrap(),
            DeviceEvent::SelfInfoChanged { name: "b".into() }
        );
    }
}
