//! Typed event fan-out for the peer connection manager.
//!
//! One handler list per [`EventKind`]. Handlers run synchronously on the task
//! that raised the event, in registration order, so they must not block.

use crate::types::{Address, Envelope, Group, Identity};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    EnvelopeReceived,
    PeerConnected,
    PeerDisconnected,
    ConnectionFailed,
    GroupAnnounced,
}

#[derive(Debug, Clone)]
pub enum PeerEvent {
    EnvelopeReceived { from: Address, envelope: Envelope },
    PeerConnected { address: Address, identity: Identity },
    PeerDisconnected { address: Address },
    ConnectionFailed { address: Address, reason: String },
    GroupAnnounced { from: Address, group: Group },
}

impl PeerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            PeerEvent::EnvelopeReceived { .. } => EventKind::EnvelopeReceived,
            PeerEvent::PeerConnected { .. } => EventKind::PeerConnected,
            PeerEvent::PeerDisconnected { .. } => EventKind::PeerDisconnected,
            PeerEvent::ConnectionFailed { .. } => EventKind::ConnectionFailed,
            PeerEvent::GroupAnnounced { .. } => EventKind::GroupAnnounced,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

pub type EventHandler = Arc<dyn Fn(&PeerEvent) + Send + Sync + 'static>;

#[derive(Clone, Default)]
pub struct EventBus {
    handlers: Arc<RwLock<HashMap<EventKind, Vec<(HandlerId, EventHandler)>>>>,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(&PeerEvent) + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    pub fn off(&self, id: HandlerId) {
        let mut handlers = self.handlers.write();
        for list in handlers.values_mut() {
            list.retain(|(h, _)| *h != id);
        }
    }

    /// Invoke every handler for the event's kind. A panicking handler is
    /// logged and the rest still run.
    pub fn emit(&self, event: &PeerEvent) {
        // Snapshot so handlers may register more handlers without deadlocking
        let list: Vec<(HandlerId, EventHandler)> = match self.handlers.read().get(&event.kind()) {
            Some(list) => list.clone(),
            None => return,
        };

        for (id, handler) in list {
            if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(event)))
            {
                tracing::error!(
                    "Event handler {:?} for {:?} panicked: {}",
                    id,
                    event.kind(),
                    e.downcast_ref::<&str>()
                        .copied()
                        .or_else(|| e.downcast_ref::<String>().map(|s| s.as_str()))
                        .unwrap_or("unknown panic")
                );
            }
        }
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers.read().get(&kind).map(|l| l.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn disconnected(addr: &str) -> PeerEvent {
        PeerEvent::PeerDisconnected {
            address: Address::from(addr),
        }
    }

    #[test]
    fn test_handlers_run_in_registration_order() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let log = log.clone();
            bus.on(EventKind::PeerDisconnected, move |_| log.lock().push(i));
        }
        bus.emit(&disconnected("imp-a-0000"));

        assert_eq!(*log.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_only_matching_kind_fires() {
        let bus = EventBus::new();
        let hits = Arc::new(Mutex::new(0));
        let h = hits.clone();
        bus.on(EventKind::PeerConnected, move |_| *h.lock() += 1);

        bus.emit(&disconnected("imp-a-0000"));
        assert_eq!(*hits.lock(), 0);
    }

    #[test]
    fn test_off_removes_handler() {
        let bus = EventBus::new();
        let hits = Arc::new(Mutex::new(0));
        let h = hits.clone();
        let id = bus.on(EventKind::PeerDisconnected, move |_| *h.lock() += 1);
        assert_eq!(bus.handler_count(EventKind::PeerDisconnected), 1);

        bus.off(id);
        bus.emit(&disconnected("imp-a-0000"));
        assert_eq!(*hits.lock(), 0);
        assert_eq!(bus.handler_count(EventKind::PeerDisconnected), 0);
    }

    #[test]
    fn test_panicking_handler_does_not_stop_others() {
        let bus = EventBus::new();
        let hits = Arc::new(Mutex::new(0));
        bus.on(EventKind::PeerDisconnected, |_| panic!("boom"));
        let h = hits.clone();
        bus.on(EventKind::PeerDisconnected, move |_| *h.lock() += 1);

        bus.emit(&disconnected("imp-a-0000"));
        assert_eq!(*hits.lock(), 1);
    }
}
