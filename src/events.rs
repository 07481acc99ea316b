//! Broadcast bus for observable unit events

use tokio::sync::broadcast;

/// Events published by the execution service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitEvent {
    /// A unit began a host-mediated outbound call
    OutboundRequest { unit_id: String },
    /// The outbound call settled, successfully or not
    OutboundResponse { unit_id: String },
    /// The unit crashed and was removed
    Crashed { unit_id: String, detail: String },
    /// The unit was terminated and removed
    Terminated { unit_id: String },
}

impl UnitEvent {
    /// Unit the event refers to
    pub fn unit_id(&self) -> &str {
        match self {
            UnitEvent::OutboundRequest { unit_id }
            | UnitEvent::OutboundResponse { unit_id }
            | UnitEvent::Crashed { unit_id, .. }
            | UnitEvent::Terminated { unit_id } => unit_id,
        }
    }
}

/// Fire-and-forget broadcast bus for unit events
///
/// Publishing never blocks and never fails the publisher; subscribers that
/// lag beyond the bus capacity miss the oldest events.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<UnitEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Register a new observer
    pub fn subscribe(&self) -> broadcast::Receiver<UnitEvent> {
        self.tx.subscribe()
    }

    /// Broadcast an event to all current observers
    pub fn publish(&self, event: UnitEvent) {
        // A send error only means nobody is listening right now.
        let _ = self.tx.send(event);
    }
}
