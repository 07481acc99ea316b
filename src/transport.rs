//! Wire envelope and the host-side message channel adapter

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

use crate::errors::{Result, SnapError};

/// Kind of message travelling between host and sandbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    Start,
    Rpc,
    Response,
    Error,
    Terminate,
}

/// One message on the duplex channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Pairs a command with its eventual response; absent on
    /// unit-level notifications
    pub correlation_id: Option<Uuid>,
    /// Owning unit
    pub unit_id: String,
    /// Message kind
    pub kind: EnvelopeKind,
    /// Kind-specific payload
    pub payload: Value,
}

/// Raw duplex endpoints handed over by an isolation provider
pub struct SandboxChannel {
    /// Host to sandbox direction
    pub outbound: UnboundedSender<Envelope>,
    /// Sandbox to host direction
    pub inbound: UnboundedReceiver<Envelope>,
}

/// Host-side adapter owning the outbound half of one unit's channel
///
/// Sends enqueue without blocking on delivery. `close` is idempotent; once
/// closed every send reports `ChannelClosed`. The inbound half is owned by
/// the unit's reader task, which observes closure exactly once as the
/// receiver running dry.
pub struct Channel {
    unit_id: String,
    outbound: Mutex<Option<UnboundedSender<Envelope>>>,
}

impl Channel {
    /// Wrap the outbound half of a freshly created sandbox channel
    pub fn new(unit_id: &str, outbound: UnboundedSender<Envelope>) -> Self {
        Self {
            unit_id: unit_id.to_string(),
            outbound: Mutex::new(Some(outbound)),
        }
    }

    /// Unit this channel belongs to
    pub fn unit_id(&self) -> &str {
        &self.unit_id
    }

    /// Enqueue an envelope for delivery to the sandbox
    pub fn send(&self, envelope: Envelope) -> Result<()> {
        let guard = self.outbound.lock().unwrap();
        match guard.as_ref() {
            Some(tx) => tx.send(envelope).map_err(|_| SnapError::ChannelClosed),
            None => Err(SnapError::ChannelClosed),
        }
    }

    /// Whether `close` has been called or the sandbox side is gone
    pub fn is_closed(&self) -> bool {
        match self.outbound.lock().unwrap().as_ref() {
            Some(tx) => tx.is_closed(),
            None => true,
        }
    }

    /// Drop the outbound half; the sandbox observes end-of-stream
    pub fn close(&self) {
        self.outbound.lock().unwrap().take();
    }
}
