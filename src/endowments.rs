//! Host-mediated capabilities granted to snaps
//!
//! Endowments are the explicit, enumerated capability table a snap receives
//! at start time. Each granted capability is wrapped so that every
//! invocation publishes an outbound-request event before the call is
//! forwarded and an outbound-response event after it settles. Host-side
//! policy (rate limiting, liveness heuristics, auditing) hangs off those
//! events without the lifecycle machinery knowing any capability semantics.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use crate::errors::{Result, SnapError};
use crate::events::{EventBus, UnitEvent};

/// A host-mediated capability invocable from sandboxed code
#[async_trait]
pub trait Endowment: Send + Sync {
    /// Invoke the capability with a request payload
    async fn invoke(&self, args: Value) -> Result<Value>;
}

/// Host-registered capabilities, by name
#[derive(Default, Clone)]
pub struct EndowmentRegistry {
    entries: HashMap<String, Arc<dyn Endowment>>,
}

impl EndowmentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a capability under `name`, replacing any previous entry
    pub fn register(&mut self, name: &str, endowment: Arc<dyn Endowment>) {
        self.entries.insert(name.to_string(), endowment);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Build the granted table for one unit
    ///
    /// Every granted capability is wrapped with the outbound notification
    /// bridge tagged with `unit_id`. Requesting a name the host never
    /// registered is a configuration error.
    pub fn grant(&self, unit_id: &str, names: &[String], events: &EventBus) -> Result<Endowments> {
        let mut granted: HashMap<String, Arc<dyn Endowment>> = HashMap::new();
        for name in names {
            let inner = self.entries.get(name).cloned().ok_or_else(|| {
                SnapError::InvalidConfig(format!("endowment '{name}' is not registered"))
            })?;
            granted.insert(
                name.clone(),
                Arc::new(BridgedEndowment {
                    unit_id: unit_id.to_string(),
                    events: events.clone(),
                    inner,
                }),
            );
        }
        Ok(Endowments { entries: granted })
    }
}

/// The capability table handed to one unit's sandbox
#[derive(Default, Clone)]
pub struct Endowments {
    entries: HashMap<String, Arc<dyn Endowment>>,
}

impl std::fmt::Debug for Endowments {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endowments")
            .field("entries", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Endowments {
    pub fn get(&self, name: &str) -> Option<Arc<dyn Endowment>> {
        self.entries.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Wraps a granted capability with started/finished notifications
struct BridgedEndowment {
    unit_id: String,
    events: EventBus,
    inner: Arc<dyn Endowment>,
}

#[async_trait]
impl Endowment for BridgedEndowment {
    async fn invoke(&self, args: Value) -> Result<Value> {
        self.events.publish(UnitEvent::OutboundRequest {
            unit_id: self.unit_id.clone(),
        });
        let result = self.inner.invoke(args).await;
        self.events.publish(UnitEvent::OutboundResponse {
            unit_id: self.unit_id.clone(),
        });
        result
    }
}

/// Capability that records every line it is asked to print
///
/// A minimal console for examples and tests.
#[derive(Default, Clone)]
pub struct ConsoleEndowment {
    lines: Arc<Mutex<Vec<String>>>,
}

impl ConsoleEndowment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything printed so far
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }
}

#[async_trait]
impl Endowment for ConsoleEndowment {
    async fn invoke(&self, args: Value) -> Result<Value> {
        let line = match args {
            Value::String(line) => line,
            other => other.to_string(),
        };
        self.lines.lock().unwrap().push(line);
        Ok(Value::Null)
    }
}
