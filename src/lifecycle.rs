//! Unit lifecycle state machine and the table of active units
//!
//! The table is the single owner of all per-unit bookkeeping; nothing else
//! mutates a unit's status. Entries exist from the moment a start is
//! accepted until the unit terminates or crashes, at which point the entry
//! is removed and the unit id becomes free again.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use log::warn;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::errors::{Result, SnapError};
use crate::transport::Channel;

/// Lifecycle states of one execution unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitStatus {
    /// Created; the start command is in flight
    Starting,
    /// Idle and accepting requests
    Ready,
    /// Exactly one request in flight
    Executing,
    /// Explicit teardown in progress
    Terminating,
    /// Torn down cleanly; the entry is gone
    Terminated,
    /// Unrecoverable failure; the entry is gone
    Crashed,
}

impl UnitStatus {
    /// Whether a request-handling command may be dispatched in this state
    pub fn accepts_requests(self) -> bool {
        matches!(self, UnitStatus::Ready | UnitStatus::Executing)
    }

    /// Whether this state is terminal for the unit instance
    pub fn is_terminal(self) -> bool {
        matches!(self, UnitStatus::Terminated | UnitStatus::Crashed)
    }

    /// Valid transitions of the unit state machine
    pub fn may_transition_to(self, next: UnitStatus) -> bool {
        use UnitStatus::*;
        matches!(
            (self, next),
            (Starting, Ready)
                | (Ready, Executing)
                | (Executing, Ready)
                | (Starting | Ready | Executing, Terminating)
                | (Terminating, Terminated)
                | (Starting | Ready | Executing | Terminating, Crashed)
        )
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UnitStatus::Starting => "starting",
            UnitStatus::Ready => "ready",
            UnitStatus::Executing => "executing",
            UnitStatus::Terminating => "terminating",
            UnitStatus::Terminated => "terminated",
            UnitStatus::Crashed => "crashed",
        };
        f.write_str(name)
    }
}

/// One queued request-dispatch job for a unit
pub(crate) struct DispatchJob {
    pub payload: Value,
    pub reply: oneshot::Sender<Result<Value>>,
}

/// Live bookkeeping for one unit
pub(crate) struct UnitEntry {
    pub status: UnitStatus,
    pub channel: Option<Arc<Channel>>,
    pub jobs: Option<mpsc::UnboundedSender<DispatchJob>>,
    pub reader: Option<JoinHandle<()>>,
}

/// Pieces `terminate` needs once an entry has switched to `Terminating`
pub(crate) struct TerminateParts {
    pub channel: Option<Arc<Channel>>,
    pub reader: Option<JoinHandle<()>>,
}

/// Exclusive owner of the `unit_id -> UnitEntry` map
#[derive(Default)]
pub(crate) struct UnitTable {
    units: Mutex<HashMap<String, UnitEntry>>,
}

impl UnitTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `unit_id` in the `Starting` state
    pub fn insert_starting(&self, unit_id: &str) -> Result<()> {
        let mut units = self.units.lock().unwrap();
        if units.contains_key(unit_id) {
            return Err(SnapError::DuplicateUnit(unit_id.to_string()));
        }
        units.insert(
            unit_id.to_string(),
            UnitEntry {
                status: UnitStatus::Starting,
                channel: None,
                jobs: None,
                reader: None,
            },
        );
        Ok(())
    }

    /// Attach the channel, dispatch queue, and reader task once the
    /// sandbox is provisioned
    pub fn attach(
        &self,
        unit_id: &str,
        channel: Arc<Channel>,
        jobs: mpsc::UnboundedSender<DispatchJob>,
        reader: JoinHandle<()>,
    ) {
        let mut units = self.units.lock().unwrap();
        if let Some(entry) = units.get_mut(unit_id) {
            entry.channel = Some(channel);
            entry.jobs = Some(jobs);
            entry.reader = Some(reader);
        }
    }

    /// Starting -> Ready; false when the unit was torn down meanwhile
    pub fn mark_ready(&self, unit_id: &str) -> bool {
        self.transition(unit_id, UnitStatus::Ready)
    }

    /// Ready -> Executing; false when the unit can no longer execute
    pub fn begin_dispatch(&self, unit_id: &str) -> bool {
        self.transition(unit_id, UnitStatus::Executing)
    }

    /// Executing -> Ready, if the unit is still serving
    ///
    /// Quiet when the unit crashed or began terminating mid-request;
    /// teardown owns the status from there.
    pub fn finish_dispatch(&self, unit_id: &str) {
        let mut units = self.units.lock().unwrap();
        if let Some(entry) = units.get_mut(unit_id) {
            if entry.status == UnitStatus::Executing {
                entry.status = UnitStatus::Ready;
            }
        }
    }

    fn transition(&self, unit_id: &str, next: UnitStatus) -> bool {
        let mut units = self.units.lock().unwrap();
        match units.get_mut(unit_id) {
            Some(entry) if entry.status.may_transition_to(next) => {
                entry.status = next;
                true
            }
            Some(entry) => {
                warn!(
                    "refusing {current} -> {next} transition for unit '{unit_id}'",
                    current = entry.status
                );
                false
            }
            None => false,
        }
    }

    /// Dispatch queue for `unit_id`, guarded by the state machine
    pub fn dispatcher_for(&self, unit_id: &str) -> Result<mpsc::UnboundedSender<DispatchJob>> {
        let units = self.units.lock().unwrap();
        let entry = units
            .get(unit_id)
            .ok_or_else(|| SnapError::UnknownUnit(unit_id.to_string()))?;
        if !entry.status.accepts_requests() {
            return Err(SnapError::InvalidState {
                unit_id: unit_id.to_string(),
                status: entry.status,
            });
        }
        entry
            .jobs
            .clone()
            .ok_or_else(|| SnapError::UnknownUnit(unit_id.to_string()))
    }

    /// Switch to `Terminating` and hand back what teardown needs
    ///
    /// Returns `None` for unknown units and for units some other caller is
    /// already terminating, making `terminate` a no-op for both.
    pub fn begin_terminate(&self, unit_id: &str) -> Option<TerminateParts> {
        let mut units = self.units.lock().unwrap();
        let entry = units.get_mut(unit_id)?;
        if entry.status == UnitStatus::Terminating {
            return None;
        }
        entry.status = UnitStatus::Terminating;
        // Dropping the queue sender stops the dispatch worker once it
        // drains what was already queued.
        entry.jobs = None;
        Some(TerminateParts {
            channel: entry.channel.take(),
            reader: entry.reader.take(),
        })
    }

    /// Remove the entry for a crashed unit
    ///
    /// Returns `None` when the unit is unknown or already `Terminating`;
    /// in the latter case the in-progress `terminate` owns the teardown
    /// and the channel closing underneath it is expected.
    pub fn take_for_crash(&self, unit_id: &str) -> Option<UnitEntry> {
        let mut units = self.units.lock().unwrap();
        match units.get(unit_id) {
            Some(entry) if entry.status == UnitStatus::Terminating => None,
            Some(_) => units.remove(unit_id),
            None => None,
        }
    }

    /// Drop the entry entirely
    pub fn remove(&self, unit_id: &str) -> Option<UnitEntry> {
        self.units.lock().unwrap().remove(unit_id)
    }

    /// Current status of a unit, if tracked
    pub fn status_of(&self, unit_id: &str) -> Option<UnitStatus> {
        self.units.lock().unwrap().get(unit_id).map(|entry| entry.status)
    }

    /// Ids of all tracked units
    pub fn unit_ids(&self) -> Vec<String> {
        self.units.lock().unwrap().keys().cloned().collect()
    }
}
