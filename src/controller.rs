//! Execution service facade
//!
//! Composes the unit table, request correlator, event bus, and endowment
//! registry around an isolation provider. Each unit gets two tasks: a
//! reader that routes inbound envelopes through the correlator and turns
//! channel loss into a crash, and a dispatch worker that drains the unit's
//! job queue one request at a time. The worker is the serialization
//! barrier: queued requests wait their turn while different units run
//! fully concurrently.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use log::{debug, warn};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::timeout;

use crate::correlation::RequestCorrelator;
use crate::endowments::{Endowment, EndowmentRegistry};
use crate::errors::{Result, SnapError};
use crate::events::{EventBus, UnitEvent};
use crate::isolation::{IsolationProvider, UnitSpec};
use crate::lifecycle::{DispatchJob, UnitStatus, UnitTable};
use crate::transport::{Channel, Envelope, EnvelopeKind};

/// Service-wide configuration
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Bound on how long a unit may take to become ready
    pub startup_timeout: Duration,
    /// Broadcast capacity of the event bus
    pub event_capacity: usize,
}

impl ServiceConfig {
    /// Validate configuration invariants
    pub fn validate(&self) -> Result<()> {
        if self.startup_timeout.is_zero() {
            return Err(SnapError::InvalidConfig(
                "startup timeout must be non-zero".to_string(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(SnapError::InvalidConfig(
                "event capacity must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Per-call options for [`ExecutionService::execute_snap`]
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Override the service-wide startup timeout for this start
    pub startup_timeout: Option<Duration>,
}

/// Builder for the execution service
///
/// The startup timeout has no built-in default and must be supplied.
pub struct ExecutionServiceBuilder {
    provider: Arc<dyn IsolationProvider>,
    startup_timeout: Option<Duration>,
    event_capacity: usize,
    endowments: EndowmentRegistry,
}

impl ExecutionServiceBuilder {
    pub fn new(provider: impl IsolationProvider) -> Self {
        Self {
            provider: Arc::new(provider),
            startup_timeout: None,
            event_capacity: 64,
            endowments: EndowmentRegistry::new(),
        }
    }

    /// Bound the time a unit may take to become ready (required)
    pub fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = Some(timeout);
        self
    }

    /// Capacity of the unit-event broadcast bus
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Register a host capability snaps may request at start time
    pub fn endowment(mut self, name: &str, endowment: Arc<dyn Endowment>) -> Self {
        self.endowments.register(name, endowment);
        self
    }

    /// Build the service
    pub fn build(self) -> Result<ExecutionService> {
        let startup_timeout = self.startup_timeout.ok_or_else(|| {
            SnapError::InvalidConfig("a startup timeout is required".to_string())
        })?;
        let config = ServiceConfig {
            startup_timeout,
            event_capacity: self.event_capacity,
        };
        config.validate()?;
        let events = EventBus::new(config.event_capacity);
        Ok(ExecutionService {
            inner: Arc::new(ServiceInner {
                config,
                provider: self.provider,
                endowments: self.endowments,
                lifecycle: UnitTable::new(),
                correlator: RequestCorrelator::new(),
                events,
            }),
        })
    }
}

struct ServiceInner {
    config: ServiceConfig,
    provider: Arc<dyn IsolationProvider>,
    endowments: EndowmentRegistry,
    lifecycle: UnitTable,
    correlator: RequestCorrelator,
    events: EventBus,
}

impl ServiceInner {
    /// Tear down a crashed unit: close its channel, reject everything it
    /// still owes, and tell the world. Idempotent; a no-op while an
    /// explicit terminate owns the entry.
    async fn crash_unit(&self, unit_id: &str, detail: String) {
        let Some(entry) = self.lifecycle.take_for_crash(unit_id) else {
            return;
        };
        if let Some(channel) = entry.channel {
            channel.close();
        }
        let error = SnapError::Crash {
            unit_id: unit_id.to_string(),
            detail: detail.clone(),
        };
        self.correlator.reject_all(unit_id, &error);
        self.events.publish(UnitEvent::Crashed {
            unit_id: unit_id.to_string(),
            detail,
        });
        warn!("snap '{unit_id}' crashed: {error}");
    }
}

/// Host-side service managing the pool of snaps
pub struct ExecutionService {
    inner: Arc<ServiceInner>,
}

impl std::fmt::Debug for ExecutionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionService")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl ExecutionService {
    /// Start a snap and wait until it is ready to serve requests
    ///
    /// Fails with `DuplicateUnit` when `unit_id` is already tracked, with
    /// `ChannelSetup` when the sandbox cannot be provisioned, and with
    /// `ExecutionStart` when the unit crashes or misses the startup
    /// timeout before becoming ready. A crash during startup also
    /// publishes a `Crashed` event.
    pub async fn execute_snap(
        &self,
        unit_id: &str,
        source: &str,
        endowments: &[String],
        options: StartOptions,
    ) -> Result<String> {
        let inner = &self.inner;
        inner.lifecycle.insert_starting(unit_id)?;

        let granted = match inner.endowments.grant(unit_id, endowments, &inner.events) {
            Ok(granted) => granted,
            Err(err) => {
                inner.lifecycle.remove(unit_id);
                return Err(err);
            }
        };

        let spec = UnitSpec {
            unit_id: unit_id.to_string(),
            endowments: granted,
        };
        let deadline = options.startup_timeout.unwrap_or(inner.config.startup_timeout);
        let sandbox = match timeout(deadline, inner.provider.create(spec)).await {
            Ok(Ok(sandbox)) => sandbox,
            Ok(Err(err)) => {
                inner.lifecycle.remove(unit_id);
                return Err(err);
            }
            Err(_elapsed) => {
                inner.lifecycle.remove(unit_id);
                return Err(SnapError::ChannelSetup(format!(
                    "sandbox was not reachable within {deadline:?}"
                )));
            }
        };

        let channel = Arc::new(Channel::new(unit_id, sandbox.outbound));
        let (job_tx, job_rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(run_reader(
            Arc::clone(inner),
            unit_id.to_string(),
            sandbox.inbound,
        ));
        tokio::spawn(run_worker(
            Arc::clone(inner),
            unit_id.to_string(),
            Arc::clone(&channel),
            job_rx,
        ));
        inner
            .lifecycle
            .attach(unit_id, Arc::clone(&channel), job_tx, reader);

        let payload = json!({ "source": source, "endowments": endowments });
        let start = inner.correlator.issue(&channel, EnvelopeKind::Start, payload);

        match timeout(deadline, start).await {
            Ok(Ok(_ack)) => {
                if !inner.lifecycle.mark_ready(unit_id) {
                    // Torn down while the acknowledgement was in flight.
                    return Err(SnapError::ExecutionStart {
                        unit_id: unit_id.to_string(),
                        detail: "unit disappeared during startup".to_string(),
                    });
                }
                debug!("snap '{unit_id}' is ready");
                Ok("OK".to_string())
            }
            Ok(Err(err)) => {
                let detail = err.detail();
                inner.crash_unit(unit_id, detail.clone()).await;
                Err(SnapError::ExecutionStart {
                    unit_id: unit_id.to_string(),
                    detail,
                })
            }
            Err(_elapsed) => {
                let detail = format!("did not become ready within {deadline:?}");
                inner.crash_unit(unit_id, detail.clone()).await;
                Err(SnapError::ExecutionStart {
                    unit_id: unit_id.to_string(),
                    detail,
                })
            }
        }
    }

    /// Dispatch one request to a snap and wait for its response
    ///
    /// Requests to the same snap are strictly serialized; requests to
    /// different snaps proceed concurrently. Fails with `UnknownUnit` for
    /// untracked ids and `InvalidState` for units that can no longer
    /// serve; a crash mid-request surfaces the unit's crash detail.
    pub async fn handle_rpc_request(&self, unit_id: &str, request: Value) -> Result<Value> {
        let jobs = self.inner.lifecycle.dispatcher_for(unit_id)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        jobs.send(DispatchJob {
            payload: request,
            reply: reply_tx,
        })
        .map_err(|_| SnapError::UnknownUnit(unit_id.to_string()))?;

        match reply_rx.await {
            Ok(result) => result,
            // The worker went away with the job still queued.
            Err(_) => Err(SnapError::ChannelClosed),
        }
    }

    /// Tear down one snap
    ///
    /// Unknown and already-terminated ids are a no-op. Pending requests
    /// are rejected, the channel is closed, and the entry is removed once
    /// the close completes.
    pub async fn terminate(&self, unit_id: &str) -> Result<()> {
        let Some(parts) = self.inner.lifecycle.begin_terminate(unit_id) else {
            return Ok(());
        };

        self.inner
            .correlator
            .reject_all(unit_id, &SnapError::ChannelClosed);
        if let Some(channel) = parts.channel {
            // Best-effort goodbye before the transport goes away.
            let _ = channel.send(Envelope {
                correlation_id: None,
                unit_id: unit_id.to_string(),
                kind: EnvelopeKind::Terminate,
                payload: Value::Null,
            });
            channel.close();
        }
        if let Some(reader) = parts.reader {
            if reader.await.is_err() {
                warn!("reader task for '{unit_id}' ended abnormally");
            }
        }

        self.inner.lifecycle.remove(unit_id);
        self.inner.events.publish(UnitEvent::Terminated {
            unit_id: unit_id.to_string(),
        });
        debug!("snap '{unit_id}' terminated");
        Ok(())
    }

    /// Tear down every tracked snap, awaiting each channel close
    pub async fn terminate_all_snaps(&self) -> Result<()> {
        let ids = self.inner.lifecycle.unit_ids();
        join_all(ids.iter().map(|unit_id| self.terminate(unit_id))).await;
        Ok(())
    }

    /// Subscribe to unit events
    pub fn subscribe(&self) -> broadcast::Receiver<UnitEvent> {
        self.inner.events.subscribe()
    }

    /// Current lifecycle status of a unit, if tracked
    pub fn status_of(&self, unit_id: &str) -> Option<UnitStatus> {
        self.inner.lifecycle.status_of(unit_id)
    }

    /// Ids of all tracked units
    pub fn unit_ids(&self) -> Vec<String> {
        self.inner.lifecycle.unit_ids()
    }

    /// Outstanding correlated requests for a unit
    pub fn pending_requests(&self, unit_id: &str) -> usize {
        self.inner.correlator.pending_for(unit_id)
    }
}

/// Routes one unit's inbound envelopes until the channel goes down
async fn run_reader(
    inner: Arc<ServiceInner>,
    unit_id: String,
    mut inbound: mpsc::UnboundedReceiver<Envelope>,
) {
    let mut crash_detail = None;
    while let Some(envelope) = inbound.recv().await {
        match (envelope.kind, envelope.correlation_id) {
            (EnvelopeKind::Response, Some(id)) => {
                inner.correlator.resolve(id, envelope.payload);
            }
            (EnvelopeKind::Error, Some(id)) => {
                inner
                    .correlator
                    .reject(id, SnapError::ExecutionRuntime(payload_text(&envelope.payload)));
            }
            // The distinguished execution-error envelope: fatal for the unit.
            (EnvelopeKind::Error, None) => {
                crash_detail = Some(payload_text(&envelope.payload));
                break;
            }
            (kind, _) => warn!("unit '{unit_id}' sent unexpected {kind:?} envelope"),
        }
    }

    let detail =
        crash_detail.unwrap_or_else(|| "the execution channel closed unexpectedly".to_string());
    inner.crash_unit(&unit_id, detail).await;
}

/// Drains one unit's job queue, one request at a time
async fn run_worker(
    inner: Arc<ServiceInner>,
    unit_id: String,
    channel: Arc<Channel>,
    mut jobs: mpsc::UnboundedReceiver<DispatchJob>,
) {
    while let Some(job) = jobs.recv().await {
        if !inner.lifecycle.begin_dispatch(&unit_id) {
            let error = match inner.lifecycle.status_of(&unit_id) {
                Some(status) => SnapError::InvalidState {
                    unit_id: unit_id.clone(),
                    status,
                },
                None => SnapError::UnknownUnit(unit_id.clone()),
            };
            let _ = job.reply.send(Err(error));
            continue;
        }

        let result = inner
            .correlator
            .issue(&channel, EnvelopeKind::Rpc, job.payload)
            .await;
        inner.lifecycle.finish_dispatch(&unit_id);
        let _ = job.reply.send(result);
    }
    debug!("dispatch worker for '{unit_id}' stopped");
}

/// Human-readable text of an error payload
fn payload_text(payload: &Value) -> String {
    match payload {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
