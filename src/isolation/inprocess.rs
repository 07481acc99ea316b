//! In-process provider for development and tests
//!
//! Runs each unit as a plain tokio task with no real isolation, the way an
//! execution path degrades to an unisolated run when the platform cannot
//! provide one. The task speaks the full envelope protocol and interprets
//! a handful of directives embedded in the snap source so every protocol
//! path can be exercised without a real sandbox:
//!
//! - `fail-start:<msg>` answers the start command with an error
//! - `hang-start` never answers the start command
//! - `throw:<msg>` makes any request raise a fatal execution error
//! - `fail-rpc:<msg>` answers any request with a request-scoped error
//! - `call:<name>` makes any request invoke the named endowment with the
//!   request payload and reply with its result
//!
//! Any other source acknowledges start and echoes request payloads back.

use async_trait::async_trait;
use log::debug;
use serde_json::{json, Value};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::errors::Result;
use crate::transport::{Envelope, EnvelopeKind, SandboxChannel};

use super::{IsolationProvider, UnitSpec};

/// Provider that runs every unit as an in-process tokio task
#[derive(Default)]
pub struct InProcessProvider;

impl InProcessProvider {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl IsolationProvider for InProcessProvider {
    async fn create(&self, spec: UnitSpec) -> Result<SandboxChannel> {
        let (host_tx, unit_rx) = mpsc::unbounded_channel();
        let (unit_tx, host_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_unit(spec, unit_rx, unit_tx));
        Ok(SandboxChannel {
            outbound: host_tx,
            inbound: host_rx,
        })
    }
}

async fn run_unit(
    spec: UnitSpec,
    mut inbound: UnboundedReceiver<Envelope>,
    outbound: UnboundedSender<Envelope>,
) {
    let unit_id = spec.unit_id.clone();
    let mut source = String::new();

    while let Some(envelope) = inbound.recv().await {
        match envelope.kind {
            EnvelopeKind::Start => {
                source = envelope
                    .payload
                    .get("source")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();

                if let Some(detail) = directive(&source, "fail-start:") {
                    let _ = outbound.send(reply_error(&unit_id, &envelope, &detail));
                    continue;
                }
                if source.contains("hang-start") {
                    continue;
                }
                let _ = outbound.send(reply_ok(&unit_id, &envelope, json!("OK")));
            }
            EnvelopeKind::Rpc => {
                if let Some(detail) = directive(&source, "throw:") {
                    // Fatal: an uncorrelated error, then the channel drops.
                    let _ = outbound.send(Envelope {
                        correlation_id: None,
                        unit_id: unit_id.clone(),
                        kind: EnvelopeKind::Error,
                        payload: json!(detail),
                    });
                    break;
                }
                if let Some(detail) = directive(&source, "fail-rpc:") {
                    let _ = outbound.send(reply_error(&unit_id, &envelope, &detail));
                    continue;
                }
                if let Some(name) = directive(&source, "call:") {
                    let reply = match spec.endowments.get(&name) {
                        Some(endowment) => match endowment.invoke(envelope.payload.clone()).await {
                            Ok(value) => reply_ok(&unit_id, &envelope, value),
                            Err(err) => reply_error(&unit_id, &envelope, &err.to_string()),
                        },
                        None => reply_error(
                            &unit_id,
                            &envelope,
                            &format!("endowment '{name}' is not available"),
                        ),
                    };
                    let _ = outbound.send(reply);
                    continue;
                }
                let _ = outbound.send(reply_ok(&unit_id, &envelope, envelope.payload.clone()));
            }
            EnvelopeKind::Terminate => break,
            other => debug!("unit '{unit_id}' ignoring unexpected {other:?} envelope"),
        }
    }

    debug!("in-process unit '{unit_id}' stopped");
}

fn reply_ok(unit_id: &str, request: &Envelope, payload: Value) -> Envelope {
    Envelope {
        correlation_id: request.correlation_id,
        unit_id: unit_id.to_string(),
        kind: EnvelopeKind::Response,
        payload,
    }
}

fn reply_error(unit_id: &str, request: &Envelope, detail: &str) -> Envelope {
    Envelope {
        correlation_id: request.correlation_id,
        unit_id: unit_id.to_string(),
        kind: EnvelopeKind::Error,
        payload: json!(detail),
    }
}

/// Extract the rest of the line following `prefix` in `source`
fn directive(source: &str, prefix: &str) -> Option<String> {
    source.find(prefix).map(|at| {
        source[at + prefix.len()..]
            .lines()
            .next()
            .unwrap_or_default()
            .trim()
            .to_string()
    })
}
