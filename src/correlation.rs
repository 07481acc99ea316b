//! Pairing of outbound commands with their eventual responses
//!
//! Every command sent into a sandbox gets a fresh correlation id and a
//! single-resolution completion handle. The unit's reader task resolves or
//! rejects the handle when a matching envelope arrives; unit teardown
//! rejects everything the unit still owes, regardless of what late or
//! spurious responses show up afterwards.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use log::debug;
use serde_json::Value;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::errors::{Result, SnapError};
use crate::transport::{Channel, Envelope, EnvelopeKind};

/// One in-flight correlated command
struct PendingRequest {
    unit_id: String,
    reply: oneshot::Sender<Result<Value>>,
    created_at: Instant,
}

/// Exclusive owner of the correlation-id to pending-request map
#[derive(Default)]
pub struct RequestCorrelator {
    pending: Mutex<HashMap<Uuid, PendingRequest>>,
}

impl RequestCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a command over `channel` and await the correlated reply
    ///
    /// The returned future suspends only the logical caller; it completes
    /// when `resolve`/`reject` fires for the generated id, or with
    /// `ChannelClosed` when the envelope can no longer be delivered.
    pub async fn issue(
        &self,
        channel: &Channel,
        kind: EnvelopeKind,
        payload: Value,
    ) -> Result<Value> {
        let correlation_id = Uuid::new_v4();
        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().unwrap();
            pending.insert(
                correlation_id,
                PendingRequest {
                    unit_id: channel.unit_id().to_string(),
                    reply: reply_tx,
                    created_at: Instant::now(),
                },
            );
        }

        let envelope = Envelope {
            correlation_id: Some(correlation_id),
            unit_id: channel.unit_id().to_string(),
            kind,
            payload,
        };
        if let Err(err) = channel.send(envelope) {
            self.pending.lock().unwrap().remove(&correlation_id);
            return Err(err);
        }

        match reply_rx.await {
            Ok(result) => result,
            // The pending entry vanished without a verdict; treat as closed.
            Err(_) => Err(SnapError::ChannelClosed),
        }
    }

    /// Complete the pending request for `id` with a success value
    pub fn resolve(&self, id: Uuid, value: Value) {
        self.complete(id, Ok(value));
    }

    /// Complete the pending request for `id` with an error
    pub fn reject(&self, id: Uuid, error: SnapError) {
        self.complete(id, Err(error));
    }

    fn complete(&self, id: Uuid, verdict: Result<Value>) {
        let entry = self.pending.lock().unwrap().remove(&id);
        match entry {
            // The caller may have gone away; a dead receiver is fine.
            Some(request) => {
                let _ = request.reply.send(verdict);
            }
            None => debug!("dropping response for unknown or completed correlation id {id}"),
        }
    }

    /// Reject every pending request owned by `unit_id`
    ///
    /// Invoked on unit teardown and crash. Late responses arriving after
    /// this call find no pending entry and are dropped.
    pub fn reject_all(&self, unit_id: &str, error: &SnapError) {
        let drained: Vec<PendingRequest> = {
            let mut pending = self.pending.lock().unwrap();
            let ids: Vec<Uuid> = pending
                .iter()
                .filter(|(_, request)| request.unit_id == unit_id)
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| pending.remove(id)).collect()
        };
        for request in drained {
            debug!(
                "rejecting request for '{unit_id}' after {:?} in flight",
                request.created_at.elapsed()
            );
            let _ = request.reply.send(Err(error.clone()));
        }
    }

    /// Number of outstanding requests owned by `unit_id`
    pub fn pending_for(&self, unit_id: &str) -> usize {
        self.pending
            .lock()
            .unwrap()
            .values()
            .filter(|request| request.unit_id == unit_id)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn channel_pair(unit_id: &str) -> (Channel, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Channel::new(unit_id, tx), rx)
    }

    #[tokio::test]
    async fn issue_sends_a_correlated_envelope() {
        let correlator = RequestCorrelator::new();
        let (channel, mut rx) = channel_pair("unit");

        let issued = correlator.issue(&channel, EnvelopeKind::Rpc, json!(1));
        tokio::pin!(issued);

        // Poll once so the envelope goes out, then answer it.
        tokio::select! {
            biased;
            _ = &mut issued => panic!("resolved before any response"),
            envelope = rx.recv() => {
                let envelope = envelope.unwrap();
                assert_eq!(envelope.kind, EnvelopeKind::Rpc);
                correlator.resolve(envelope.correlation_id.unwrap(), json!("pong"));
            }
        }
        assert_eq!(issued.await.unwrap(), json!("pong"));
    }

    #[tokio::test]
    async fn second_response_for_the_same_id_is_dropped() {
        let correlator = RequestCorrelator::new();
        let (channel, mut rx) = channel_pair("unit");

        let issued = correlator.issue(&channel, EnvelopeKind::Rpc, json!(1));
        tokio::pin!(issued);
        let id = tokio::select! {
            biased;
            _ = &mut issued => panic!("resolved before any response"),
            envelope = rx.recv() => envelope.unwrap().correlation_id.unwrap(),
        };

        correlator.resolve(id, json!("first"));
        // Observably dropped: no panic, no state change.
        correlator.resolve(id, json!("second"));
        correlator.reject(id, SnapError::ChannelClosed);

        assert_eq!(issued.await.unwrap(), json!("first"));
        assert_eq!(correlator.pending_for("unit"), 0);
    }

    #[tokio::test]
    async fn issue_on_a_closed_channel_fails_immediately() {
        let correlator = RequestCorrelator::new();
        let (channel, _rx) = channel_pair("unit");
        channel.close();

        let err = correlator
            .issue(&channel, EnvelopeKind::Rpc, json!(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SnapError::ChannelClosed));
        assert_eq!(correlator.pending_for("unit"), 0);
    }

    #[tokio::test]
    async fn reject_all_only_touches_the_named_unit() {
        let correlator = RequestCorrelator::new();
        let (alpha, mut alpha_rx) = channel_pair("alpha");
        let (beta, mut beta_rx) = channel_pair("beta");

        let alpha_call = correlator.issue(&alpha, EnvelopeKind::Rpc, json!(1));
        let beta_call = correlator.issue(&beta, EnvelopeKind::Rpc, json!(2));
        tokio::pin!(alpha_call);
        tokio::pin!(beta_call);

        let beta_id = tokio::select! {
            biased;
            _ = &mut alpha_call => panic!("alpha resolved early"),
            _ = &mut beta_call => panic!("beta resolved early"),
            envelope = beta_rx.recv() => envelope.unwrap().correlation_id.unwrap(),
        };
        let _ = alpha_rx.recv().await.unwrap();

        let crash = SnapError::Crash {
            unit_id: "alpha".to_string(),
            detail: "gone".to_string(),
        };
        correlator.reject_all("alpha", &crash);

        let err = alpha_call.await.unwrap_err();
        assert!(err.to_string().contains("Error while running snap 'alpha'"));

        // Beta is untouched and still resolvable.
        assert_eq!(correlator.pending_for("beta"), 1);
        correlator.resolve(beta_id, json!("ok"));
        assert_eq!(beta_call.await.unwrap(), json!("ok"));
    }
}
