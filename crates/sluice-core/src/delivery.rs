//! Hand-off of normalized envelopes to the downstream trigger engine.
//!
//! The trigger engine is an external collaborator; this layer only sees the
//! [`EnvelopeSink`] trait. Delivery is at-most-once from this layer's point
//! of view: a sink error is logged as a lost event and never retried here.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::{
    envelope::Envelope,
    error::{IngestError, Result},
};

/// Errors reported by a delivery sink.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The receiving side has gone away.
    #[error("delivery channel closed")]
    Closed,

    /// The collaborator refused the envelope.
    #[error("delivery rejected: {0}")]
    Rejected(String),
}

/// Downstream consumer of normalized envelopes.
///
/// Called exactly once per normalized event. Implementations must be safe
/// to call concurrently from every listener and subscription loop.
#[async_trait]
pub trait EnvelopeSink: Send + Sync + std::fmt::Debug {
    /// Takes ownership of an envelope.
    async fn accept(&self, envelope: Envelope) -> std::result::Result<(), SinkError>;
}

/// Sink that forwards envelopes over a bounded channel.
///
/// Backpressure applies: `accept` waits while the channel is full.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: mpsc::Sender<Envelope>,
}

impl ChannelSink {
    /// Creates a sink and the receiver the trigger engine reads from.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Envelope>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl EnvelopeSink for ChannelSink {
    async fn accept(&self, envelope: Envelope) -> std::result::Result<(), SinkError> {
        self.sender.send(envelope).await.map_err(|_| SinkError::Closed)
    }
}

/// Hands an envelope to the sink, recording a lost event on failure.
///
/// # Errors
///
/// Returns [`IngestError::DeliveryFailed`] when the sink rejects the
/// envelope. The error has already been logged; callers only use it for
/// accounting.
pub async fn hand_off(sink: &dyn EnvelopeSink, envelope: Envelope) -> Result<()> {
    let envelope_id = envelope.id();
    let kind = envelope.kind();

    match sink.accept(envelope).await {
        Ok(()) => {
            debug!(envelope_id = %envelope_id, kind = %kind, "envelope delivered");
            Ok(())
        },
        Err(e) => {
            let err = IngestError::DeliveryFailed { envelope_id, kind, reason: e.to_string() };
            error!(
                envelope_id = %envelope_id,
                kind = %kind,
                code = err.code(),
                error = %e,
                "envelope lost after acknowledgement"
            );
            Err(err)
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::SourceKind;

    fn envelope() -> Envelope {
        Envelope::builder(SourceKind::StreamNats).body("hello").metadata("subject", "a.b").build().unwrap()
    }

    #[tokio::test]
    async fn channel_sink_forwards_envelope() {
        let (sink, mut receiver) = ChannelSink::new(4);

        hand_off(&sink, envelope()).await.unwrap();

        let received = receiver.recv().await.unwrap();
        assert_eq!(received.kind(), SourceKind::StreamNats);
        assert_eq!(received.body().as_ref(), b"hello");
    }

    #[tokio::test]
    async fn closed_channel_reports_delivery_failure() {
        let (sink, receiver) = ChannelSink::new(1);
        drop(receiver);

        let err = hand_off(&sink, envelope()).await.unwrap_err();

        assert_eq!(err.code(), "E2001");
        assert!(matches!(err, IngestError::DeliveryFailed { kind: SourceKind::StreamNats, .. }));
    }
}
