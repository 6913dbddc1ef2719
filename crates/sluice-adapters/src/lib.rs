//! Producer adapters.
//!
//! One normalizer per producer family, each mapping a producer-native
//! message into an [`Envelope`]. Adapters are pure transformations: no I/O,
//! no retries, no shared state. A failure to extract a body is reported as
//! [`IngestError::UnsupportedShape`] and left to the caller.
//!
//! # Adapter families
//!
//! | Module | Kinds |
//! |--------|-------|
//! | [`queue`] | AMQP, SQS, NSQ, Azure Event Hubs |
//! | [`stream`] | Kafka, MQTT, NATS |
//! | [`pubsub`] | SNS, GCP Pub/Sub, Redis, Minio (fan-out) |
//! | [`http`] | GitHub, GitLab, generic webhooks |
//! | [`resource`] | cluster resource watch |
//! | [`calendar`] | schedule ticks |
//!
//! [`AdapterSet`] is the closed dispatch over [`SourceKind`] used by the
//! [`subscription`] loop, where producer connections hand over JSON frames.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use serde::de::DeserializeOwned;
use sluice_core::{Envelope, IngestError, Result, SourceKind};

pub mod calendar;
pub mod http;
pub mod pubsub;
pub mod queue;
pub mod resource;
pub mod stream;
pub mod subscription;

pub use calendar::{CalendarAdapter, CalendarTick};
pub use http::{GenericWebhookAdapter, GithubAdapter, GitlabAdapter, HttpPayload};
pub use pubsub::{
    GcpPubsubAdapter, GcpPubsubMessage, MinioAdapter, MinioNotification, RedisAdapter,
    RedisMessage, SnsAdapter, SnsNotification,
};
pub use queue::{
    AmqpAdapter, AmqpDelivery, AzureEventHubAdapter, AzureEventHubEvent, NsqAdapter, NsqMessage,
    SqsAdapter, SqsMessage,
};
pub use resource::{ResourceEvent, ResourceEventType, ResourceWatchAdapter};
pub use stream::{KafkaAdapter, KafkaRecord, MqttAdapter, MqttMessage, NatsAdapter, NatsMessage};
pub use subscription::{Subscription, SubscriptionHandle, SubscriptionStats};

/// Maps one producer-native message into an envelope.
pub trait Normalize: Send + Sync {
    /// Producer-native message type.
    type Input;

    /// Kind stamped on every envelope this adapter builds.
    fn kind(&self) -> SourceKind;

    /// Normalizes one message.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::UnsupportedShape`] when the message carries no
    /// usable body.
    fn normalize(&self, input: Self::Input) -> Result<Envelope>;
}

/// Dispatch over every supported producer kind.
///
/// Frames are the JSON encoding of each adapter's native input, as handed
/// over by producer connections. Webhook kinds take the raw request body.
#[derive(Debug, Default, Clone, Copy)]
pub struct AdapterSet;

impl AdapterSet {
    /// Decodes and normalizes one frame.
    ///
    /// Returns one envelope per event in the frame; only Minio frames can
    /// carry more than one. Either every envelope is returned or none is.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::UnsupportedShape`] when the frame cannot be
    /// decoded or normalized.
    pub fn normalize_frame(&self, kind: SourceKind, frame: &[u8]) -> Result<Vec<Envelope>> {
        match kind {
            SourceKind::QueueAmqp => single(&AmqpAdapter, frame),
            SourceKind::QueueSqs => single(&SqsAdapter, frame),
            SourceKind::QueueNsq => single(&NsqAdapter, frame),
            SourceKind::HubAzureEventHub => single(&AzureEventHubAdapter, frame),
            SourceKind::StreamKafka => single(&KafkaAdapter, frame),
            SourceKind::StreamMqtt => single(&MqttAdapter, frame),
            SourceKind::StreamNats => single(&NatsAdapter, frame),
            SourceKind::PubsubSns => single(&SnsAdapter, frame),
            SourceKind::PubsubGcp => single(&GcpPubsubAdapter, frame),
            SourceKind::PubsubRedis => single(&RedisAdapter, frame),
            SourceKind::ObjectStoreMinio => MinioAdapter.fan_out(decode(kind, frame)?),
            SourceKind::ResourceWatch => single(&ResourceWatchAdapter, frame),
            SourceKind::Calendar => single(&CalendarAdapter, frame),
            SourceKind::ScmGithub => {
                Ok(vec![GithubAdapter.normalize(HttpPayload::from_body(frame.to_vec()))?])
            },
            SourceKind::ScmGitlab => {
                Ok(vec![GitlabAdapter.normalize(HttpPayload::from_body(frame.to_vec()))?])
            },
            SourceKind::GenericWebhook => {
                Ok(vec![GenericWebhookAdapter.normalize(HttpPayload::from_body(frame.to_vec()))?])
            },
        }
    }
}

fn single<A>(adapter: &A, frame: &[u8]) -> Result<Vec<Envelope>>
where
    A: Normalize,
    A::Input: DeserializeOwned,
{
    let input = decode(adapter.kind(), frame)?;
    Ok(vec![adapter.normalize(input)?])
}

/// Decodes a JSON frame into a native message.
pub(crate) fn decode<T: DeserializeOwned>(kind: SourceKind, frame: &[u8]) -> Result<T> {
    serde_json::from_slice(frame)
        .map_err(|e| IngestError::unsupported(kind, format!("undecodable frame: {e}")))
}

/// Unwraps a producer body or reports the shape error.
pub(crate) fn require<T>(kind: SourceKind, value: Option<T>, field: &str) -> Result<T> {
    value.ok_or_else(|| IngestError::unsupported(kind, format!("message has no {field}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn undecodable_frame_is_unsupported_shape() {
        let err = AdapterSet.normalize_frame(SourceKind::QueueAmqp, b"not json").unwrap_err();

        assert!(matches!(err, IngestError::UnsupportedShape { kind: SourceKind::QueueAmqp, .. }));
    }

    #[test]
    fn webhook_kinds_take_raw_body() {
        let envelopes =
            AdapterSet.normalize_frame(SourceKind::ScmGithub, br#"{"zen":"hi"}"#).unwrap();

        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0].body().as_ref(), br#"{"zen":"hi"}"#);
        assert_eq!(envelopes[0].kind(), SourceKind::ScmGithub);
    }
}
