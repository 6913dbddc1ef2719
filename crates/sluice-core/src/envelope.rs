//! Canonical event envelope and producer identification.
//!
//! Every adapter converts its producer-native payload into an [`Envelope`].
//! The envelope is immutable once built: fields are private, there are only
//! read accessors, and it is deliberately not `Clone` so ownership moves
//! through the pipeline instead of being shared.

use std::{collections::BTreeMap, fmt, str::FromStr};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{IngestError, Result};

/// Identifies which adapter produced an envelope.
///
/// Wire names are stable and used in logs, metrics labels, and by the
/// downstream trigger engine to interpret the body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SourceKind {
    /// AMQP broker (RabbitMQ and friends).
    #[serde(rename = "queue-amqp")]
    QueueAmqp,
    /// AWS Simple Queue Service.
    #[serde(rename = "queue-sqs")]
    QueueSqs,
    /// NSQ realtime messaging.
    #[serde(rename = "queue-nsq")]
    QueueNsq,
    /// AWS Simple Notification Service.
    #[serde(rename = "pubsub-sns")]
    PubsubSns,
    /// Google Cloud Pub/Sub.
    #[serde(rename = "pubsub-gcp")]
    PubsubGcp,
    /// Redis channel subscription.
    #[serde(rename = "pubsub-redis")]
    PubsubRedis,
    /// Kafka topic consumer.
    #[serde(rename = "stream-kafka")]
    StreamKafka,
    /// MQTT topic subscription.
    #[serde(rename = "stream-mqtt")]
    StreamMqtt,
    /// NATS subject subscription.
    #[serde(rename = "stream-nats")]
    StreamNats,
    /// Azure Event Hubs.
    #[serde(rename = "hub-azureeventhub")]
    HubAzureEventHub,
    /// GitHub repository webhooks.
    #[serde(rename = "scm-github")]
    ScmGithub,
    /// GitLab project webhooks.
    #[serde(rename = "scm-gitlab")]
    ScmGitlab,
    /// Minio bucket notifications.
    #[serde(rename = "object-store-minio")]
    ObjectStoreMinio,
    /// Cluster resource watch.
    #[serde(rename = "resource-watch")]
    ResourceWatch,
    /// Calendar / schedule trigger.
    #[serde(rename = "calendar")]
    Calendar,
    /// Arbitrary authenticated HTTP webhook.
    #[serde(rename = "generic-webhook")]
    GenericWebhook,
}

impl SourceKind {
    /// Every supported producer kind.
    pub const ALL: [Self; 16] = [
        Self::QueueAmqp,
        Self::QueueSqs,
        Self::QueueNsq,
        Self::PubsubSns,
        Self::PubsubGcp,
        Self::PubsubRedis,
        Self::StreamKafka,
        Self::StreamMqtt,
        Self::StreamNats,
        Self::HubAzureEventHub,
        Self::ScmGithub,
        Self::ScmGitlab,
        Self::ObjectStoreMinio,
        Self::ResourceWatch,
        Self::Calendar,
        Self::GenericWebhook,
    ];

    /// Returns the stable wire name.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::QueueAmqp => "queue-amqp",
            Self::QueueSqs => "queue-sqs",
            Self::QueueNsq => "queue-nsq",
            Self::PubsubSns => "pubsub-sns",
            Self::PubsubGcp => "pubsub-gcp",
            Self::PubsubRedis => "pubsub-redis",
            Self::StreamKafka => "stream-kafka",
            Self::StreamMqtt => "stream-mqtt",
            Self::StreamNats => "stream-nats",
            Self::HubAzureEventHub => "hub-azureeventhub",
            Self::ScmGithub => "scm-github",
            Self::ScmGitlab => "scm-gitlab",
            Self::ObjectStoreMinio => "object-store-minio",
            Self::ResourceWatch => "resource-watch",
            Self::Calendar => "calendar",
            Self::GenericWebhook => "generic-webhook",
        }
    }

    /// Whether this producer arrives through an inbound HTTP listener rather
    /// than a subscription loop.
    pub const fn is_webhook(&self) -> bool {
        matches!(self, Self::ScmGithub | Self::ScmGitlab | Self::GenericWebhook)
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown source kind: {s}"))
    }
}

/// Diagnostic identifier attached to every envelope.
///
/// Used only for log correlation; envelopes are never deduplicated on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnvelopeId(pub Uuid);

impl EnvelopeId {
    /// Creates a new random envelope ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EnvelopeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EnvelopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Producer-specific attributes of an envelope.
///
/// Keys are unique and iterate in a deterministic (sorted) order. Each
/// adapter owns a closed set of keys; fields the producer did not supply are
/// omitted rather than stored as null.
#[derive(Debug, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, Value>);

impl Metadata {
    /// Returns the value stored under `key`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Returns the value under `key` if it is a string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// Whether `key` is present.
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Iterates entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Returns the keys in order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no metadata was recorded.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// The canonical normalized event record.
///
/// Constructed exactly once by an adapter through [`Envelope::builder`],
/// then moved through the pipeline until handed to the delivery sink.
#[derive(Debug)]
pub struct Envelope {
    id: EnvelopeId,
    kind: SourceKind,
    body: Bytes,
    metadata: Metadata,
    received_at: DateTime<Utc>,
}

impl Envelope {
    /// Starts building an envelope for the given producer kind.
    pub fn builder(kind: SourceKind) -> EnvelopeBuilder {
        EnvelopeBuilder { kind, body: None, metadata: BTreeMap::new(), duplicate_key: None }
    }

    /// Diagnostic identifier.
    pub fn id(&self) -> EnvelopeId {
        self.id
    }

    /// Producer kind; fixed at construction.
    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    /// Payload in whatever serialization the producer used.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Producer-specific attributes.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// When the adapter constructed this envelope.
    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    /// Consumes the envelope, returning its kind, body, and metadata.
    pub fn into_parts(self) -> (SourceKind, Bytes, Metadata) {
        (self.kind, self.body, self.metadata)
    }
}

/// Builder enforcing the envelope invariants.
///
/// A body must be supplied (it may be empty) and every metadata key may be
/// set at most once.
#[derive(Debug)]
#[must_use]
pub struct EnvelopeBuilder {
    kind: SourceKind,
    body: Option<Bytes>,
    metadata: BTreeMap<String, Value>,
    duplicate_key: Option<String>,
}

impl EnvelopeBuilder {
    /// Sets the payload.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Records a metadata entry.
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let key = key.into();
        if self.metadata.contains_key(&key) {
            self.duplicate_key.get_or_insert(key);
        } else {
            self.metadata.insert(key, value.into());
        }
        self
    }

    /// Records a metadata entry only when the producer supplied a value.
    pub fn metadata_opt<V: Into<Value>>(self, key: impl Into<String>, value: Option<V>) -> Self {
        match value {
            Some(value) => self.metadata(key, value),
            None => self,
        }
    }

    /// Finishes construction.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::MalformedPayload`] if no body was supplied or a
    /// metadata key was set twice.
    pub fn build(self) -> Result<Envelope> {
        if let Some(key) = self.duplicate_key {
            return Err(IngestError::MalformedPayload {
                kind: self.kind,
                reason: format!("duplicate metadata key '{key}'"),
            });
        }

        let Some(body) = self.body else {
            return Err(IngestError::MalformedPayload {
                kind: self.kind,
                reason: "adapter produced no body".to_string(),
            });
        };

        Ok(Envelope {
            id: EnvelopeId::new(),
            kind: self.kind,
            body,
            metadata: Metadata(self.metadata),
            received_at: Utc::now(),
        })
    }
}
