//! Queue adapters: AMQP, SQS, NSQ, and Azure Event Hubs.
//!
//! Delivery-semantics fields (delivery mode, message ids, attempts,
//! partition keys) are copied verbatim into metadata. Downstream consumers
//! rely on exact values for idempotent-consumption decisions, so nothing is
//! reformatted here.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{Map, Value};
use sluice_core::{Envelope, Result, SourceKind};

use crate::{require, Normalize};

/// One message delivered by an AMQP broker.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AmqpDelivery {
    /// MIME content type.
    pub content_type: Option<String>,
    /// MIME content encoding.
    pub content_encoding: Option<String>,
    /// Non-persistent (1) or persistent (2).
    pub delivery_mode: Option<u8>,
    /// Priority, 0 to 9.
    pub priority: Option<u8>,
    /// Correlation identifier.
    pub correlation_id: Option<String>,
    /// Reply-to address (RPC).
    pub reply_to: Option<String>,
    /// Expiration spec.
    pub expiration: Option<String>,
    /// Message identifier.
    pub message_id: Option<String>,
    /// Message timestamp.
    pub timestamp: Option<String>,
    /// Message type name.
    #[serde(rename = "type")]
    pub message_type: Option<String>,
    /// Application id.
    pub app_id: Option<String>,
    /// `basic.publish` exchange.
    pub exchange: Option<String>,
    /// `basic.publish` routing key.
    pub routing_key: Option<String>,
    /// Message body.
    pub body: Option<Bytes>,
}

/// Normalizes AMQP deliveries.
#[derive(Debug, Default, Clone, Copy)]
pub struct AmqpAdapter;

impl Normalize for AmqpAdapter {
    type Input = AmqpDelivery;

    fn kind(&self) -> SourceKind {
        SourceKind::QueueAmqp
    }

    fn normalize(&self, input: AmqpDelivery) -> Result<Envelope> {
        let body = require(self.kind(), input.body, "body")?;

        Envelope::builder(self.kind())
            .body(body)
            .metadata_opt("contentType", input.content_type)
            .metadata_opt("contentEncoding", input.content_encoding)
            .metadata_opt("deliveryMode", input.delivery_mode)
            .metadata_opt("priority", input.priority)
            .metadata_opt("correlationId", input.correlation_id)
            .metadata_opt("replyTo", input.reply_to)
            .metadata_opt("expiration", input.expiration)
            .metadata_opt("messageId", input.message_id)
            .metadata_opt("timestamp", input.timestamp)
            .metadata_opt("type", input.message_type)
            .metadata_opt("appId", input.app_id)
            .metadata_opt("exchange", input.exchange)
            .metadata_opt("routingKey", input.routing_key)
            .build()
    }
}

/// Typed SQS message attribute.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SqsAttribute {
    /// `String`, `Number`, `Binary`, or a custom subtype.
    pub data_type: String,
    /// Value for string and number attributes.
    pub string_value: Option<String>,
    /// Value for binary attributes.
    pub binary_value: Option<Bytes>,
}

/// One message received from an SQS queue.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SqsMessage {
    /// Unique message identifier.
    pub message_id: Option<String>,
    /// Message attributes by name.
    #[serde(default)]
    pub message_attributes: BTreeMap<String, SqsAttribute>,
    /// Message contents (not URL-encoded).
    pub body: Option<Bytes>,
}

/// Normalizes SQS messages.
#[derive(Debug, Default, Clone, Copy)]
pub struct SqsAdapter;

impl Normalize for SqsAdapter {
    type Input = SqsMessage;

    fn kind(&self) -> SourceKind {
        SourceKind::QueueSqs
    }

    fn normalize(&self, input: SqsMessage) -> Result<Envelope> {
        let body = require(self.kind(), input.body, "body")?;

        let attributes = (!input.message_attributes.is_empty()).then(|| {
            input
                .message_attributes
                .into_iter()
                .map(|(name, attr)| {
                    let mut value = Map::new();
                    value.insert("dataType".into(), Value::String(attr.data_type));
                    if let Some(s) = attr.string_value {
                        value.insert("stringValue".into(), Value::String(s));
                    }
                    if let Some(b) = attr.binary_value {
                        value.insert("binaryValue".into(), Value::String(STANDARD.encode(b)));
                    }
                    (name, Value::Object(value))
                })
                .collect::<Map<_, _>>()
        });

        Envelope::builder(self.kind())
            .body(body)
            .metadata_opt("messageId", input.message_id)
            .metadata_opt("messageAttributes", attributes)
            .build()
    }
}

/// One message consumed from an NSQ topic.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NsqMessage {
    /// Message id assigned by nsqd.
    pub id: Option<String>,
    /// Message data.
    pub body: Option<Bytes>,
    /// Publish timestamp, nanoseconds since the epoch.
    pub timestamp: Option<i64>,
    /// Delivery attempts so far.
    pub attempts: Option<u16>,
    /// Address of the nsqd host that delivered the message.
    pub nsqd_address: Option<String>,
}

/// Normalizes NSQ messages.
#[derive(Debug, Default, Clone, Copy)]
pub struct NsqAdapter;

impl Normalize for NsqAdapter {
    type Input = NsqMessage;

    fn kind(&self) -> SourceKind {
        SourceKind::QueueNsq
    }

    fn normalize(&self, input: NsqMessage) -> Result<Envelope> {
        let body = require(self.kind(), input.body, "body")?;

        Envelope::builder(self.kind())
            .body(body)
            .metadata_opt("id", input.id)
            .metadata_opt("timestamp", input.timestamp)
            .metadata_opt("attempts", input.attempts)
            .metadata_opt("nsqdAddress", input.nsqd_address)
            .build()
    }
}

/// One event received from an Azure Event Hub partition.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AzureEventHubEvent {
    /// Event id.
    pub id: Option<String>,
    /// Partition key the event was published with.
    pub partition_key: Option<String>,
    /// Sequence number within the partition.
    pub sequence_number: Option<i64>,
    /// Event body.
    pub body: Option<Bytes>,
}

/// Normalizes Azure Event Hub events.
#[derive(Debug, Default, Clone, Copy)]
pub struct AzureEventHubAdapter;

impl Normalize for AzureEventHubAdapter {
    type Input = AzureEventHubEvent;

    fn kind(&self) -> SourceKind {
        SourceKind::HubAzureEventHub
    }

    fn normalize(&self, input: AzureEventHubEvent) -> Result<Envelope> {
        let body = require(self.kind(), input.body, "body")?;

        Envelope::builder(self.kind())
            .body(body)
            .metadata_opt("id", input.id)
            .metadata_opt("partitionKey", input.partition_key)
            .metadata_opt("sequenceNumber", input.sequence_number)
            .build()
    }
}
