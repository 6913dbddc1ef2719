//! Stream adapters: Kafka, MQTT, and NATS.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use sluice_core::{Envelope, Result, SourceKind};

use crate::{require, Normalize};

/// One record consumed from a Kafka partition.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KafkaRecord {
    /// Topic the record was read from.
    pub topic: Option<String>,
    /// Partition within the topic.
    pub partition: Option<i32>,
    /// Offset within the partition.
    pub offset: Option<i64>,
    /// Record key, if the producer set one.
    pub key: Option<String>,
    /// Record value.
    pub value: Option<Bytes>,
    /// Broker or producer timestamp.
    pub timestamp: Option<DateTime<Utc>>,
}

/// Normalizes Kafka records.
#[derive(Debug, Default, Clone, Copy)]
pub struct KafkaAdapter;

impl Normalize for KafkaAdapter {
    type Input = KafkaRecord;

    fn kind(&self) -> SourceKind {
        SourceKind::StreamKafka
    }

    fn normalize(&self, input: KafkaRecord) -> Result<Envelope> {
        let topic = require(self.kind(), input.topic, "topic")?;
        let value = require(self.kind(), input.value, "value")?;

        Envelope::builder(self.kind())
            .body(value)
            .metadata("topic", topic)
            .metadata_opt("partition", input.partition)
            .metadata_opt("offset", input.offset)
            .metadata_opt("key", input.key)
            .metadata_opt("timestamp", input.timestamp.map(|t| t.to_rfc3339()))
            .build()
    }
}

/// One message received on an MQTT subscription.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MqttMessage {
    /// Topic name.
    pub topic: Option<String>,
    /// Packet identifier.
    pub message_id: Option<u16>,
    /// Application payload.
    pub payload: Option<Bytes>,
}

/// Normalizes MQTT messages.
#[derive(Debug, Default, Clone, Copy)]
pub struct MqttAdapter;

impl Normalize for MqttAdapter {
    type Input = MqttMessage;

    fn kind(&self) -> SourceKind {
        SourceKind::StreamMqtt
    }

    fn normalize(&self, input: MqttMessage) -> Result<Envelope> {
        let payload = require(self.kind(), input.payload, "payload")?;

        Envelope::builder(self.kind())
            .body(payload)
            .metadata_opt("topic", input.topic)
            .metadata_opt("messageId", input.message_id)
            .build()
    }
}

/// One message received on a NATS subject.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NatsMessage {
    /// Subject the message was published to.
    pub subject: Option<String>,
    /// Message data.
    pub data: Option<Bytes>,
}

/// Normalizes NATS messages.
#[derive(Debug, Default, Clone, Copy)]
pub struct NatsAdapter;

impl Normalize for NatsAdapter {
    type Input = NatsMessage;

    fn kind(&self) -> SourceKind {
        SourceKind::StreamNats
    }

    fn normalize(&self, input: NatsMessage) -> Result<Envelope> {
        let data = require(self.kind(), input.data, "data")?;

        Envelope::builder(self.kind()).body(data).metadata_opt("subject", input.subject).build()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use sluice_core::IngestError;

    use super::*;

    #[test]
    fn kafka_record_carries_partition_and_offset() {
        let record: KafkaRecord = serde_json::from_value(json!({
            "topic": "orders",
            "partition": 3,
            "offset": 42,
            "value": "{\"id\":1}",
            "timestamp": "2024-05-01T12:00:00Z"
        }))
        .unwrap();

        let envelope = KafkaAdapter.normalize(record).unwrap();

        assert_eq!(envelope.body().as_ref(), br#"{"id":1}"#);
        assert_eq!(envelope.metadata().get_str("topic"), Some("orders"));
        assert_eq!(envelope.metadata().get("partition"), Some(&json!(3)));
        assert_eq!(envelope.metadata().get("offset"), Some(&json!(42)));
        assert_eq!(envelope.metadata().get_str("timestamp"), Some("2024-05-01T12:00:00+00:00"));
        assert!(!envelope.metadata().contains_key("key"));
    }

    #[test]
    fn kafka_record_without_value_is_unsupported() {
        let record = KafkaRecord { topic: Some("orders".into()), ..KafkaRecord::default() };

        let err = KafkaAdapter.normalize(record).unwrap_err();

        assert!(matches!(err, IngestError::UnsupportedShape { kind: SourceKind::StreamKafka, .. }));
    }

    #[test]
    fn kafka_record_without_topic_is_unsupported() {
        let record = KafkaRecord { value: Some(Bytes::from_static(b"x")), ..KafkaRecord::default() };

        assert!(KafkaAdapter.normalize(record).is_err());
    }

    #[test]
    fn mqtt_maps_topic_and_packet_id() {
        let message = MqttMessage {
            topic: Some("sensors/temp".into()),
            message_id: Some(17),
            payload: Some(Bytes::from_static(b"21.5")),
        };

        let envelope = MqttAdapter.normalize(message).unwrap();

        assert_eq!(envelope.metadata().get_str("topic"), Some("sensors/temp"));
        assert_eq!(envelope.metadata().get("messageId"), Some(&json!(17)));
    }

    #[test]
    fn nats_maps_subject() {
        let message =
            NatsMessage { subject: Some("jobs.created".into()), data: Some(Bytes::from_static(b"{}")) };

        let envelope = NatsAdapter.normalize(message).unwrap();

        assert_eq!(envelope.kind(), SourceKind::StreamNats);
        assert_eq!(envelope.metadata().get_str("subject"), Some("jobs.created"));
    }
}
