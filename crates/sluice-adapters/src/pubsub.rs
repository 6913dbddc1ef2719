//! Pub/sub adapters: SNS, Google Cloud Pub/Sub, Redis, and Minio bucket
//! notifications.
//!
//! Minio is the only adapter that fans out: one notification can carry
//! several records, and each becomes its own envelope.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::Deserialize;
use serde_json::Value;
use sluice_core::{Envelope, IngestError, Result, SourceKind};

use crate::{require, Normalize};

/// SNS HTTP(S) notification document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SnsNotification {
    /// `Notification`, `SubscriptionConfirmation`, ...
    #[serde(rename = "Type")]
    pub notification_type: Option<String>,
    /// Unique id of the published message.
    pub message_id: Option<String>,
    /// Topic the message was published to.
    pub topic_arn: Option<String>,
    /// Optional subject line.
    pub subject: Option<String>,
    /// Message payload.
    pub message: Option<String>,
    /// Publish time, as sent by SNS.
    pub timestamp: Option<String>,
    /// Message attributes (`{"Type": .., "Value": ..}` per name).
    #[serde(default)]
    pub message_attributes: BTreeMap<String, Value>,
}

/// Normalizes SNS notifications.
#[derive(Debug, Default, Clone, Copy)]
pub struct SnsAdapter;

impl Normalize for SnsAdapter {
    type Input = SnsNotification;

    fn kind(&self) -> SourceKind {
        SourceKind::PubsubSns
    }

    fn normalize(&self, input: SnsNotification) -> Result<Envelope> {
        let message = require(self.kind(), input.message, "Message")?;
        let attributes = (!input.message_attributes.is_empty())
            .then(|| input.message_attributes.into_iter().collect::<serde_json::Map<_, _>>());

        Envelope::builder(self.kind())
            .body(message)
            .metadata_opt("type", input.notification_type)
            .metadata_opt("messageId", input.message_id)
            .metadata_opt("topicArn", input.topic_arn)
            .metadata_opt("subject", input.subject)
            .metadata_opt("timestamp", input.timestamp)
            .metadata_opt("messageAttributes", attributes)
            .build()
    }
}

/// One message pulled from a Google Cloud Pub/Sub subscription.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GcpPubsubMessage {
    /// Server-assigned message id.
    #[serde(alias = "messageId")]
    pub id: Option<String>,
    /// Message data.
    #[serde(alias = "data")]
    pub body: Option<Bytes>,
    /// Publisher-supplied attributes.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    /// When the server received the message.
    pub publish_time: Option<String>,
}

/// Normalizes Google Cloud Pub/Sub messages.
#[derive(Debug, Default, Clone, Copy)]
pub struct GcpPubsubAdapter;

impl Normalize for GcpPubsubAdapter {
    type Input = GcpPubsubMessage;

    fn kind(&self) -> SourceKind {
        SourceKind::PubsubGcp
    }

    fn normalize(&self, input: GcpPubsubMessage) -> Result<Envelope> {
        let body = require(self.kind(), input.body, "body")?;
        let attributes = (!input.attributes.is_empty()).then(|| {
            input
                .attributes
                .into_iter()
                .map(|(k, v)| (k, Value::String(v)))
                .collect::<serde_json::Map<_, _>>()
        });

        Envelope::builder(self.kind())
            .body(body)
            .metadata_opt("id", input.id)
            .metadata_opt("attributes", attributes)
            .metadata_opt("publishTime", input.publish_time)
            .build()
    }
}

/// One message received on a Redis channel subscription.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RedisMessage {
    /// Channel the message was published on.
    pub channel: Option<String>,
    /// Pattern that matched, for `PSUBSCRIBE`.
    pub pattern: Option<String>,
    /// Message payload.
    pub payload: Option<String>,
}

/// Normalizes Redis pub/sub messages.
#[derive(Debug, Default, Clone, Copy)]
pub struct RedisAdapter;

impl Normalize for RedisAdapter {
    type Input = RedisMessage;

    fn kind(&self) -> SourceKind {
        SourceKind::PubsubRedis
    }

    fn normalize(&self, input: RedisMessage) -> Result<Envelope> {
        let payload = require(self.kind(), input.payload, "payload")?;

        Envelope::builder(self.kind())
            .body(payload)
            .metadata_opt("channel", input.channel)
            .metadata_opt("pattern", input.pattern.filter(|p| !p.is_empty()))
            .build()
    }
}

/// Minio bucket notification, as delivered by `ListenBucketNotification`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MinioNotification {
    /// S3-style event records.
    #[serde(alias = "Records")]
    pub notification: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MinioRecord {
    event_name: String,
    event_time: Option<String>,
    s3: MinioS3,
}

#[derive(Debug, Deserialize)]
struct MinioS3 {
    bucket: MinioBucket,
    object: MinioObject,
}

#[derive(Debug, Deserialize)]
struct MinioBucket {
    name: String,
}

#[derive(Debug, Deserialize)]
struct MinioObject {
    key: String,
}

/// Normalizes Minio bucket notifications, one envelope per record.
#[derive(Debug, Default, Clone, Copy)]
pub struct MinioAdapter;

impl MinioAdapter {
    /// Kind stamped on every Minio envelope.
    pub const fn kind(&self) -> SourceKind {
        SourceKind::ObjectStoreMinio
    }

    /// Produces one envelope per record.
    ///
    /// All-or-nothing: if any record is malformed no envelope is returned.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::UnsupportedShape`] for an empty notification or
    /// any record missing its event name, bucket, or object key.
    pub fn fan_out(&self, input: MinioNotification) -> Result<Vec<Envelope>> {
        if input.notification.is_empty() {
            return Err(IngestError::unsupported(self.kind(), "notification has no records"));
        }

        input
            .notification
            .into_iter()
            .enumerate()
            .map(|(index, record)| self.record(index, record))
            .collect()
    }

    fn record(&self, index: usize, raw: Value) -> Result<Envelope> {
        let body = serde_json::to_vec(&raw)
            .map_err(|e| IngestError::unsupported(self.kind(), format!("record {index}: {e}")))?;
        let record: MinioRecord = serde_json::from_value(raw)
            .map_err(|e| IngestError::unsupported(self.kind(), format!("record {index}: {e}")))?;

        Envelope::builder(self.kind())
            .body(body)
            .metadata("eventName", record.event_name)
            .metadata("bucket", record.s3.bucket.name)
            .metadata("key", record.s3.object.key)
            .metadata_opt("eventTime", record.event_time)
            .build()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn minio_record(key: &str) -> Value {
        json!({
            "eventName": "s3:ObjectCreated:Put",
            "eventTime": "2024-05-01T12:00:00.000Z",
            "s3": { "bucket": { "name": "uploads" }, "object": { "key": key, "size": 12 } }
        })
    }

    #[test]
    fn sns_message_becomes_body() {
        let notification: SnsNotification = serde_json::from_value(json!({
            "Type": "Notification",
            "MessageId": "22b80b92-fdea-4c2c-8f9d-bdfb0c7bf324",
            "TopicArn": "arn:aws:sns:us-west-2:123456789012:MyTopic",
            "Message": "hello from sns",
            "Timestamp": "2012-05-02T00:54:06.655Z"
        }))
        .unwrap();

        let envelope = SnsAdapter.normalize(notification).unwrap();

        assert_eq!(envelope.body().as_ref(), b"hello from sns");
        assert_eq!(
            envelope.metadata().get_str("topicArn"),
            Some("arn:aws:sns:us-west-2:123456789012:MyTopic")
        );
        assert!(!envelope.metadata().contains_key("messageAttributes"));
    }

    #[test]
    fn sns_without_message_is_unsupported() {
        let err = SnsAdapter.normalize(SnsNotification::default()).unwrap_err();
        assert!(err.to_string().contains("message has no Message"));
    }

    #[test]
    fn gcp_attributes_kept_as_strings() {
        let message = GcpPubsubMessage {
            id: Some("123".into()),
            body: Some(Bytes::from_static(b"payload")),
            attributes: BTreeMap::from([("origin".to_string(), "billing".to_string())]),
            publish_time: Some("2024-05-01T12:00:00Z".into()),
        };

        let envelope = GcpPubsubAdapter.normalize(message).unwrap();

        assert_eq!(envelope.metadata().get("attributes"), Some(&json!({"origin": "billing"})));
        assert_eq!(envelope.metadata().get_str("publishTime"), Some("2024-05-01T12:00:00Z"));
    }

    #[test]
    fn redis_empty_pattern_is_omitted() {
        let message = RedisMessage {
            channel: Some("events".into()),
            pattern: Some(String::new()),
            payload: Some("ping".into()),
        };

        let envelope = RedisAdapter.normalize(message).unwrap();

        assert_eq!(envelope.metadata().get_str("channel"), Some("events"));
        assert!(!envelope.metadata().contains_key("pattern"));
    }

    #[test]
    fn minio_fans_out_one_envelope_per_record() {
        let notification = MinioNotification { notification: vec![minio_record("a.txt"), minio_record("b.txt")] };

        let envelopes = MinioAdapter.fan_out(notification).unwrap();

        assert_eq!(envelopes.len(), 2);
        assert_eq!(envelopes[0].metadata().get_str("key"), Some("a.txt"));
        assert_eq!(envelopes[1].metadata().get_str("key"), Some("b.txt"));
        assert_eq!(envelopes[0].metadata().get_str("bucket"), Some("uploads"));

        let body: Value = serde_json::from_slice(envelopes[1].body()).unwrap();
        assert_eq!(body, minio_record("b.txt"));
    }

    #[test]
    fn minio_bad_record_fails_whole_notification() {
        let notification =
            MinioNotification { notification: vec![minio_record("a.txt"), json!({"eventName": "x"})] };

        let err = MinioAdapter.fan_out(notification).unwrap_err();

        assert!(matches!(err, IngestError::UnsupportedShape { kind: SourceKind::ObjectStoreMinio, .. }));
        assert!(err.to_string().contains("record 1"));
    }

    #[test]
    fn minio_empty_notification_is_unsupported() {
        assert!(MinioAdapter.fan_out(MinioNotification::default()).is_err());
    }

    #[test]
    fn minio_accepts_s3_records_field() {
        let notification: MinioNotification =
            serde_json::from_value(json!({ "Records": [minio_record("c.txt")] })).unwrap();

        assert_eq!(MinioAdapter.fan_out(notification).unwrap().len(), 1);
    }
}
