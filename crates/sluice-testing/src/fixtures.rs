//! Sample producer frames and small helpers for socket tests.

use serde_json::json;
use sluice_core::SourceKind;

/// GitLab push hook body used across end-to-end tests.
pub fn gitlab_push_body() -> &'static [u8] {
    br#"{"object_kind":"push","ref":"refs/heads/main","checkout_sha":"da1560886d4f094c3e6c9ef40349f7d38b5d27d7","project":{"id":15,"name":"sluice"},"commits":[]}"#
}

/// A well-formed frame for `kind`, as a producer connection would hand it
/// over. Webhook kinds get a raw JSON request body.
pub fn sample_frame(kind: SourceKind) -> Vec<u8> {
    let value = match kind {
        SourceKind::QueueAmqp => json!({
            "contentType": "application/json",
            "deliveryMode": 2,
            "priority": 0,
            "messageId": "amqp-1",
            "exchange": "orders",
            "routingKey": "orders.created",
            "body": "{\"order\":1}"
        }),
        SourceKind::QueueSqs => json!({
            "messageId": "sqs-1",
            "messageAttributes": { "tenant": { "dataType": "String", "stringValue": "acme" } },
            "body": "{\"order\":1}"
        }),
        SourceKind::QueueNsq => json!({
            "body": "{\"order\":1}",
            "timestamp": 1_714_564_800_000_000_000_i64,
            "nsqdAddress": "nsqd:4150"
        }),
        SourceKind::HubAzureEventHub => json!({
            "id": "eh-1",
            "partitionKey": "device-7",
            "body": "{\"temp\":21}"
        }),
        SourceKind::StreamKafka => json!({
            "topic": "orders",
            "partition": 0,
            "offset": 7,
            "value": "{\"order\":1}",
            "timestamp": "2024-05-01T12:00:00Z"
        }),
        SourceKind::StreamMqtt => json!({
            "topic": "sensors/temp",
            "messageId": 1,
            "payload": "21.5"
        }),
        SourceKind::StreamNats => json!({ "subject": "jobs.created", "data": "{\"job\":1}" }),
        SourceKind::PubsubSns => json!({
            "Type": "Notification",
            "MessageId": "sns-1",
            "TopicArn": "arn:aws:sns:us-east-1:123456789012:orders",
            "Message": "{\"order\":1}",
            "Timestamp": "2024-05-01T12:00:00.000Z"
        }),
        SourceKind::PubsubGcp => json!({
            "id": "gcp-1",
            "body": "{\"order\":1}",
            "attributes": { "origin": "billing" },
            "publishTime": "2024-05-01T12:00:00Z"
        }),
        SourceKind::PubsubRedis => json!({ "channel": "orders", "payload": "{\"order\":1}" }),
        SourceKind::ObjectStoreMinio => json!({
            "notification": [{
                "eventName": "s3:ObjectCreated:Put",
                "eventTime": "2024-05-01T12:00:00.000Z",
                "s3": { "bucket": { "name": "uploads" }, "object": { "key": "report.csv" } }
            }]
        }),
        SourceKind::ResourceWatch => json!({
            "type": "added",
            "group": "apps",
            "version": "v1",
            "resource": "deployments",
            "body": { "metadata": { "name": "web" } }
        }),
        SourceKind::Calendar => json!({
            "eventTime": "2024-05-01T09:00:00Z",
            "userPayload": { "report": "daily" }
        }),
        SourceKind::ScmGithub => json!({ "ref": "refs/heads/main", "zen": "Keep it simple." }),
        SourceKind::ScmGitlab => return gitlab_push_body().to_vec(),
        SourceKind::GenericWebhook => json!({ "event": "deploy.finished" }),
    };
    value.to_string().into_bytes()
}

/// Returns a TCP port that was free a moment ago.
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.port())
        .unwrap_or(0)
}
