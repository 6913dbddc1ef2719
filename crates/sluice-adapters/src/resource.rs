//! Cluster resource watch adapter.

use std::fmt;

use serde::Deserialize;
use serde_json::Value;
use sluice_core::{Envelope, IngestError, Result, SourceKind};

use crate::{require, Normalize};

/// What happened to the watched resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ResourceEventType {
    /// Resource created.
    #[serde(alias = "ADDED", alias = "ADD", alias = "add")]
    #[serde(rename = "added")]
    Added,
    /// Resource changed.
    #[serde(alias = "MODIFIED", alias = "UPDATE", alias = "update")]
    #[serde(rename = "modified")]
    Modified,
    /// Resource removed.
    #[serde(alias = "DELETED", alias = "DELETE", alias = "delete")]
    #[serde(rename = "deleted")]
    Deleted,
}

impl ResourceEventType {
    /// Lowercase name stored in metadata.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Modified => "modified",
            Self::Deleted => "deleted",
        }
    }
}

impl fmt::Display for ResourceEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One notification from a resource watch.
#[derive(Debug, Clone, Deserialize)]
pub struct ResourceEvent {
    /// Change type.
    #[serde(rename = "type")]
    pub event_type: ResourceEventType,
    /// API group; empty for the core group.
    #[serde(default)]
    pub group: String,
    /// API version.
    pub version: String,
    /// Plural resource name, e.g. `deployments`.
    pub resource: String,
    /// Resource state after (or, for deletes, before) the change.
    pub body: Option<Value>,
}

/// Normalizes resource watch notifications.
#[derive(Debug, Default, Clone, Copy)]
pub struct ResourceWatchAdapter;

impl Normalize for ResourceWatchAdapter {
    type Input = ResourceEvent;

    fn kind(&self) -> SourceKind {
        SourceKind::ResourceWatch
    }

    fn normalize(&self, input: ResourceEvent) -> Result<Envelope> {
        let state = require(self.kind(), input.body, "body")?;
        if !state.is_object() {
            return Err(IngestError::unsupported(self.kind(), "resource body is not an object"));
        }
        let body = serde_json::to_vec(&state)
            .map_err(|e| IngestError::unsupported(self.kind(), e.to_string()))?;

        Envelope::builder(self.kind())
            .body(body)
            .metadata("type", input.event_type.as_str())
            .metadata("group", input.group)
            .metadata("version", input.version)
            .metadata("resource", input.resource)
            .build()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn deployment_update_is_normalized() {
        let event: ResourceEvent = serde_json::from_value(json!({
            "type": "UPDATE",
            "group": "apps",
            "version": "v1",
            "resource": "deployments",
            "body": { "metadata": { "name": "web" }, "spec": { "replicas": 3 } }
        }))
        .unwrap();

        let envelope = ResourceWatchAdapter.normalize(event).unwrap();

        assert_eq!(envelope.metadata().get_str("type"), Some("modified"));
        assert_eq!(envelope.metadata().get_str("group"), Some("apps"));
        let body: Value = serde_json::from_slice(envelope.body()).unwrap();
        assert_eq!(body["spec"]["replicas"], json!(3));
    }

    #[test]
    fn core_group_defaults_to_empty() {
        let event: ResourceEvent = serde_json::from_value(json!({
            "type": "added",
            "version": "v1",
            "resource": "configmaps",
            "body": {}
        }))
        .unwrap();

        let envelope = ResourceWatchAdapter.normalize(event).unwrap();

        assert_eq!(envelope.metadata().get_str("group"), Some(""));
    }

    #[test]
    fn missing_or_scalar_body_is_unsupported() {
        let base = ResourceEvent {
            event_type: ResourceEventType::Deleted,
            group: String::new(),
            version: "v1".into(),
            resource: "pods".into(),
            body: None,
        };

        assert!(ResourceWatchAdapter.normalize(base.clone()).is_err());
        assert!(ResourceWatchAdapter.normalize(ResourceEvent { body: Some(json!(42)), ..base }).is_err());
    }

    #[test]
    fn unknown_event_type_fails_to_decode() {
        let result = serde_json::from_value::<ResourceEvent>(json!({
            "type": "patched", "version": "v1", "resource": "pods", "body": {}
        }));

        assert!(result.is_err());
    }
}
