//! Webhook adapters: GitHub, GitLab, and generic HTTP.
//!
//! The body is the request body byte-for-byte. Authentication has already
//! happened in the listener, so credential-bearing headers are dropped before
//! the remaining headers are recorded as metadata.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::de::IgnoredAny;
use serde_json::{Map, Value};
use sluice_core::{Envelope, IngestError, Result, SourceKind};

use crate::Normalize;

/// Headers that carry provider credentials and never reach metadata.
pub const CREDENTIAL_HEADERS: [&str; 4] =
    ["authorization", "x-gitlab-token", "x-hub-signature", "x-hub-signature-256"];

/// An authenticated inbound webhook request.
#[derive(Debug, Clone, Default)]
pub struct HttpPayload {
    headers: BTreeMap<String, String>,
    body: Bytes,
}

impl HttpPayload {
    /// Creates a payload. Header names are lowercased.
    pub fn new<K, V>(headers: impl IntoIterator<Item = (K, V)>, body: impl Into<Bytes>) -> Self
    where
        K: AsRef<str>,
        V: Into<String>,
    {
        let headers =
            headers.into_iter().map(|(k, v)| (k.as_ref().to_ascii_lowercase(), v.into())).collect();
        Self { headers, body: body.into() }
    }

    /// Creates a payload with no headers.
    pub fn from_body(body: impl Into<Bytes>) -> Self {
        Self { headers: BTreeMap::new(), body: body.into() }
    }

    /// Header value by lowercase name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Raw request body.
    pub fn body(&self) -> &Bytes {
        &self.body
    }
}

fn webhook_envelope(kind: SourceKind, payload: HttpPayload) -> Result<Envelope> {
    if payload.body.is_empty() {
        return Err(IngestError::unsupported(kind, "request body is empty"));
    }
    serde_json::from_slice::<IgnoredAny>(&payload.body)
        .map_err(|e| IngestError::unsupported(kind, format!("request body is not JSON: {e}")))?;

    let headers: Map<String, Value> = payload
        .headers
        .into_iter()
        .filter(|(name, _)| !CREDENTIAL_HEADERS.contains(&name.as_str()))
        .map(|(name, value)| (name, Value::String(value)))
        .collect();

    Envelope::builder(kind)
        .body(payload.body)
        .metadata_opt("headers", (!headers.is_empty()).then_some(headers))
        .build()
}

/// Normalizes GitHub repository webhooks.
#[derive(Debug, Default, Clone, Copy)]
pub struct GithubAdapter;

impl Normalize for GithubAdapter {
    type Input = HttpPayload;

    fn kind(&self) -> SourceKind {
        SourceKind::ScmGithub
    }

    fn normalize(&self, input: HttpPayload) -> Result<Envelope> {
        webhook_envelope(self.kind(), input)
    }
}

/// Normalizes GitLab project webhooks.
#[derive(Debug, Default, Clone, Copy)]
pub struct GitlabAdapter;

impl Normalize for GitlabAdapter {
    type Input = HttpPayload;

    fn kind(&self) -> SourceKind {
        SourceKind::ScmGitlab
    }

    fn normalize(&self, input: HttpPayload) -> Result<Envelope> {
        webhook_envelope(self.kind(), input)
    }
}

/// Normalizes generic bearer-authenticated webhooks.
#[derive(Debug, Default, Clone, Copy)]
pub struct GenericWebhookAdapter;

impl Normalize for GenericWebhookAdapter {
    type Input = HttpPayload;

    fn kind(&self) -> SourceKind {
        SourceKind::GenericWebhook
    }

    fn normalize(&self, input: HttpPayload) -> Result<Envelope> {
        webhook_envelope(self.kind(), input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PUSH: &[u8] = br#"{"object_kind":"push","ref":"refs/heads/main"}"#;

    #[test]
    fn gitlab_body_is_passed_through_unmodified() {
        let payload = HttpPayload::new([("X-Gitlab-Event", "Push Hook")], PUSH);

        let envelope = GitlabAdapter.normalize(payload).unwrap();

        assert_eq!(envelope.kind(), SourceKind::ScmGitlab);
        assert_eq!(envelope.body().as_ref(), PUSH);
        assert_eq!(
            envelope.metadata().get("headers"),
            Some(&serde_json::json!({"x-gitlab-event": "Push Hook"}))
        );
    }

    #[test]
    fn credential_headers_are_stripped() {
        let payload = HttpPayload::new(
            [
                ("X-Gitlab-Token", "s3cret"),
                ("Authorization", "Bearer abc"),
                ("X-Hub-Signature-256", "sha256=00"),
                ("Content-Type", "application/json"),
            ],
            PUSH,
        );

        let envelope = GithubAdapter.normalize(payload).unwrap();
        let headers = envelope.metadata().get("headers").unwrap().as_object().unwrap();

        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("content-type"));
    }

    #[test]
    fn empty_body_is_unsupported() {
        let err = GenericWebhookAdapter.normalize(HttpPayload::from_body(Vec::new())).unwrap_err();

        assert!(matches!(err, IngestError::UnsupportedShape { kind: SourceKind::GenericWebhook, .. }));
    }

    #[test]
    fn non_json_body_is_unsupported() {
        let err = GitlabAdapter.normalize(HttpPayload::from_body("ref=main")).unwrap_err();

        assert!(err.to_string().contains("not JSON"));
    }

    #[test]
    fn header_lookup_is_case_insensitive_on_input() {
        let payload = HttpPayload::new([("X-GitHub-Event", "push")], PUSH);

        assert_eq!(payload.header("x-github-event"), Some("push"));
    }
}
