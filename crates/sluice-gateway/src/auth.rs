//! Provider authentication for inbound webhook requests.
//!
//! Runs before any adapter sees the body. Every comparison against the
//! shared secret is constant-time.

use axum::http::HeaderMap;
use sluice_core::{IngestError, Result, SecretValue};

use crate::crypto::{timing_safe_eq, validate_signature};

/// How a listener authenticates requests.
#[derive(Debug, Clone)]
pub enum Authenticator {
    /// GitLab: `X-Gitlab-Token` equals the shared token.
    GitlabToken(SecretValue),
    /// GitHub: `X-Hub-Signature-256` is the HMAC-SHA256 of the body.
    GithubSignature(SecretValue),
    /// Generic: `Authorization: Bearer <token>`.
    Bearer(SecretValue),
}

impl Authenticator {
    /// Verifies one request.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::AuthFailed`] when the credential is missing or
    /// wrong.
    pub fn verify(&self, headers: &HeaderMap, body: &[u8]) -> Result<()> {
        match self {
            Self::GitlabToken(token) => {
                let presented = header(headers, "x-gitlab-token")
                    .ok_or_else(|| failed("missing X-Gitlab-Token"))?;
                if timing_safe_eq(presented.as_bytes(), token.as_bytes()) {
                    Ok(())
                } else {
                    Err(failed("invalid X-Gitlab-Token"))
                }
            },
            Self::GithubSignature(secret) => {
                let signature = header(headers, "x-hub-signature-256")
                    .ok_or_else(|| failed("missing X-Hub-Signature-256"))?;
                validate_signature(body, signature, secret.as_bytes())
                    .map_err(|e| failed(&format!("X-Hub-Signature-256: {e}")))
            },
            Self::Bearer(token) => {
                let presented = header(headers, "authorization")
                    .and_then(|value| value.strip_prefix("Bearer "))
                    .ok_or_else(|| failed("missing bearer token"))?;
                if timing_safe_eq(presented.trim().as_bytes(), token.as_bytes()) {
                    Ok(())
                } else {
                    Err(failed("invalid bearer token"))
                }
            },
        }
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn failed(reason: &str) -> IngestError {
    IngestError::AuthFailed { reason: reason.to_string() }
}
