//! Error taxonomy for event ingestion.
//!
//! Each variant carries a stable code so operators and clients can tell
//! failures apart without parsing messages. Configuration and bind errors
//! are fatal for one source only; request-scoped errors (authentication,
//! shape) are surfaced as HTTP statuses and never escalated.

use thiserror::Error;

use crate::envelope::{EnvelopeId, SourceKind};

/// Result type alias using [`IngestError`].
pub type Result<T> = std::result::Result<T, IngestError>;

/// Ingestion error types with codes.
#[derive(Debug, Error)]
pub enum IngestError {
    // Source errors (E1001-E1005)
    /// Source configuration rejected (E1001).
    #[error("[E1001] Invalid configuration for source '{source_name}': {reason}")]
    ConfigInvalid {
        /// Name of the offending source
        source_name: String,
        /// What was wrong with it
        reason: String,
    },

    /// Inbound request failed authenticity verification (E1002).
    #[error("[E1002] Authentication failed: {reason}")]
    AuthFailed {
        /// Why the request was not trusted
        reason: String,
    },

    /// Adapter could not parse producer input into a body (E1003).
    #[error("[E1003] Unsupported shape for {kind}: {reason}")]
    UnsupportedShape {
        /// Adapter that rejected the input
        kind: SourceKind,
        /// Parse failure description
        reason: String,
    },

    /// Envelope construction without a body (E1004).
    #[error("[E1004] Malformed payload for {kind}: {reason}")]
    MalformedPayload {
        /// Adapter that attempted construction
        kind: SourceKind,
        /// Violated envelope invariant
        reason: String,
    },

    /// Inbound body exceeds the listener limit (E1005).
    #[error("[E1005] Payload too large: size {size_bytes} bytes exceeds {limit_bytes} byte limit")]
    PayloadTooLarge {
        /// Size of the rejected body
        size_bytes: usize,
        /// Configured limit
        limit_bytes: usize,
    },

    // Delivery errors (E2001-E2002)
    /// Delivery collaborator rejected an accepted envelope (E2001).
    #[error("[E2001] Delivery failed for {kind} envelope {envelope_id}: {reason}")]
    DeliveryFailed {
        /// Envelope that was lost
        envelope_id: EnvelopeId,
        /// Producer kind, for diagnostics
        kind: SourceKind,
        /// Sink error
        reason: String,
    },

    /// Provider hook registration failed (E2002).
    #[error("[E2002] Registration failed for source '{source_name}': {reason}")]
    Registration {
        /// Source whose hook could not be registered
        source_name: String,
        /// Provider error
        reason: String,
    },

    // System errors (E3001)
    /// Listener socket could not be bound (E3001).
    #[error("[E3001] Failed to bind {addr}: {reason}")]
    Bind {
        /// Address that was requested
        addr: String,
        /// OS error
        reason: String,
    },
}

impl IngestError {
    /// Returns the error code.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::ConfigInvalid { .. } => "E1001",
            Self::AuthFailed { .. } => "E1002",
            Self::UnsupportedShape { .. } => "E1003",
            Self::MalformedPayload { .. } => "E1004",
            Self::PayloadTooLarge { .. } => "E1005",
            Self::DeliveryFailed { .. } => "E2001",
            Self::Registration { .. } => "E2002",
            Self::Bind { .. } => "E3001",
        }
    }

    /// Whether this error prevents a source from starting.
    pub const fn is_fatal_for_source(&self) -> bool {
        matches!(self, Self::ConfigInvalid { .. } | Self::Bind { .. })
    }

    /// Shorthand for a configuration error.
    pub fn config(source_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConfigInvalid { source_name: source_name.into(), reason: reason.into() }
    }

    /// Shorthand for an adapter shape error.
    pub fn unsupported(kind: SourceKind, reason: impl Into<String>) -> Self {
        Self::UnsupportedShape { kind, reason: reason.into() }
    }
}
