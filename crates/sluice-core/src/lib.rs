//! Core domain types for event normalization.
//!
//! Provides the canonical [`Envelope`] every producer adapter emits, the
//! error taxonomy shared across the ingestion pipeline, and the traits for
//! the two external collaborators this layer depends on: secret lookup and
//! envelope delivery.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod delivery;
pub mod envelope;
pub mod error;
pub mod secrets;

pub use delivery::{hand_off, ChannelSink, EnvelopeSink, SinkError};
pub use envelope::{Envelope, EnvelopeBuilder, EnvelopeId, Metadata, SourceKind};
pub use error::{IngestError, Result};
pub use secrets::{FileSecrets, InMemorySecrets, SecretError, SecretRef, SecretResolver, SecretValue};
