//! Test infrastructure for Sluice.
//!
//! Provides recording, failing, and blocking delivery sinks plus sample
//! producer frames for every supported [`SourceKind`].
//!
//! [`SourceKind`]: sluice_core::SourceKind

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod fixtures;
pub mod sinks;

pub use fixtures::{free_port, gitlab_push_body, sample_frame};
pub use sinks::{BlockingSink, FailingSink, RecordingSink};
