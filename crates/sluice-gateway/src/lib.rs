//! Sluice webhook gateway.
//!
//! Terminates inbound HTTP(S) hook calls from GitLab, GitHub, and generic
//! webhook producers, authenticates them, normalizes the body into an
//! envelope, and hands it to the delivery sink. [`LifecycleManager`] owns
//! listener and port allocation and registers hooks with the provider.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod config;
pub mod crypto;
pub mod listener;
pub mod manager;
pub mod registration;
pub mod retry;
pub mod server;
pub mod tls;

pub use auth::Authenticator;
pub use config::{Config, ProviderConfig, WebhookSource, WebhookSourceConfig};
pub use listener::{ListenerState, RegistrationStatus, WebhookListener};
pub use manager::{ApplyReport, LifecycleManager};
pub use registration::{GithubRegistrar, GitlabRegistrar, HookRegistrar, RegistrationError};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use server::{create_router, PortServer, Route, RouteTable, MAX_PAYLOAD_SIZE};
