//! Sluice service wiring.
//!
//! Glues configuration, the secret store, the delivery sink, and the
//! lifecycle manager together for the `sluice` binary.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::{path::Path, sync::Arc};

use anyhow::{Context, Result};
use sluice_core::{Envelope, EnvelopeSink, SecretResolver};
use sluice_gateway::{Config, LifecycleManager};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{info, warn};

/// Envelopes buffered between the listeners and the trigger engine.
pub const ENVELOPE_BUFFER: usize = 1024;

/// Builds the lifecycle manager and starts every configured source.
///
/// Sources that fail to start are logged and skipped; the rest keep
/// serving.
///
/// # Errors
///
/// Returns an error when the webhook configuration as a whole is invalid.
pub async fn start(
    config: &Config,
    secrets: Arc<dyn SecretResolver>,
    sink: Arc<dyn EnvelopeSink>,
) -> Result<LifecycleManager> {
    let mut manager = LifecycleManager::new(config.host.clone(), secrets, sink)
        .with_retry_policy(config.to_retry_policy())
        .with_drain_timeout(config.drain_timeout());

    let report = manager.apply(&config.webhooks).await.context("Webhook configuration rejected")?;
    if !report.is_complete() {
        warn!(failed = report.failed.len(), "some webhook sources failed to start");
    }
    info!(started = report.started.len(), "webhook sources started");

    Ok(manager)
}

/// Re-reads configuration from `path` and reconciles running sources.
///
/// Only the `webhooks` table is applied; service-level settings take effect
/// on restart.
///
/// # Errors
///
/// Returns an error when the file cannot be loaded or the new source set is
/// invalid. Running sources are left untouched in that case.
pub async fn reload(manager: &mut LifecycleManager, path: impl AsRef<Path>) -> Result<()> {
    let config = Config::load_from(path.as_ref())
        .with_context(|| format!("Failed to reload {}", path.as_ref().display()))?;

    let report =
        manager.reconcile(&config.webhooks).await.context("Reloaded configuration rejected")?;
    info!(
        started = report.started.len(),
        failed = report.failed.len(),
        running = manager.sources().len(),
        "configuration reloaded"
    );
    Ok(())
}

/// Consumes delivered envelopes, logging each one.
///
/// Stands in for the trigger engine. Resolves with the number of envelopes
/// seen once every sender is gone.
pub fn spawn_envelope_logger(mut receiver: mpsc::Receiver<Envelope>) -> JoinHandle<u64> {
    tokio::spawn(async move {
        let mut delivered = 0;
        while let Some(envelope) = receiver.recv().await {
            delivered += 1;
            info!(
                envelope_id = %envelope.id(),
                kind = %envelope.kind(),
                body_bytes = envelope.body().len(),
                metadata_keys = envelope.metadata().len(),
                "envelope received"
            );
        }
        delivered
    })
}
