//! Sluice event ingestion service.
//!
//! Main entry point. Loads configuration, starts every webhook source, and
//! coordinates reload on SIGHUP and graceful shutdown on SIGINT/SIGTERM.

use std::{env, sync::Arc};

use anyhow::{Context, Result};
use sluice_core::{ChannelSink, FileSecrets};
use sluice_gateway::{Config, LifecycleManager};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = env::var("SLUICE_CONFIG_FILE").ok();
    let config = match &config_path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .context("Failed to load configuration")?;

    init_tracing(&config.rust_log);

    info!("Starting Sluice event ingestion service");
    info!(
        host = %config.host,
        sources = config.webhooks.len(),
        secrets_dir = %config.secrets_dir.display(),
        drain_timeout_secs = config.drain_timeout_secs,
        "Configuration loaded"
    );

    let (sink, receiver) = ChannelSink::new(sluice::ENVELOPE_BUFFER);
    let consumer = sluice::spawn_envelope_logger(receiver);
    let secrets = Arc::new(FileSecrets::new(&config.secrets_dir));

    let mut manager = sluice::start(&config, secrets, Arc::new(sink)).await?;
    info!(sources = ?manager.sources(), "Sluice is ready to receive webhooks");

    serve_until_shutdown(&mut manager, config_path.as_deref().unwrap_or("sluice.toml")).await;
    info!("Shutdown signal received, starting graceful shutdown");

    manager.shutdown(config.drain_timeout()).await;
    drop(manager);

    match consumer.await {
        Ok(delivered) => info!(delivered, "Sluice shutdown complete"),
        Err(e) => error!(error = %e, "Envelope consumer failed"),
    }
    Ok(())
}

/// Initializes tracing; `RUST_LOG` overrides the configured filter.
fn init_tracing(default_filter: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// Serves until SIGINT/SIGTERM, reloading configuration on SIGHUP.
#[cfg(unix)]
async fn serve_until_shutdown(manager: &mut LifecycleManager, config_path: &str) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => Some(hangup),
        Err(e) => {
            error!(error = %e, "Failed to install SIGHUP handler, reload disabled");
            None
        },
    };

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        let reload = async {
            match hangup.as_mut() {
                Some(hangup) => hangup.recv().await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            () = &mut shutdown => return,
            _ = reload => {
                info!(path = %config_path, "Received SIGHUP signal, reloading configuration");
                if let Err(e) = sluice::reload(manager, config_path).await {
                    error!(error = %format!("{e:#}"), "Configuration reload failed, keeping current sources");
                }
            },
        }
    }
}

#[cfg(not(unix))]
async fn serve_until_shutdown(_manager: &mut LifecycleManager, _config_path: &str) {
    shutdown_signal().await;
}

/// Waits for shutdown signal (CTRL+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received CTRL+C signal");
        },
        () = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
