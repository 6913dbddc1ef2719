//! Source lifecycle management.
//!
//! [`LifecycleManager`] owns every running listener (by source name) and
//! every bound socket (by port). Batches are validated as a whole before
//! anything binds, so a collision between two entries never leaves half a
//! configuration running.

use std::{
    collections::{hash_map::Entry, BTreeMap, HashMap},
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use futures::future::join_all;
use sluice_core::{EnvelopeSink, IngestError, Result, SecretResolver};
use tokio::{sync::watch, time::Instant};
use tracing::{error, info, instrument, warn};

use crate::{
    config::{TlsSettings, WebhookSource, WebhookSourceConfig},
    listener::{ListenerState, RegistrationStatus, WebhookListener},
    registration::registrar_for,
    retry::RetryPolicy,
    server::PortServer,
};

const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Result of starting a validated batch.
#[derive(Debug, Default)]
pub struct ApplyReport {
    /// Sources now listening.
    pub started: Vec<String>,
    /// Sources that failed to start, with the reason.
    pub failed: Vec<(String, IngestError)>,
}

impl ApplyReport {
    /// Whether every source started.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Starts, stops, and reconciles webhook listeners.
#[derive(Debug)]
pub struct LifecycleManager {
    host: String,
    retry_policy: RetryPolicy,
    drain_timeout: Duration,
    secrets: Arc<dyn SecretResolver>,
    sink: Arc<dyn EnvelopeSink>,
    client: reqwest::Client,
    listeners: HashMap<String, WebhookListener>,
    servers: HashMap<u16, PortServer>,
}

impl LifecycleManager {
    /// Creates a manager binding on `host`.
    pub fn new(
        host: impl Into<String>,
        secrets: Arc<dyn SecretResolver>,
        sink: Arc<dyn EnvelopeSink>,
    ) -> Self {
        Self {
            host: host.into(),
            retry_policy: RetryPolicy::default(),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            secrets,
            sink,
            client: reqwest::Client::new(),
            listeners: HashMap::new(),
            servers: HashMap::new(),
        }
    }

    /// Sets the hook registration retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Sets how long a removed source may take to finish in-flight requests.
    #[must_use]
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Sets the HTTP client used for provider APIs.
    #[must_use]
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    /// State of a running source.
    pub fn state(&self, name: &str) -> Option<ListenerState> {
        self.listeners.get(name).map(WebhookListener::state)
    }

    /// Watches a running source's state.
    pub fn subscribe(&self, name: &str) -> Option<watch::Receiver<ListenerState>> {
        self.listeners.get(name).map(WebhookListener::subscribe)
    }

    /// Registration outcome of a running source.
    pub fn registration(&self, name: &str) -> Option<RegistrationStatus> {
        self.listeners.get(name).map(WebhookListener::registration)
    }

    /// Watches a running source's registration.
    pub fn subscribe_registration(
        &self,
        name: &str,
    ) -> Option<watch::Receiver<RegistrationStatus>> {
        self.listeners.get(name).map(WebhookListener::subscribe_registration)
    }

    /// Address bound for `port`, if a server is running on it.
    pub fn local_addr(&self, port: u16) -> Option<SocketAddr> {
        self.servers.get(&port).map(PortServer::local_addr)
    }

    /// Names of running sources, sorted.
    pub fn sources(&self) -> Vec<String> {
        let mut names: Vec<_> = self.listeners.keys().cloned().collect();
        names.sort();
        names
    }

    /// Validates `batch` against itself and the running sources, then
    /// starts every entry.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::ConfigInvalid`] without binding anything when
    /// any entry is invalid, names a running source, reuses a port and
    /// endpoint, or disagrees on TLS with another source on its port.
    /// Failures while starting individual sources are reported in the
    /// [`ApplyReport`] instead.
    #[instrument(name = "apply_sources", skip_all, fields(count = batch.len()))]
    pub async fn apply(
        &mut self,
        batch: &BTreeMap<String, WebhookSourceConfig>,
    ) -> Result<ApplyReport> {
        let candidates = validate_entries(batch)?;
        if let Some(source) = candidates.iter().find(|s| self.listeners.contains_key(&s.name)) {
            return Err(IngestError::config(&source.name, "source is already running"));
        }

        let running: Vec<&WebhookSource> = self.listeners.values().map(WebhookListener::source).collect();
        check_batch(&candidates, &running)?;

        Ok(self.start_all(candidates).await)
    }

    /// Validates and starts one source.
    ///
    /// # Errors
    ///
    /// Returns the validation error, or the reason the source failed to
    /// start.
    pub async fn add(&mut self, name: &str, config: &WebhookSourceConfig) -> Result<()> {
        let batch = BTreeMap::from([(name.to_string(), config.clone())]);
        let mut report = self.apply(&batch).await?;
        match report.failed.pop() {
            Some((_, e)) => Err(e),
            None => Ok(()),
        }
    }

    /// Drains and stops a source. Returns false if it was not running.
    ///
    /// The route answers 404 from the moment this is called; in-flight
    /// requests get until the drain timeout to complete. When the last route
    /// on a port leaves, the socket is closed, forcibly once the drain
    /// timeout has passed.
    #[instrument(name = "remove_source", skip(self))]
    pub async fn remove(&mut self, name: &str) -> bool {
        let Some(mut listener) = self.listeners.remove(name) else {
            return false;
        };

        let port = listener.source().port;
        if let Some(server) = self.servers.get(&port) {
            server.routes().remove(&listener.source().endpoint);
        }
        let deadline = Instant::now() + self.drain_timeout;
        listener.drain(deadline).await;
        self.release_if_idle(port, deadline).await;
        true
    }

    /// Brings the running set in line with `desired`.
    ///
    /// Sources missing from `desired` are drained, changed ones restarted,
    /// new ones started. Unchanged sources keep serving throughout.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::ConfigInvalid`] and leaves everything running
    /// untouched when the desired set does not validate.
    #[instrument(name = "reconcile_sources", skip_all, fields(desired = desired.len()))]
    pub async fn reconcile(
        &mut self,
        desired: &BTreeMap<String, WebhookSourceConfig>,
    ) -> Result<ApplyReport> {
        let wanted = validate_entries(desired)?;

        let mut to_stop: Vec<String> = self
            .listeners
            .keys()
            .filter(|name| !desired.contains_key(*name))
            .cloned()
            .collect();
        let mut to_start = Vec::new();
        for source in wanted {
            match self.listeners.get(&source.name) {
                Some(running) if running.source() == &source => {},
                Some(_) => {
                    to_stop.push(source.name.clone());
                    to_start.push(source);
                },
                None => to_start.push(source),
            }
        }

        let kept: Vec<&WebhookSource> = self
            .listeners
            .values()
            .map(WebhookListener::source)
            .filter(|source| !to_stop.contains(&source.name))
            .collect();
        check_batch(&to_start, &kept)?;

        info!(stopping = to_stop.len(), starting = to_start.len(), "reconciling webhook sources");
        for name in &to_stop {
            self.remove(name).await;
        }
        Ok(self.start_all(to_start).await)
    }

    /// Drains every listener concurrently, then closes every socket.
    ///
    /// Whatever has not finished within `timeout` is aborted.
    #[instrument(name = "shutdown_sources", skip(self))]
    pub async fn shutdown(&mut self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        let mut listeners: Vec<WebhookListener> = self.listeners.drain().map(|(_, l)| l).collect();

        for listener in &listeners {
            if let Some(server) = self.servers.get(&listener.source().port) {
                server.routes().remove(&listener.source().endpoint);
            }
        }

        info!(listeners = listeners.len(), ports = self.servers.len(), "draining webhook listeners");
        let drained = tokio::time::timeout_at(
            deadline,
            join_all(listeners.iter_mut().map(|listener| listener.drain(deadline))),
        )
        .await;
        if drained.is_err() {
            warn!(timeout_ms = timeout.as_millis() as u64, "drain timed out, forcing close");
            listeners.iter().for_each(WebhookListener::force_stop);
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        join_all(self.servers.drain().map(|(_, server)| server.shutdown(remaining))).await;
        info!("all webhook listeners stopped");
    }

    async fn start_all(&mut self, sources: Vec<WebhookSource>) -> ApplyReport {
        let mut report = ApplyReport::default();
        for source in sources {
            let name = source.name.clone();
            match self.start(source).await {
                Ok(()) => report.started.push(name),
                Err(e) => {
                    error!(source = %name, code = e.code(), error = %e, "webhook source failed to start");
                    report.failed.push((name, e));
                },
            }
        }
        report
    }

    async fn start(&mut self, source: WebhookSource) -> Result<()> {
        let mut listener = WebhookListener::new(source.clone());
        let route = listener.prepare(self.secrets.as_ref(), self.sink.clone()).await?;

        let server = match self.servers.entry(source.port) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                match PortServer::bind(&self.host, source.port, source.tls.clone(), &source.name).await {
                    Ok(server) => entry.insert(server),
                    Err(e) => {
                        listener.fail();
                        return Err(e);
                    },
                }
            },
        };
        server.routes().insert(source.endpoint.clone(), route);
        listener.mark_listening();

        match registrar_for(&source, self.secrets.as_ref(), &self.client).await {
            Ok(Some(registrar)) => listener.start_registration(registrar, self.retry_policy.clone()),
            Ok(None) => {},
            Err(e) => {
                warn!(source = %source.name, code = e.code(), error = %e, "hook registration skipped, source degraded");
                listener.degrade(e.to_string());
            },
        }

        self.listeners.insert(source.name, listener);
        Ok(())
    }

    async fn release_if_idle(&mut self, port: u16, deadline: Instant) {
        let idle = self.servers.get(&port).is_some_and(|server| server.routes().is_empty());
        if !idle {
            return;
        }
        if let Some(server) = self.servers.remove(&port) {
            server.shutdown(deadline.saturating_duration_since(Instant::now())).await;
        }
    }
}

fn validate_entries(batch: &BTreeMap<String, WebhookSourceConfig>) -> Result<Vec<WebhookSource>> {
    batch.iter().map(|(name, config)| config.validate(name)).collect()
}

/// Pairwise checks across `candidates` and the sources that stay running.
fn check_batch(candidates: &[WebhookSource], running: &[&WebhookSource]) -> Result<()> {
    let mut endpoints: HashMap<(u16, &str), &str> = HashMap::new();
    let mut port_tls: HashMap<u16, (Option<&TlsSettings>, &str)> = HashMap::new();

    for source in running {
        endpoints.insert((source.port, source.endpoint.as_str()), source.name.as_str());
        port_tls.entry(source.port).or_insert((source.tls.as_ref(), source.name.as_str()));
    }

    for source in candidates {
        if let Some(owner) =
            endpoints.insert((source.port, source.endpoint.as_str()), source.name.as_str())
        {
            return Err(IngestError::config(
                &source.name,
                format!(
                    "port {} endpoint {} is already used by source '{owner}'",
                    source.port, source.endpoint
                ),
            ));
        }

        match port_tls.entry(source.port) {
            Entry::Occupied(entry) => {
                let (tls, owner) = *entry.get();
                if tls != source.tls.as_ref() {
                    return Err(IngestError::config(
                        &source.name,
                        format!("TLS settings on port {} differ from source '{owner}'", source.port),
                    ));
                }
            },
            Entry::Vacant(entry) => {
                entry.insert((source.tls.as_ref(), source.name.as_str()));
            },
        }
    }

    Ok(())
}
