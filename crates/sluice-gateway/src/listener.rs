//! Webhook listener lifecycle.
//!
//! A [`WebhookListener`] moves through
//! `Unregistered → Starting → Listening → Draining → Stopped`, published on a
//! watch channel so callers can await transitions. The socket itself
//! belongs to a [`PortServer`](crate::server::PortServer) owned by the
//! manager; the listener owns its route, its authenticator, and its
//! provider hook.

use std::{fmt, sync::Arc, time::Duration};

use sluice_core::{EnvelopeSink, IngestError, Result, SecretRef, SecretResolver, SecretValue};
use tokio::{sync::watch, task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    auth::Authenticator,
    config::{Provider, WebhookSource},
    registration::{HookRegistrar, RegistrationError},
    retry::{RetryOutcome, RetryPolicy},
    server::Route,
};

const DEREGISTER_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifecycle state of one listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    /// Created, not yet started.
    Unregistered,
    /// Resolving secrets and mounting the route.
    Starting,
    /// Serving requests.
    Listening,
    /// Refusing new requests, finishing in-flight ones.
    Draining,
    /// Done; terminal.
    Stopped,
}

impl fmt::Display for ListenerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unregistered => "unregistered",
            Self::Starting => "starting",
            Self::Listening => "listening",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Outcome of provider hook registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationStatus {
    /// Source does not ask for registration.
    NotRequested,
    /// Attempts in progress.
    Pending,
    /// Hook exists on the provider.
    Registered {
        /// Provider hook id
        hook_id: String,
    },
    /// Attempts exhausted or impossible; the listener keeps serving.
    Degraded {
        /// Last provider error
        reason: String,
    },
}

/// One configured webhook source.
#[derive(Debug)]
pub struct WebhookListener {
    source: WebhookSource,
    state: watch::Sender<ListenerState>,
    registration: Arc<watch::Sender<RegistrationStatus>>,
    route: Option<Arc<Route>>,
    registrar: Option<Arc<dyn HookRegistrar>>,
    cancel: CancellationToken,
    registration_task: Option<JoinHandle<()>>,
}

impl WebhookListener {
    /// Creates a listener in the `Unregistered` state.
    pub fn new(source: WebhookSource) -> Self {
        let (state, _) = watch::channel(ListenerState::Unregistered);
        let (registration, _) = watch::channel(RegistrationStatus::NotRequested);
        Self {
            source,
            state,
            registration: Arc::new(registration),
            route: None,
            registrar: None,
            cancel: CancellationToken::new(),
            registration_task: None,
        }
    }

    /// Validated source settings.
    pub fn source(&self) -> &WebhookSource {
        &self.source
    }

    /// Current state.
    pub fn state(&self) -> ListenerState {
        *self.state.borrow()
    }

    /// Watches state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ListenerState> {
        self.state.subscribe()
    }

    /// Current registration outcome.
    pub fn registration(&self) -> RegistrationStatus {
        self.registration.borrow().clone()
    }

    /// Watches registration progress.
    pub fn subscribe_registration(&self) -> watch::Receiver<RegistrationStatus> {
        self.registration.subscribe()
    }

    /// Route serving this source, once prepared.
    pub fn route(&self) -> Option<&Arc<Route>> {
        self.route.as_ref()
    }

    /// Resolves the source's secrets and builds its route.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::ConfigInvalid`] when a secret cannot be
    /// resolved; the listener is then `Stopped` and never serves.
    pub async fn prepare(
        &mut self,
        secrets: &dyn SecretResolver,
        sink: Arc<dyn EnvelopeSink>,
    ) -> Result<Arc<Route>> {
        self.set_state(ListenerState::Starting);

        let auth = match self.authenticator(secrets).await {
            Ok(auth) => auth,
            Err(e) => {
                self.set_state(ListenerState::Stopped);
                return Err(e);
            },
        };

        let route = Arc::new(Route::new(
            self.source.name.clone(),
            self.source.kind(),
            self.source.method.clone(),
            auth,
            sink,
        ));
        self.route = Some(route.clone());
        Ok(route)
    }

    async fn authenticator(&self, secrets: &dyn SecretResolver) -> Result<Authenticator> {
        let auth = match &self.source.provider {
            Provider::Gitlab { .. } => {
                Authenticator::GitlabToken(self.resolve(secrets, &self.source.access_token).await?)
            },
            Provider::Github { webhook_secret, .. } => {
                Authenticator::GithubSignature(self.resolve(secrets, webhook_secret).await?)
            },
            Provider::Webhook => {
                Authenticator::Bearer(self.resolve(secrets, &self.source.access_token).await?)
            },
        };
        Ok(auth)
    }

    async fn resolve(&self, secrets: &dyn SecretResolver, secret: &SecretRef) -> Result<SecretValue> {
        secrets
            .resolve(secret)
            .await
            .map_err(|e| IngestError::config(&self.source.name, e.to_string()))
    }

    /// Marks the route as mounted and serving.
    pub fn mark_listening(&self) {
        self.set_state(ListenerState::Listening);
        info!(
            source = %self.source.name,
            port = self.source.port,
            endpoint = %self.source.endpoint,
            method = %self.source.method,
            kind = %self.source.kind(),
            "webhook listener started"
        );
    }

    /// Marks a listener that could not start as `Stopped`.
    pub fn fail(&self) {
        self.set_state(ListenerState::Stopped);
    }

    /// Starts background hook registration with the provider.
    ///
    /// Failures are retried per `policy`; once exhausted the source is
    /// reported `Degraded` and keeps serving.
    pub fn start_registration(&mut self, registrar: Arc<dyn HookRegistrar>, policy: RetryPolicy) {
        let Some(callback_url) = self.source.callback_url() else {
            return;
        };

        self.registrar = Some(registrar.clone());
        self.registration.send_replace(RegistrationStatus::Pending);

        let status = self.registration.clone();
        let cancel = self.cancel.clone();
        let source_name = self.source.name.clone();

        self.registration_task = Some(tokio::spawn(async move {
            let outcome = policy
                .run(
                    &cancel,
                    |attempt| {
                        let registrar = registrar.clone();
                        let callback_url = callback_url.clone();
                        async move {
                            debug!(attempt, callback_url = %callback_url, "registering hook");
                            registrar.register(&callback_url).await
                        }
                    },
                    RegistrationError::is_retryable,
                )
                .await;

            match outcome {
                RetryOutcome::Succeeded(hook_id) => {
                    info!(source = %source_name, hook_id = %hook_id, "hook registered");
                    status.send_replace(RegistrationStatus::Registered { hook_id });
                },
                RetryOutcome::Exhausted { attempts, last_error } => {
                    let err = IngestError::Registration {
                        source_name: source_name.clone(),
                        reason: last_error.to_string(),
                    };
                    warn!(
                        source = %source_name,
                        attempts,
                        code = err.code(),
                        error = %err,
                        "hook registration failed, source degraded"
                    );
                    status.send_replace(RegistrationStatus::Degraded {
                        reason: last_error.to_string(),
                    });
                },
                RetryOutcome::Cancelled => {
                    debug!(source = %source_name, "hook registration cancelled");
                },
            }
        }));
    }

    /// Reports a registration that could not even be attempted.
    pub fn degrade(&self, reason: impl Into<String>) {
        self.registration.send_replace(RegistrationStatus::Degraded { reason: reason.into() });
    }

    /// Drains and stops the listener, giving up on stragglers at `deadline`.
    ///
    /// The route must already be unmounted so no new request can reach it.
    /// A registration attempt already sent to the provider is allowed to
    /// finish so the hook it creates can be removed. In-flight requests
    /// still running at `deadline` are left to the port server's forced
    /// close. The hook is then deregistered best-effort.
    pub async fn drain(&mut self, deadline: Instant) {
        if self.state() == ListenerState::Stopped {
            return;
        }
        self.set_state(ListenerState::Draining);
        info!(source = %self.source.name, "draining webhook listener");

        // Cancellation only interrupts the backoff between attempts.
        self.cancel.cancel();
        let registration = self.registration_task.take();
        let source_name = self.source.name.as_str();

        let settle_registration = async {
            let Some(mut task) = registration else {
                return;
            };
            if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
                warn!(source = %source_name, "hook registration still in flight at drain deadline, aborting");
                task.abort();
                let _ = task.await;
            }
        };

        let finish_requests = async {
            let Some(route) = &self.route else {
                return;
            };
            route.tracker().close();
            if tokio::time::timeout_at(deadline, route.tracker().wait()).await.is_err() {
                warn!(
                    source = %source_name,
                    in_flight = route.tracker().len(),
                    "drain timed out, forcing close"
                );
            }
        };

        tokio::join!(settle_registration, finish_requests);

        self.deregister().await;

        self.set_state(ListenerState::Stopped);
        info!(source = %self.source.name, "webhook listener stopped");
    }

    /// Marks a listener whose drain was cut short as `Stopped`.
    pub fn force_stop(&self) {
        if self.state() != ListenerState::Stopped {
            warn!(source = %self.source.name, state = %self.state(), "forcing listener stop");
            self.set_state(ListenerState::Stopped);
        }
    }

    async fn deregister(&self) {
        let (Some(registrar), RegistrationStatus::Registered { hook_id }) =
            (&self.registrar, self.registration())
        else {
            return;
        };

        match tokio::time::timeout(DEREGISTER_TIMEOUT, registrar.deregister(&hook_id)).await {
            Ok(Ok(())) => {
                self.registration.send_replace(RegistrationStatus::NotRequested);
            },
            Ok(Err(e)) => {
                warn!(source = %self.source.name, hook_id = %hook_id, error = %e, "failed to deregister hook");
            },
            Err(_) => {
                warn!(source = %self.source.name, hook_id = %hook_id, "hook deregistration timed out");
            },
        }
    }

    fn set_state(&self, next: ListenerState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(source = %self.source.name, from = %previous, to = %next, "listener state changed");
        }
    }
}
