//! Per-port HTTP(S) servers.
//!
//! One [`PortServer`] owns one socket. Sources configured on the same port
//! share it and are told apart by path through a [`RouteTable`]. Requests
//! flow through middleware in order:
//! 1. Request ID injection (`X-Request-Id`)
//! 2. Request/response tracing
//! 3. Timeout enforcement (30s)
//! 4. Dispatch: path → method → body limit → authentication → adapter →
//!    delivery
//!
//! Removing a route makes its path answer 404 immediately; requests already
//! past the lookup hold a token on the route's tracker and finish normally.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    Json, Router,
};
use serde::Serialize;
use sluice_adapters::{GenericWebhookAdapter, GithubAdapter, GitlabAdapter, HttpPayload, Normalize};
use sluice_core::{hand_off, Envelope, EnvelopeSink, IngestError, Result, SourceKind};
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::{
    auth::Authenticator,
    config::TlsSettings,
    tls::{load_server_config, TlsListener},
};

/// Largest accepted request body.
pub const MAX_PAYLOAD_SIZE: usize = 10 * 1024 * 1024;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Response from successful webhook ingestion.
#[derive(Debug, Serialize)]
pub struct IngestResponse {
    /// Diagnostic identifier of the delivered envelope
    pub envelope_id: String,
    /// Always `accepted`
    pub status: String,
}

/// Error response with code and message.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error details including code and message
    pub error: ErrorDetail,
}

/// Detailed error information.
#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    /// Error code from the ingestion taxonomy, or the HTTP status name
    pub code: String,
    /// Human-readable error description
    pub message: String,
}

/// One webhook source mounted on a port.
#[derive(Debug)]
pub struct Route {
    source: String,
    kind: SourceKind,
    method: Method,
    auth: Authenticator,
    sink: Arc<dyn EnvelopeSink>,
    tracker: TaskTracker,
}

impl Route {
    /// Creates a route delivering to `sink`.
    pub fn new(
        source: impl Into<String>,
        kind: SourceKind,
        method: Method,
        auth: Authenticator,
        sink: Arc<dyn EnvelopeSink>,
    ) -> Self {
        Self { source: source.into(), kind, method, auth, sink, tracker: TaskTracker::new() }
    }

    /// Owning source name.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Tracks requests being handled on this route.
    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }
}

/// Path → route mapping shared between a server and its owner.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Arc<RwLock<HashMap<String, Arc<Route>>>>,
}

impl RouteTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mounts `route` at `endpoint`, returning any route it replaced.
    pub fn insert(&self, endpoint: impl Into<String>, route: Arc<Route>) -> Option<Arc<Route>> {
        self.routes.write().unwrap_or_else(PoisonError::into_inner).insert(endpoint.into(), route)
    }

    /// Unmounts the route at `endpoint`.
    pub fn remove(&self, endpoint: &str) -> Option<Arc<Route>> {
        self.routes.write().unwrap_or_else(PoisonError::into_inner).remove(endpoint)
    }

    /// Route mounted at `endpoint`.
    pub fn get(&self, endpoint: &str) -> Option<Arc<Route>> {
        self.routes.read().unwrap_or_else(PoisonError::into_inner).get(endpoint).cloned()
    }

    /// Number of mounted routes.
    pub fn len(&self) -> usize {
        self.routes.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether no route is mounted.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Creates the router serving every route in `routes`.
pub fn create_router(routes: RouteTable) -> Router {
    Router::new()
        .fallback(dispatch)
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(inject_request_id))
        .with_state(routes)
}

/// Middleware to inject request ID into all responses.
async fn inject_request_id(req: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();

    let mut req = req;
    req.extensions_mut().insert(request_id.clone());

    let mut response = next.run(req).await;

    if let Ok(header_value) = request_id.parse() {
        response.headers_mut().insert("X-Request-Id", header_value);
    }

    response
}

#[instrument(
    name = "webhook_request",
    skip_all,
    fields(
        method = %method,
        path = %uri.path(),
        content_length = headers.get("content-length").and_then(|v| v.to_str().ok()).unwrap_or("unknown"),
    )
)]
async fn dispatch(
    State(routes): State<RouteTable>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let Some(route) = routes.get(uri.path()) else {
        debug!("no route for path");
        return status_response(StatusCode::NOT_FOUND, "no webhook is configured for this path");
    };

    if method != route.method {
        debug!(source = %route.source, allowed = %route.method, "method not allowed");
        let mut response = status_response(
            StatusCode::METHOD_NOT_ALLOWED,
            &format!("only {} is accepted", route.method),
        );
        if let Ok(allow) = HeaderValue::from_str(route.method.as_str()) {
            response.headers_mut().insert(header::ALLOW, allow);
        }
        return response;
    }

    let _in_flight = route.tracker.token();
    if route.tracker.is_closed() {
        debug!(source = %route.source, "route is draining");
        return status_response(StatusCode::NOT_FOUND, "no webhook is configured for this path");
    }

    let declared = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if let Some(size) = declared.filter(|size| *size > MAX_PAYLOAD_SIZE) {
        return payload_too_large(size);
    }
    let body = match axum::body::to_bytes(body, MAX_PAYLOAD_SIZE).await {
        Ok(body) => body,
        Err(e) => {
            debug!(error = %e, "failed to read request body");
            return payload_too_large(declared.unwrap_or(MAX_PAYLOAD_SIZE + 1));
        },
    };

    if let Err(e) = route.auth.verify(&headers, &body) {
        warn!(source = %route.source, error = %e, "webhook authentication failed");
        return create_error_response(StatusCode::UNAUTHORIZED, &e);
    }

    let payload = HttpPayload::new(
        headers
            .iter()
            .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str(), v.to_string()))),
        body,
    );
    let envelope = match normalize_request(route.kind, payload) {
        Ok(envelope) => envelope,
        Err(e) => {
            info!(source = %route.source, error = %e, "webhook payload rejected");
            return create_error_response(StatusCode::BAD_REQUEST, &e);
        },
    };

    let envelope_id = envelope.id();
    info!(source = %route.source, kind = %route.kind, envelope_id = %envelope_id, "webhook accepted");
    // Loss is already logged by hand_off; the provider still gets its 200.
    let _ = hand_off(route.sink.as_ref(), envelope).await;

    (
        StatusCode::OK,
        Json(IngestResponse { envelope_id: envelope_id.to_string(), status: "accepted".to_string() }),
    )
        .into_response()
}

fn normalize_request(kind: SourceKind, payload: HttpPayload) -> Result<Envelope> {
    match kind {
        SourceKind::ScmGitlab => GitlabAdapter.normalize(payload),
        SourceKind::ScmGithub => GithubAdapter.normalize(payload),
        SourceKind::GenericWebhook => GenericWebhookAdapter.normalize(payload),
        other => Err(IngestError::unsupported(other, "not an HTTP webhook kind")),
    }
}

fn payload_too_large(size_bytes: usize) -> Response {
    warn!(payload_size = size_bytes, limit = MAX_PAYLOAD_SIZE, "Payload exceeds size limit");
    create_error_response(
        StatusCode::PAYLOAD_TOO_LARGE,
        &IngestError::PayloadTooLarge { size_bytes, limit_bytes: MAX_PAYLOAD_SIZE },
    )
}

fn create_error_response(status: StatusCode, error: &IngestError) -> Response {
    let error_response = ErrorResponse {
        error: ErrorDetail { code: error.code().to_string(), message: error.to_string() },
    };

    (status, Json(error_response)).into_response()
}

fn status_response(status: StatusCode, message: &str) -> Response {
    let code = status.canonical_reason().unwrap_or("error").to_ascii_uppercase().replace(' ', "_");
    let error_response = ErrorResponse { error: ErrorDetail { code, message: message.to_string() } };

    (status, Json(error_response)).into_response()
}

/// A bound socket serving one port.
#[derive(Debug)]
pub struct PortServer {
    port: u16,
    local_addr: SocketAddr,
    tls: Option<TlsSettings>,
    routes: RouteTable,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl PortServer {
    /// Binds `host:port` and starts serving, over TLS when `tls` is set.
    ///
    /// TLS material is loaded before the socket is bound, so a bad
    /// certificate never occupies the port.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::ConfigInvalid`] attributed to `owner` when the
    /// TLS material is unusable, or [`IngestError::Bind`] when the socket
    /// cannot be bound.
    #[instrument(name = "bind_port", skip(host, tls, owner), fields(owner = %owner))]
    pub async fn bind(host: &str, port: u16, tls: Option<TlsSettings>, owner: &str) -> Result<Self> {
        let tls_config = match &tls {
            Some(settings) => Some(
                load_server_config(settings)
                    .await
                    .map_err(|e| IngestError::config(owner, e.to_string()))?,
            ),
            None => None,
        };

        let addr = bind_address(host, port);
        let bind_error = |e: std::io::Error| IngestError::Bind { addr: addr.clone(), reason: e.to_string() };
        let listener = TcpListener::bind(&addr).await.map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;

        let routes = RouteTable::new();
        let router = create_router(routes.clone());
        let shutdown = CancellationToken::new();
        let signal = shutdown.clone().cancelled_owned();

        let task = match tls_config {
            Some(config) => {
                let listener = TlsListener::new(listener, config).map_err(bind_error)?;
                tokio::spawn(async move {
                    if let Err(e) = axum::serve(listener, router).with_graceful_shutdown(signal).await {
                        error!(port, error = %e, "port server failed");
                    }
                })
            },
            None => tokio::spawn(async move {
                if let Err(e) = axum::serve(listener, router).with_graceful_shutdown(signal).await {
                    error!(port, error = %e, "port server failed");
                }
            }),
        };

        info!(port, addr = %local_addr, tls = tls.is_some(), "port server listening");

        Ok(Self { port, local_addr, tls, routes, shutdown, task })
    }

    /// Configured port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Address actually bound.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// TLS settings every route on this port shares.
    pub fn tls(&self) -> Option<&TlsSettings> {
        self.tls.as_ref()
    }

    /// Routes served on this port.
    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    /// Stops accepting, waits up to `timeout` for open connections, then
    /// aborts the server task. The socket is released on return.
    pub async fn shutdown(self, timeout: Duration) {
        let Self { port, shutdown, mut task, .. } = self;
        shutdown.cancel();

        match tokio::time::timeout(timeout, &mut task).await {
            Ok(_) => info!(port, "port server stopped"),
            Err(_) => {
                warn!(port, timeout_ms = timeout.as_millis() as u64, "port server did not stop in time, aborting");
                task.abort();
                let _ = task.await;
            },
        }
    }
}

fn bind_address(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}
