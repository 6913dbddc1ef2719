//! Lifecycle manager tests over real sockets.
//!
//! Covers batch validation before binding, draining with a request in
//! flight, reconciliation, shutdown, and TLS termination.

use std::{
    collections::BTreeMap,
    net::TcpListener,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use sluice_core::{InMemorySecrets, SecretRef, SourceKind};
use sluice_gateway::{
    config::{GitlabOptions, NumberOrString, ProviderConfig},
    LifecycleManager, ListenerState, WebhookSourceConfig,
};
use sluice_testing::{free_port, gitlab_push_body, BlockingSink, RecordingSink};

fn gitlab(port: u16, endpoint: &str) -> WebhookSourceConfig {
    WebhookSourceConfig {
        endpoint: endpoint.into(),
        port: NumberOrString::Text(port.to_string()),
        method: "POST".into(),
        url: None,
        server_cert_path: None,
        server_key_path: None,
        ca_cert_path: None,
        enable_ssl_verification: false,
        access_token: SecretRef::new("gitlab-access", "accesskey"),
        provider: ProviderConfig::Gitlab(GitlabOptions::default()),
    }
}

fn secrets() -> Arc<InMemorySecrets> {
    Arc::new(InMemorySecrets::new().with_secret("gitlab-access", "accesskey", "s3cret"))
}

fn manager(sink: Arc<dyn sluice_core::EnvelopeSink>) -> LifecycleManager {
    LifecycleManager::new("127.0.0.1", secrets(), sink).with_drain_timeout(Duration::from_secs(5))
}

async fn post(client: &reqwest::Client, url: &str, token: &str) -> reqwest::Response {
    client
        .post(url)
        .header("X-Gitlab-Token", token)
        .header("Content-Type", "application/json")
        .body(gitlab_push_body())
        .send()
        .await
        .unwrap()
}

fn port_is_free(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}

#[tokio::test]
async fn duplicate_port_and_endpoint_rejected_before_binding() {
    let port = free_port();
    let mut manager = manager(Arc::new(RecordingSink::new()));
    let batch = BTreeMap::from([
        ("first".to_string(), gitlab(port, "/push")),
        ("second".to_string(), gitlab(port, "/push")),
    ]);

    let err = manager.apply(&batch).await.unwrap_err();

    assert_eq!(err.code(), "E1001");
    assert!(manager.sources().is_empty());
    assert!(manager.local_addr(port).is_none());
    assert!(port_is_free(port));
}

#[tokio::test]
async fn invalid_entry_blocks_whole_batch() {
    let port = free_port();
    let mut bad = gitlab(port, "/bad");
    bad.method = "CONNECT".into();
    let batch = BTreeMap::from([("good".to_string(), gitlab(port, "/good")), ("bad".to_string(), bad)]);
    let mut manager = manager(Arc::new(RecordingSink::new()));

    assert!(manager.apply(&batch).await.is_err());
    assert!(port_is_free(port));
}

#[tokio::test]
async fn unresolvable_secret_fails_only_that_source() {
    let port = free_port();
    let mut orphan = gitlab(port, "/orphan");
    orphan.access_token = SecretRef::new("missing", "token");
    let batch = BTreeMap::from([("ok".to_string(), gitlab(port, "/ok")), ("orphan".to_string(), orphan)]);
    let mut manager = manager(Arc::new(RecordingSink::new()));

    let report = manager.apply(&batch).await.unwrap();

    assert_eq!(report.started, vec!["ok".to_string()]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "orphan");
    assert_eq!(report.failed[0].1.code(), "E1001");
    assert_eq!(manager.state("ok"), Some(ListenerState::Listening));
    assert_eq!(manager.state("orphan"), None);

    manager.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn adding_a_running_source_again_is_rejected() {
    let port = free_port();
    let mut manager = manager(Arc::new(RecordingSink::new()));
    manager.add("gitlab-push", &gitlab(port, "/push")).await.unwrap();

    let err = manager.add("gitlab-push", &gitlab(free_port(), "/other")).await.unwrap_err();

    assert!(err.to_string().contains("already running"));
    manager.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn drain_completes_in_flight_request_and_releases_port() {
    let port = free_port();
    let sink = BlockingSink::new();
    let mut manager = manager(Arc::new(sink.clone()));
    manager.add("gitlab-push", &gitlab(port, "/push")).await.unwrap();
    let mut states = manager.subscribe("gitlab-push").unwrap();

    let client = reqwest::Client::new();
    let url = format!("http://127.0.0.1:{port}/push");
    let request = tokio::spawn({
        let client = client.clone();
        let url = url.clone();
        async move { post(&client, &url, "s3cret").await.status() }
    });
    sink.wait_until_entered().await;

    let removal = tokio::spawn(async move {
        let removed = manager.remove("gitlab-push").await;
        (removed, manager)
    });
    states.wait_for(|state| *state == ListenerState::Draining).await.unwrap();

    // New requests no longer reach the route.
    let late = post(&client, &url, "s3cret").await;
    assert_eq!(late.status(), reqwest::StatusCode::NOT_FOUND);
    assert!(!request.is_finished());

    sink.release();
    assert_eq!(request.await.unwrap(), reqwest::StatusCode::OK);

    let (removed, manager) =
        tokio::time::timeout(Duration::from_secs(10), removal).await.unwrap().unwrap();
    assert!(removed);
    assert_eq!(*states.borrow(), ListenerState::Stopped);
    assert_eq!(sink.count(), 1);
    assert!(manager.local_addr(port).is_none());
    assert!(port_is_free(port));
}

#[tokio::test]
async fn shared_port_stays_open_until_last_route_leaves() {
    let port = free_port();
    let sink = RecordingSink::new();
    let mut manager = manager(Arc::new(sink.clone()));
    let batch = BTreeMap::from([
        ("a".to_string(), gitlab(port, "/a")),
        ("b".to_string(), gitlab(port, "/b")),
    ]);
    assert!(manager.apply(&batch).await.unwrap().is_complete());
    let client = reqwest::Client::new();

    assert!(manager.remove("a").await);
    assert!(manager.local_addr(port).is_some());
    assert_eq!(post(&client, &format!("http://127.0.0.1:{port}/a"), "s3cret").await.status(), 404);
    assert_eq!(post(&client, &format!("http://127.0.0.1:{port}/b"), "s3cret").await.status(), 200);

    assert!(manager.remove("b").await);
    assert!(!manager.remove("b").await);
    assert!(manager.local_addr(port).is_none());
    assert_eq!(sink.count(), 1);
}

#[tokio::test]
async fn reconcile_starts_stops_and_restarts() {
    let port = free_port();
    let sink = RecordingSink::new();
    let mut manager = manager(Arc::new(sink.clone()));
    let initial = BTreeMap::from([
        ("keep".to_string(), gitlab(port, "/keep")),
        ("move".to_string(), gitlab(port, "/old")),
        ("drop".to_string(), gitlab(port, "/drop")),
    ]);
    manager.apply(&initial).await.unwrap();

    let desired = BTreeMap::from([
        ("keep".to_string(), gitlab(port, "/keep")),
        ("move".to_string(), gitlab(port, "/new")),
        ("add".to_string(), gitlab(port, "/add")),
    ]);
    let report = manager.reconcile(&desired).await.unwrap();

    let mut started = report.started.clone();
    started.sort();
    assert_eq!(started, vec!["add".to_string(), "move".to_string()]);
    assert_eq!(manager.sources(), vec!["add", "keep", "move"]);

    let client = reqwest::Client::new();
    let status = |path: &str| {
        let client = client.clone();
        let url = format!("http://127.0.0.1:{port}{path}");
        async move { post(&client, &url, "s3cret").await.status().as_u16() }
    };
    assert_eq!(status("/keep").await, 200);
    assert_eq!(status("/new").await, 200);
    assert_eq!(status("/add").await, 200);
    assert_eq!(status("/old").await, 404);
    assert_eq!(status("/drop").await, 404);
    assert_eq!(sink.count(), 3);

    manager.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn invalid_reconcile_leaves_running_sources_alone() {
    let port = free_port();
    let mut manager = manager(Arc::new(RecordingSink::new()));
    manager.add("a", &gitlab(port, "/a")).await.unwrap();

    let desired = BTreeMap::from([
        ("b".to_string(), gitlab(port, "/same")),
        ("c".to_string(), gitlab(port, "/same")),
    ]);

    assert!(manager.reconcile(&desired).await.is_err());
    assert_eq!(manager.sources(), vec!["a"]);
    assert_eq!(manager.state("a"), Some(ListenerState::Listening));

    manager.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn shutdown_stops_every_listener() {
    let (first, second) = (free_port(), free_port());
    let mut manager = manager(Arc::new(RecordingSink::new()));
    let batch = BTreeMap::from([
        ("a".to_string(), gitlab(first, "/a")),
        ("b".to_string(), gitlab(second, "/b")),
    ]);
    manager.apply(&batch).await.unwrap();
    let mut a_state = manager.subscribe("a").unwrap();

    tokio::time::timeout(Duration::from_secs(10), manager.shutdown(Duration::from_secs(5)))
        .await
        .unwrap();

    assert!(manager.sources().is_empty());
    assert_eq!(*a_state.borrow_and_update(), ListenerState::Stopped);
    assert!(port_is_free(first));
    assert!(port_is_free(second));
}

/// Sends one request that parks inside `sink` and waits until it does.
async fn park_request(sink: &BlockingSink, port: u16) -> tokio::task::JoinHandle<()> {
    let url = format!("http://127.0.0.1:{port}/push");
    let request = tokio::spawn(async move {
        let _ = reqwest::Client::new()
            .post(url)
            .header("X-Gitlab-Token", "s3cret")
            .body(gitlab_push_body())
            .send()
            .await;
    });
    sink.wait_until_entered().await;
    request
}

#[tokio::test]
async fn removal_with_stuck_request_is_bounded_by_drain_timeout() {
    let port = free_port();
    let sink = BlockingSink::new();
    let mut manager = LifecycleManager::new("127.0.0.1", secrets(), Arc::new(sink.clone()))
        .with_drain_timeout(Duration::from_millis(300));
    manager.add("gitlab-push", &gitlab(port, "/push")).await.unwrap();
    let states = manager.subscribe("gitlab-push").unwrap();
    let request = park_request(&sink, port).await;

    let started = Instant::now();
    let removed = tokio::time::timeout(Duration::from_secs(3), manager.remove("gitlab-push"))
        .await
        .expect("removal must not wait on a stuck request");

    assert!(removed);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(*states.borrow(), ListenerState::Stopped);
    assert!(manager.local_addr(port).is_none());
    assert!(port_is_free(port));
    assert_eq!(sink.count(), 0);

    sink.release();
    request.abort();
}

#[tokio::test]
async fn shutdown_with_stuck_request_returns_after_timeout() {
    let (port, idle_port) = (free_port(), free_port());
    let sink = BlockingSink::new();
    let mut manager = manager(Arc::new(sink.clone()));
    let batch = BTreeMap::from([
        ("gitlab-push".to_string(), gitlab(port, "/push")),
        ("idle".to_string(), gitlab(idle_port, "/idle")),
    ]);
    manager.apply(&batch).await.unwrap();
    let states = manager.subscribe("gitlab-push").unwrap();
    let idle_states = manager.subscribe("idle").unwrap();
    let request = park_request(&sink, port).await;

    let started = Instant::now();
    tokio::time::timeout(Duration::from_secs(3), manager.shutdown(Duration::from_millis(300)))
        .await
        .expect("shutdown must be bounded by its timeout");

    assert!(started.elapsed() >= Duration::from_millis(300));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(manager.sources().is_empty());
    assert_eq!(*states.borrow(), ListenerState::Stopped);
    assert_eq!(*idle_states.borrow(), ListenerState::Stopped);
    assert!(port_is_free(port));
    assert!(port_is_free(idle_port));

    sink.release();
    request.abort();
}

struct TlsFiles {
    _dir: tempfile::TempDir,
    cert: PathBuf,
    key: PathBuf,
}

fn tls_files() -> TlsFiles {
    let _ = rustls::crypto::ring::default_provider().install_default();
    let key_pair = rcgen::KeyPair::generate().unwrap();
    let cert = rcgen::CertificateParams::new(vec!["localhost".to_string()])
        .unwrap()
        .self_signed(&key_pair)
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let cert_path = dir.path().join("tls.crt");
    let key_path = dir.path().join("tls.key");
    std::fs::write(&cert_path, cert.pem()).unwrap();
    std::fs::write(&key_path, key_pair.serialize_pem()).unwrap();
    TlsFiles { _dir: dir, cert: cert_path, key: key_path }
}

#[tokio::test]
async fn tls_listener_serves_https() {
    let files = tls_files();
    let port = free_port();
    let mut source = gitlab(port, "/push");
    source.server_cert_path = Some(files.cert.clone());
    source.server_key_path = Some(files.key.clone());

    let sink = RecordingSink::new();
    let mut manager = manager(Arc::new(sink.clone()));
    manager.add("secure", &source).await.unwrap();

    let client = reqwest::Client::builder().danger_accept_invalid_certs(true).build().unwrap();
    let response = post(&client, &format!("https://127.0.0.1:{port}/push"), "s3cret").await;

    assert_eq!(response.status(), 200);
    let envelope = sink.take().pop().unwrap();
    assert_eq!(envelope.kind(), SourceKind::ScmGitlab);
    assert_eq!(envelope.body().as_ref(), gitlab_push_body());

    let plain = reqwest::Client::new().post(format!("http://127.0.0.1:{port}/push")).send().await;
    assert!(plain.is_err() || plain.unwrap().status() != 200);

    manager.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn verified_listener_requires_client_certificate() {
    let files = tls_files();
    let port = free_port();
    let mut source = gitlab(port, "/push");
    source.server_cert_path = Some(files.cert.clone());
    source.server_key_path = Some(files.key.clone());
    source.ca_cert_path = Some(files.cert.clone());
    source.enable_ssl_verification = true;

    let sink = RecordingSink::new();
    let mut manager = manager(Arc::new(sink.clone()));
    manager.add("mtls", &source).await.unwrap();

    let client = reqwest::Client::builder().danger_accept_invalid_certs(true).build().unwrap();
    let result = client
        .post(format!("https://127.0.0.1:{port}/push"))
        .header("X-Gitlab-Token", "s3cret")
        .body(gitlab_push_body())
        .send()
        .await;

    assert!(result.is_err());
    assert_eq!(sink.count(), 0);

    manager.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn unreadable_tls_material_fails_the_source() {
    let port = free_port();
    let mut source = gitlab(port, "/push");
    source.server_cert_path = Some("/nonexistent/tls.crt".into());
    source.server_key_path = Some("/nonexistent/tls.key".into());
    let mut manager = manager(Arc::new(RecordingSink::new()));

    let err = manager.add("secure", &source).await.unwrap_err();

    assert_eq!(err.code(), "E1001");
    assert!(manager.sources().is_empty());
    assert!(port_is_free(port));
}
