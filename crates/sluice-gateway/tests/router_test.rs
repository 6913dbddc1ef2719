//! Request dispatch tests.
//!
//! Drives the port router in-process with `oneshot` to cover every
//! response a provider can see: 200, 400, 401, 404, 405, and 413.

use std::sync::Arc;

use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    response::Response,
    Router,
};
use serde_json::Value;
use sluice_core::{EnvelopeSink, SecretValue, SourceKind};
use sluice_gateway::{
    crypto::generate_hmac_hex, create_router, Authenticator, Route, RouteTable, MAX_PAYLOAD_SIZE,
};
use sluice_testing::{gitlab_push_body, FailingSink, RecordingSink};
use tower::ServiceExt;

fn gitlab_app(sink: Arc<dyn EnvelopeSink>) -> Router {
    let routes = RouteTable::new();
    routes.insert(
        "/push",
        Arc::new(Route::new(
            "gitlab-push",
            SourceKind::ScmGitlab,
            Method::POST,
            Authenticator::GitlabToken(SecretValue::new("s3cret")),
            sink,
        )),
    );
    create_router(routes)
}

fn push(token: Option<&str>, body: impl Into<Body>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/push")
        .header(header::CONTENT_TYPE, "application/json")
        .header("X-Gitlab-Event", "Push Hook");
    if let Some(token) = token {
        builder = builder.header("X-Gitlab-Token", token);
    }
    builder.body(body.into()).unwrap()
}

async fn json_body(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn authenticated_push_is_delivered_unmodified() {
    let sink = RecordingSink::new();
    let app = gitlab_app(Arc::new(sink.clone()));

    let response = app.oneshot(push(Some("s3cret"), gitlab_push_body())).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));
    let body = json_body(response).await;
    assert_eq!(body["status"], "accepted");

    let envelopes = sink.take();
    assert_eq!(envelopes.len(), 1);
    assert_eq!(envelopes[0].kind(), SourceKind::ScmGitlab);
    assert_eq!(envelopes[0].body().as_ref(), gitlab_push_body());
    assert_eq!(body["envelope_id"], envelopes[0].id().to_string());

    let headers = envelopes[0].metadata().get("headers").unwrap();
    assert_eq!(headers["x-gitlab-event"], "Push Hook");
    assert!(headers.get("x-gitlab-token").is_none());
}

#[tokio::test]
async fn wrong_method_is_rejected_before_the_adapter() {
    let sink = RecordingSink::new();
    let app = gitlab_app(Arc::new(sink.clone()));

    let request = Request::builder()
        .method("GET")
        .uri("/push")
        .header("X-Gitlab-Token", "s3cret")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(response.headers()[header::ALLOW], "POST");
    assert_eq!(json_body(response).await["error"]["code"], "METHOD_NOT_ALLOWED");
    assert_eq!(sink.count(), 0);
}

#[tokio::test]
async fn unknown_path_is_not_found() {
    let app = gitlab_app(Arc::new(RecordingSink::new()));

    let request = Request::builder().method("POST").uri("/other").body(Body::from("{}")).unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(response.headers().contains_key("x-request-id"));
}

#[tokio::test]
async fn bad_or_missing_token_is_unauthorized() {
    let sink = RecordingSink::new();
    let app = gitlab_app(Arc::new(sink.clone()));

    for token in [None, Some("wrong"), Some("")] {
        let response = app.clone().oneshot(push(token, gitlab_push_body())).await.unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(response).await["error"]["code"], "E1002");
    }

    assert_eq!(sink.count(), 0);
}

#[tokio::test]
async fn non_json_body_is_bad_request() {
    let sink = RecordingSink::new();
    let app = gitlab_app(Arc::new(sink.clone()));

    let response = app.oneshot(push(Some("s3cret"), "ref=main")).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["error"]["code"], "E1003");
    assert_eq!(sink.count(), 0);
}

#[tokio::test]
async fn oversized_body_is_rejected() {
    let app = gitlab_app(Arc::new(RecordingSink::new()));

    let response =
        app.oneshot(push(Some("s3cret"), vec![b' '; MAX_PAYLOAD_SIZE + 1])).await.unwrap();

    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(json_body(response).await["error"]["code"], "E1005");
}

#[tokio::test]
async fn delivery_failure_still_acknowledges() {
    let app = gitlab_app(Arc::new(FailingSink));

    let response = app.oneshot(push(Some("s3cret"), gitlab_push_body())).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn github_signature_is_verified() {
    let sink = RecordingSink::new();
    let routes = RouteTable::new();
    routes.insert(
        "/github",
        Arc::new(Route::new(
            "github-push",
            SourceKind::ScmGithub,
            Method::POST,
            Authenticator::GithubSignature(SecretValue::new("hook-secret")),
            Arc::new(sink.clone()),
        )),
    );
    let app = create_router(routes);
    let body = br#"{"ref":"refs/heads/main","repository":{"full_name":"acme/widgets"}}"#;
    let signature = format!("sha256={}", generate_hmac_hex(body, b"hook-secret").unwrap());

    let signed = Request::builder()
        .method("POST")
        .uri("/github")
        .header("X-Hub-Signature-256", &signature)
        .header("X-GitHub-Event", "push")
        .body(Body::from(body.to_vec()))
        .unwrap();
    let response = app.clone().oneshot(signed).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let tampered = Request::builder()
        .method("POST")
        .uri("/github")
        .header("X-Hub-Signature-256", &signature)
        .body(Body::from(r#"{"ref":"refs/heads/evil"}"#))
        .unwrap();
    let response = app.oneshot(tampered).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let envelopes = sink.take();
    assert_eq!(envelopes.len(), 1);
    assert_eq!(envelopes[0].kind(), SourceKind::ScmGithub);
}

#[tokio::test]
async fn generic_webhook_requires_bearer_token() {
    let sink = RecordingSink::new();
    let routes = RouteTable::new();
    routes.insert(
        "/deploys",
        Arc::new(Route::new(
            "deploys",
            SourceKind::GenericWebhook,
            Method::PUT,
            Authenticator::Bearer(SecretValue::new("tok")),
            Arc::new(sink.clone()),
        )),
    );
    let app = create_router(routes);

    let request = Request::builder()
        .method("PUT")
        .uri("/deploys")
        .header(header::AUTHORIZATION, "Bearer tok")
        .body(Body::from(r#"{"event":"deploy.finished"}"#))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let envelope = sink.take().pop().unwrap();
    assert_eq!(envelope.kind(), SourceKind::GenericWebhook);
    assert!(envelope.metadata().get("headers").is_none());
}
