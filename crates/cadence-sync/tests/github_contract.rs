//! GitHub review provider contract tests.
//!
//! Verify the exact REST calls made when opening a pull request and how
//! error responses map onto the error taxonomy.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use cadence_core::CadenceError;
use cadence_sync::{GitHubReviewProvider, ReviewProvider, ReviewRequest};
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{body_json, body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn request(labels: &[&str]) -> ReviewRequest {
    ReviewRequest {
        title: "[cadence] parallel run of 1 task(s)".into(),
        body: "Automated changes".into(),
        head: "cadence-sync-20260101-000000".into(),
        base: "main".into(),
        labels: labels.iter().map(|l| l.to_string()).collect(),
    }
}

fn provider(server: &MockServer, token: Option<&str>) -> GitHubReviewProvider {
    GitHubReviewProvider::new(
        server.uri(),
        "acme",
        "reports",
        token.map(String::from),
        Duration::from_secs(5),
    )
    .unwrap()
}

// ────────────────────────────────────────────────────────────────────────────
// Request format
// ────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn opens_pull_request_and_labels_it() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/repos/acme/reports/pulls"))
        .and(header("authorization", "Bearer secret"))
        .and(body_partial_json(json!({
            "head": "cadence-sync-20260101-000000",
            "base": "main",
            "title": "[cadence] parallel run of 1 task(s)"
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "number": 42,
            "html_url": "https://github.example.test/acme/reports/pull/42"
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/repos/acme/reports/issues/42/labels"))
        .and(body_json(json!({ "labels": ["automation", "reports"] })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&server)
        .await;

    let url = provider(&server, Some("secret"))
        .open(&request(&["automation", "reports"]))
        .await
        .unwrap();
    assert_eq!(url, "https://github.example.test/acme/reports/pull/42");
}

#[tokio::test]
async fn no_labels_means_no_label_call() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/repos/acme/reports/pulls"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "number": 1,
            "html_url": "https://github.example.test/acme/reports/pull/1"
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/repos/acme/reports/issues/1/labels"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    provider(&server, Some("secret")).open(&request(&[])).await.unwrap();
}

// ────────────────────────────────────────────────────────────────────────────
// Error mapping
// ────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn unauthorized_is_auth_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/repos/acme/reports/pulls"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "message": "Bad credentials"
        })))
        .mount(&server)
        .await;

    let err = provider(&server, Some("stale"))
        .open(&request(&[]))
        .await
        .unwrap_err();
    assert!(matches!(err, CadenceError::SyncAuthFailure(_)));
    assert!(err.to_string().contains("Bad credentials"));
}

#[tokio::test]
async fn validation_error_is_http_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/repos/acme/reports/pulls"))
        .respond_with(ResponseTemplate::new(422).set_body_json(json!({
            "message": "Validation Failed",
            "errors": [{"message": "A pull request already exists"}]
        })))
        .mount(&server)
        .await;

    let err = provider(&server, Some("secret"))
        .open(&request(&[]))
        .await
        .unwrap_err();
    assert!(matches!(err, CadenceError::Http(_)));
    assert!(err.to_string().contains("422"));
}

#[tokio::test]
async fn label_failure_is_not_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/repos/acme/reports/pulls"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "number": 9,
            "html_url": "https://github.example.test/acme/reports/pull/9"
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/repos/acme/reports/issues/9/labels"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let url = provider(&server, Some("secret"))
        .open(&request(&["automation"]))
        .await
        .unwrap();
    assert!(url.ends_with("/pull/9"));
}

#[tokio::test]
async fn missing_token_never_calls_api() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(201))
        .expect(0)
        .mount(&server)
        .await;

    let err = provider(&server, None).open(&request(&[])).await.unwrap_err();
    assert!(matches!(err, CadenceError::SyncAuthFailure(_)));
}

#[tokio::test]
async fn stalled_api_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/repos/acme/reports/pulls"))
        .respond_with(
            ResponseTemplate::new(201)
                .set_delay(Duration::from_secs(5))
                .set_body_json(json!({ "number": 3, "html_url": "unused" })),
        )
        .mount(&server)
        .await;

    let gh = GitHubReviewProvider::new(
        server.uri(),
        "acme",
        "reports",
        Some("secret".into()),
        Duration::from_millis(300),
    )
    .unwrap();
    let started = std::time::Instant::now();
    let err = gh.open(&request(&[])).await.unwrap_err();
    assert!(matches!(err, CadenceError::Http(_)));
    assert!(err.to_string().contains("timed out"));
    assert!(started.elapsed() < Duration::from_secs(4));
}
