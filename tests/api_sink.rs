//! Result upload against an in-process HTTP endpoint.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::Value;

use common::{run_keys, station, Bed};
use xmnz_tester::model::Verdict;
use xmnz_tester::sink::{ApiClient, SinkError};
use xmnz_tester::TestResult;

#[derive(Clone)]
struct Endpoint {
    reply: StatusCode,
    received: Arc<Mutex<Vec<(Option<String>, Value)>>>,
}

async fn receive(
    State(ep): State<Endpoint>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> StatusCode {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    ep.received.lock().unwrap().push((auth, body));
    ep.reply
}

/// Serve `/results` on an ephemeral port; returns its URL and the request log.
async fn serve(reply: StatusCode) -> (String, Endpoint) {
    let ep = Endpoint {
        reply,
        received: Arc::new(Mutex::new(Vec::new())),
    };
    let app = Router::new()
        .route("/results", post(receive))
        .with_state(ep.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}/results", addr), ep)
}

#[tokio::test]
async fn test_post_carries_bearer_token_and_record() {
    let (url, ep) = serve(StatusCode::CREATED).await;
    let client = ApiClient::new(&url, "s3cret", Duration::from_secs(2)).unwrap();

    let mut result = TestResult::new("XMNZ-01");
    result.set_serial_number("25070001");
    result.finalize();
    client.send(&result).await.unwrap();

    let received = ep.received.lock().unwrap();
    assert_eq!(received.len(), 1);
    let (auth, body) = &received[0];
    assert_eq!(auth.as_deref(), Some("Bearer s3cret"));
    assert_eq!(body["station_id"], "XMNZ-01");
    assert_eq!(body["serial_number"], "25070001");
    assert_eq!(body["run_id"], result.run_id().to_string());
}

#[tokio::test]
async fn test_non_2xx_is_status_error() {
    let (url, _ep) = serve(StatusCode::INTERNAL_SERVER_ERROR).await;
    let client = ApiClient::new(&url, "k", Duration::from_secs(2)).unwrap();

    let err = client.send(&TestResult::new("ST")).await.unwrap_err();
    assert!(matches!(err, SinkError::Status { status: 500, .. }));
}

#[tokio::test]
async fn test_run_uploads_finalized_record() {
    let (url, ep) = serve(StatusCode::OK).await;
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = station(dir.path());
    cfg.api.endpoint_url = Some(url);
    cfg.api.key = "station-key".into();

    let out = run_keys(Bed::new(cfg), &["connect_battery", "apply_vin"]).await;
    assert_eq!(out.result.overall_status(), Verdict::Pass);

    let received = ep.received.lock().unwrap();
    assert_eq!(received.len(), 1);
    let (auth, body) = &received[0];
    assert_eq!(auth.as_deref(), Some("Bearer station-key"));
    assert_eq!(body["run_id"], out.result.run_id().to_string());
    assert!(!body["end_time"].is_null());
    assert_eq!(body["steps"].as_array().unwrap().len(), 2);
    assert!(out.events.iter().any(|e| e.message == "Result uploaded to API"));
}

#[tokio::test]
async fn test_rejected_upload_does_not_change_verdict() {
    let (url, _ep) = serve(StatusCode::SERVICE_UNAVAILABLE).await;
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = station(dir.path());
    cfg.api.endpoint_url = Some(url);

    let out = run_keys(Bed::new(cfg), &["connect_battery"]).await;

    assert_eq!(out.result.overall_status(), Verdict::Pass);
    assert_eq!(out.result.steps().len(), 1);
    assert!(out
        .events
        .iter()
        .any(|e| e.message.starts_with("API upload failed")));
}
