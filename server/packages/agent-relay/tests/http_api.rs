use std::time::Duration;

use axum::body::Body;
use axum::http::{header, HeaderMap, Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::util::ServiceExt;

use agent_relay::config::RelayConfig;
use agent_relay::model::{ChatBackend, MockChatBackend};
use agent_relay::router::{build_router, AppState};
use agent_relay::run_manager::RunManager;
use agent_relay::settings_store::SettingsStore;

struct TestApp {
    app: Router,
    _settings_dir: TempDir,
}

impl TestApp {
    fn new(backend: MockChatBackend, api_key: Option<&str>) -> Self {
        let settings_dir = tempfile::tempdir().expect("create temp settings dir");
        let store = SettingsStore::with_dir(settings_dir.path());
        if let Some(api_key) = api_key {
            store.set_provider(Some(api_key), None).expect("store key");
        }

        let config = RelayConfig::default();
        let run_manager = RunManager::with_backend(
            config.clone(),
            store.clone(),
            ChatBackend::Mock(backend),
        );
        let state = AppState::with_run_manager(config, store, run_manager);
        Self {
            app: build_router(state),
            _settings_dir: settings_dir,
        }
    }
}

async fn send_request(
    app: &Router,
    method: Method,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, HeaderMap, Vec<u8>) {
    let mut builder = Request::builder().method(method).uri(uri);

    let request_body = if let Some(body) = body {
        builder = builder.header(header::CONTENT_TYPE, "application/json");
        Body::from(body.to_string())
    } else {
        Body::empty()
    };

    let request = builder.body(request_body).expect("build request");
    let response = app.clone().oneshot(request).await.expect("request handled");
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("collect body")
        .to_bytes();

    (status, headers, bytes.to_vec())
}

fn parse_json(bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(bytes).expect("valid json")
    }
}

fn run_request(run_id: &str) -> Value {
    json!({
        "runId": run_id,
        "prompt": "You are a test assistant.",
        "conversation": [{"role": "user", "content": "Hi"}]
    })
}

fn slow_backend() -> MockChatBackend {
    MockChatBackend::completing(&["slow"]).with_delay(Duration::from_millis(500))
}

#[tokio::test]
async fn status_reports_service_identity() {
    let app = TestApp::new(MockChatBackend::default(), None);

    let (status, _, body) = send_request(&app.app, Method::GET, "/status", None).await;
    assert_eq!(status, StatusCode::OK);

    let body = parse_json(&body);
    assert_eq!(body["service"], "agentrelay");
    assert_eq!(body["protocolVersion"], "1.0");
    assert_eq!(body["agentsEtag"], "bootstrap");
    assert_eq!(body["maxConcurrentRuns"], 1);
    assert_eq!(body["metadata"]["provider"]["apiKeySet"], false);
    assert!(body["startedAt"].is_string());
}

#[tokio::test]
async fn status_reports_key_set_without_echoing_it() {
    let app = TestApp::new(MockChatBackend::default(), Some("sk-secret"));

    let (status, _, body) = send_request(&app.app, Method::GET, "/status", None).await;
    assert_eq!(status, StatusCode::OK);

    let text = String::from_utf8_lossy(&body).to_string();
    assert!(!text.contains("sk-secret"));

    let body = parse_json(&body);
    assert_eq!(body["metadata"]["provider"]["apiKeySet"], true);
    assert!(body["metadata"]["provider"]["model"].is_string());
    assert!(body["metadata"]["provider"]["baseUrl"].is_string());
}

#[tokio::test]
async fn provider_settings_round_trip_without_echoing_key() {
    let app = TestApp::new(MockChatBackend::default(), None);

    let payload = json!({"apiKey": "sk-secret", "baseUrl": "https://example.test/v1"});
    let (status, _, body) =
        send_request(&app.app, Method::POST, "/settings/provider", Some(payload)).await;
    assert_eq!(status, StatusCode::OK);

    let body = parse_json(&body);
    assert_eq!(body["apiKeySet"], true);
    assert_eq!(body["baseUrl"], "https://example.test/v1");
    assert!(body.get("apiKey").is_none());

    let (status, _, body) = send_request(&app.app, Method::GET, "/settings/provider", None).await;
    assert_eq!(status, StatusCode::OK);
    let body = parse_json(&body);
    assert_eq!(body["apiKeySet"], true);
    assert!(body.get("apiKey").is_none());
}

#[tokio::test]
async fn reset_provider_settings_clears_key() {
    let app = TestApp::new(MockChatBackend::default(), Some("sk-secret"));

    let (status, _, body) =
        send_request(&app.app, Method::DELETE, "/settings/provider", None).await;
    assert_eq!(status, StatusCode::OK);

    let body = parse_json(&body);
    assert_eq!(body["apiKeySet"], false);

    let (_, _, body) = send_request(&app.app, Method::GET, "/settings/provider", None).await;
    assert_eq!(parse_json(&body)["apiKeySet"], false);
}

#[tokio::test]
async fn create_run_is_accepted_with_location() {
    let app = TestApp::new(slow_backend(), Some("sk-test"));

    let (status, headers, body) =
        send_request(&app.app, Method::POST, "/runs", Some(run_request("run-1"))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(
        headers
            .get(header::LOCATION)
            .and_then(|value| value.to_str().ok()),
        Some("/runs/run-1/events")
    );

    let body = parse_json(&body);
    assert_eq!(body["runId"], "run-1");
    assert_eq!(body["status"], "accepted");
}

#[tokio::test]
async fn create_run_generates_id_when_absent() {
    let app = TestApp::new(slow_backend(), Some("sk-test"));

    let (status, headers, body) = send_request(
        &app.app,
        Method::POST,
        "/runs",
        Some(json!({"prompt": "hello"})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let body = parse_json(&body);
    let run_id = body["runId"].as_str().expect("generated run id");
    assert!(!run_id.is_empty());
    assert_eq!(
        headers
            .get(header::LOCATION)
            .and_then(|value| value.to_str().ok()),
        Some(format!("/runs/{run_id}/events").as_str())
    );
}

#[tokio::test]
async fn empty_run_id_gets_a_generated_one() {
    let app = TestApp::new(slow_backend(), Some("sk-test"));

    let payload = json!({"runId": "", "prompt": "hello"});
    let (status, _, body) = send_request(&app.app, Method::POST, "/runs", Some(payload)).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let run_id = parse_json(&body)["runId"]
        .as_str()
        .expect("generated run id")
        .to_string();
    assert!(!run_id.is_empty());
}

#[tokio::test]
async fn blank_run_id_is_rejected() {
    let app = TestApp::new(slow_backend(), Some("sk-test"));

    let payload = json!({"runId": "   ", "prompt": "hello"});
    let (status, _, body) = send_request(&app.app, Method::POST, "/runs", Some(payload)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        parse_json(&body)["type"],
        "urn:agentrelay:error:invalid_request"
    );
}

#[tokio::test]
async fn duplicate_run_id_is_a_conflict() {
    let app = TestApp::new(slow_backend(), Some("sk-test"));

    let (status, _, _) =
        send_request(&app.app, Method::POST, "/runs", Some(run_request("run-1"))).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, _, body) =
        send_request(&app.app, Method::POST, "/runs", Some(run_request("run-1"))).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let body = parse_json(&body);
    assert_eq!(body["type"], "urn:agentrelay:error:run_already_exists");
    assert_eq!(body["status"], 409);
    assert_eq!(body["runId"], "run-1");
}

#[tokio::test]
async fn out_of_range_temperature_is_rejected() {
    let app = TestApp::new(slow_backend(), Some("sk-test"));

    let payload = json!({"runId": "run-1", "constraints": {"temperature": 5.0}});
    let (status, _, body) = send_request(&app.app, Method::POST, "/runs", Some(payload)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let body = parse_json(&body);
    assert_eq!(body["type"], "urn:agentrelay:error:invalid_request");

    // a rejected request never registers the run
    let (status, _, _) =
        send_request(&app.app, Method::GET, "/runs/run-1/events", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn zero_tool_timeout_is_rejected() {
    let app = TestApp::new(slow_backend(), Some("sk-test"));

    let payload = json!({
        "runId": "run-1",
        "toolInventory": [{"id": "search", "timeoutSec": 0}]
    });
    let (status, _, body) = send_request(&app.app, Method::POST, "/runs", Some(payload)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        parse_json(&body)["type"],
        "urn:agentrelay:error:invalid_request"
    );
}

#[tokio::test]
async fn events_for_unknown_run_are_not_found() {
    let app = TestApp::new(MockChatBackend::default(), Some("sk-test"));

    let (status, _, body) =
        send_request(&app.app, Method::GET, "/runs/ghost/events", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let body = parse_json(&body);
    assert_eq!(body["type"], "urn:agentrelay:error:run_not_found");
    assert_eq!(body["runId"], "ghost");
}

#[tokio::test]
async fn cancel_of_unknown_run_is_not_found() {
    let app = TestApp::new(MockChatBackend::default(), Some("sk-test"));

    let (status, _, body) =
        send_request(&app.app, Method::POST, "/runs/ghost/cancel", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(
        parse_json(&body)["type"],
        "urn:agentrelay:error:run_not_found"
    );
}

#[tokio::test]
async fn cancel_of_active_run_is_accepted() {
    let app = TestApp::new(slow_backend(), Some("sk-test"));

    let (status, _, _) =
        send_request(&app.app, Method::POST, "/runs", Some(run_request("run-1"))).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, _, body) =
        send_request(&app.app, Method::POST, "/runs/run-1/cancel", None).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let body = parse_json(&body);
    assert_eq!(body["runId"], "run-1");
    assert_eq!(body["status"], "cancelling");
}

#[tokio::test]
async fn run_events_stream_as_sse_until_completion() {
    let backend = MockChatBackend::completing(&["Hello", " world"]);
    let app = TestApp::new(backend, Some("sk-test"));

    let (status, _, _) =
        send_request(&app.app, Method::POST, "/runs", Some(run_request("run-1"))).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let request = Request::builder()
        .method(Method::GET)
        .uri("/runs/run-1/events")
        .body(Body::empty())
        .expect("build request");
    let response = app.app.clone().oneshot(request).await.expect("sse response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok()),
        Some("text/event-stream")
    );

    // the body is finite: it ends when the run reaches a terminal event
    let bytes = tokio::time::timeout(Duration::from_secs(5), async {
        response.into_body().collect().await
    })
    .await
    .expect("stream ends")
    .expect("collect sse body")
    .to_bytes();
    let text = String::from_utf8_lossy(&bytes);

    assert!(text.contains("event: run.started"));
    assert!(text.contains("event: run.delta"));
    assert!(text.contains("Hello"));
    assert!(text.contains("event: run.completed"));
    assert!(text.contains("Hello world"));
}

#[tokio::test]
async fn second_event_subscription_is_a_conflict() {
    let app = TestApp::new(slow_backend(), Some("sk-test"));

    let (status, _, _) =
        send_request(&app.app, Method::POST, "/runs", Some(run_request("run-1"))).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let request = Request::builder()
        .method(Method::GET)
        .uri("/runs/run-1/events")
        .body(Body::empty())
        .expect("build request");
    let first = app.app.clone().oneshot(request).await.expect("sse response");
    assert_eq!(first.status(), StatusCode::OK);

    let (status, _, body) =
        send_request(&app.app, Method::GET, "/runs/run-1/events", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(parse_json(&body)["type"], "urn:agentrelay:error:conflict");
}

#[tokio::test]
async fn openapi_document_lists_run_paths() {
    let app = TestApp::new(MockChatBackend::default(), None);

    let (status, _, body) = send_request(&app.app, Method::GET, "/openapi.json", None).await;
    assert_eq!(status, StatusCode::OK);

    let body = parse_json(&body);
    assert!(body["paths"]["/runs"].is_object());
    assert!(body["paths"]["/runs/{run_id}/events"].is_object());
    assert!(body["paths"]["/runs/{run_id}/cancel"].is_object());
    assert!(body["paths"]["/settings/provider"].is_object());
}
