// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Handler-level API tests using an in-memory stack; no listener is bound
//! and no provider is ever reached.

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use tower::ServiceExt;

use council_config::Config;
use council_core::{EventHub, Orchestrator, ProviderRouter};
use council_model::Timeouts;
use council_node::{router, AppState};
use council_store::{Aes256GcmProtector, CredentialStore, SqliteStore};

const USER: &str = "tester@example.com";

fn app_with_config(config: Config) -> Router {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let protector = Arc::new(
        Aes256GcmProtector::from_base64_key(&Aes256GcmProtector::generate_key_b64()).unwrap(),
    );
    let credentials = Arc::new(CredentialStore::new(Arc::clone(&store), protector));
    let hub = Arc::new(EventHub::new(256));
    let provider_router = Arc::new(ProviderRouter::new(
        Arc::clone(&credentials),
        Timeouts::default(),
        config.max_retries,
    ));
    let orchestrator = Orchestrator::new(
        Arc::clone(&store),
        Arc::clone(&hub),
        provider_router,
        config.orchestration.clone(),
    );
    router(AppState::new(
        store,
        credentials,
        hub,
        orchestrator,
        Arc::new(config),
    ))
}

fn app() -> Router {
    app_with_config(Config::default())
}

fn request(method: Method, uri: &str, body: Option<serde_json::Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("x-user-email", USER)
        .header(header::CONTENT_TYPE, "application/json");
    match body {
        Some(json) => builder.body(Body::from(json.to_string())).unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn json_body(resp: axum::response::Response) -> serde_json::Value {
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn session_payload() -> serde_json::Value {
    serde_json::json!({
        "name": "tcp summary",
        "topic": "Summarize TCP congestion control",
        "maxIterations": 3,
        "creator": {
            "rootPrompt": "You draft summaries.",
            "modelName": "gpt-4o"
        },
        "reviewers": [
            {
                "id": "rev-style",
                "displayName": "Style",
                "rootPrompt": "You review style.",
                "modelName": "gpt-4o-mini"
            }
        ]
    })
}

#[tokio::test]
async fn healthz_responds_ok() {
    let resp = app()
        .oneshot(request(Method::GET, "/healthz", None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn create_get_and_list_sessions() {
    let app = app();

    let resp = app
        .clone()
        .oneshot(request(Method::POST, "/session", Some(session_payload())))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let created = json_body(resp).await;
    assert_eq!(created["status"], "created");
    assert_eq!(created["maxIterations"], 3);
    assert_eq!(created["stopMarker"], "FINAL:");
    assert_eq!(created["reviewers"][0]["id"], "rev-style");
    let id = created["sessionId"].as_str().unwrap().to_string();

    let resp = app
        .clone()
        .oneshot(request(Method::GET, &format!("/session/{id}"), None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let fetched = json_body(resp).await;
    assert_eq!(fetched["name"], "tcp summary");

    let resp = app
        .clone()
        .oneshot(request(Method::GET, "/sessions", None))
        .await
        .unwrap();
    let listed = json_body(resp).await;
    assert_eq!(listed.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn create_session_requires_a_reviewer() {
    let mut payload = session_payload();
    payload["reviewers"] = serde_json::json!([]);
    let resp = app()
        .oneshot(request(Method::POST, "/session", Some(payload)))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body = json_body(resp).await;
    assert!(body["error"].as_str().unwrap().contains("reviewer"));
}

#[tokio::test]
async fn create_session_rejects_bad_sampling_ranges() {
    let mut payload = session_payload();
    payload["creator"]["temperature"] = serde_json::json!(9.0);
    let resp = app()
        .oneshot(request(Method::POST, "/session", Some(payload)))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_session_is_404() {
    let resp = app()
        .oneshot(request(
            Method::GET,
            &format!("/session/{}", uuid::Uuid::new_v4()),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

// Scenario: start with a roster model that has no stored key.
#[tokio::test]
async fn start_without_keys_is_rejected_with_named_models() {
    let app = app();

    let resp = app
        .clone()
        .oneshot(request(Method::POST, "/session", Some(session_payload())))
        .await
        .unwrap();
    let created = json_body(resp).await;
    let id = created["sessionId"].as_str().unwrap().to_string();

    // Register only the creator's model; the reviewer's stays keyless.
    let resp = app
        .clone()
        .oneshot(request(
            Method::POST,
            "/models",
            Some(serde_json::json!({
                "modelName": "gpt-4o",
                "provider": "openai",
                "apiKey": "sk-test"
            })),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = app
        .clone()
        .oneshot(request(
            Method::POST,
            &format!("/session/{id}/start"),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body = json_body(resp).await;
    let error = body["error"].as_str().unwrap();
    assert!(error.starts_with("Missing API key(s) for models:"), "{error}");
    assert!(error.contains("gpt-4o-mini"));
    assert!(!error.contains("sk-test"));

    // The gate rejected before any state change.
    let resp = app
        .clone()
        .oneshot(request(Method::GET, &format!("/session/{id}"), None))
        .await
        .unwrap();
    let session = json_body(resp).await;
    assert_eq!(session["status"], "created");
}

#[tokio::test]
async fn model_crud_flow_never_echoes_keys() {
    let app = app();

    let resp = app
        .clone()
        .oneshot(request(
            Method::POST,
            "/models",
            Some(serde_json::json!({
                "modelName": "gpt-4o",
                "displayName": "Primary",
                "provider": "openai",
                "apiKey": "sk-super-secret"
            })),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let created = json_body(resp).await;
    assert_eq!(created["modelName"], "gpt-4o");
    assert_eq!(created["hasKey"], true);
    assert!(created.get("apiKey").is_none());
    assert!(!created.to_string().contains("sk-super-secret"));
    let model_id = created["id"].as_str().unwrap().to_string();

    // Duplicate name for the same user conflicts.
    let resp = app
        .clone()
        .oneshot(request(
            Method::POST,
            "/models",
            Some(serde_json::json!({
                "modelName": "gpt-4o",
                "provider": "openai"
            })),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);

    // Update display name only.
    let resp = app
        .clone()
        .oneshot(request(
            Method::PUT,
            &format!("/models/{model_id}"),
            Some(serde_json::json!({ "displayName": "Renamed" })),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let updated = json_body(resp).await;
    assert_eq!(updated["displayName"], "Renamed");
    assert_eq!(updated["hasKey"], true);

    // Listing shows the entry, still without key material.
    let resp = app
        .clone()
        .oneshot(request(Method::GET, "/models", None))
        .await
        .unwrap();
    let listed = json_body(resp).await;
    assert_eq!(listed.as_array().unwrap().len(), 1);
    assert!(!listed.to_string().contains("sk-super-secret"));

    // Delete, then the list is empty.
    let resp = app
        .clone()
        .oneshot(request(Method::DELETE, &format!("/models/{model_id}"), None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let resp = app
        .clone()
        .oneshot(request(Method::GET, "/models", None))
        .await
        .unwrap();
    let listed = json_body(resp).await;
    assert!(listed.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn model_create_uses_registry_default_endpoint() {
    let app = app();
    let resp = app
        .clone()
        .oneshot(request(
            Method::POST,
            "/models",
            Some(serde_json::json!({
                "modelName": "grok-3",
                "provider": "xai",
                "apiKey": "k"
            })),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let created = json_body(resp).await;
    assert_eq!(
        created["endpoint"],
        "https://api.x.ai/v1/chat/completions"
    );

    // Azure has no default endpoint; omitting it is a validation error.
    let resp = app
        .clone()
        .oneshot(request(
            Method::POST,
            "/models",
            Some(serde_json::json!({
                "modelName": "my-deployment",
                "provider": "azure"
            })),
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn mutations_require_user_identity() {
    let resp = app()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/models")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    serde_json::json!({ "modelName": "m", "provider": "openai" }).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body = json_body(resp).await;
    assert!(body["error"].as_str().unwrap().contains("x-user-email"));
}

#[tokio::test]
async fn mutating_routes_are_rate_limited() {
    let mut config = Config::default();
    config.rate_limit.permit_limit = 2;
    config.rate_limit.window_seconds = 3600;
    let app = app_with_config(config);

    for _ in 0..2 {
        let resp = app
            .clone()
            .oneshot(request(Method::POST, "/session", Some(session_payload())))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
    let resp = app
        .clone()
        .oneshot(request(Method::POST, "/session", Some(session_payload())))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);

    // Reads stay unthrottled.
    let resp = app
        .clone()
        .oneshot(request(Method::GET, "/sessions", None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}
