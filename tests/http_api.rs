/// Router-level tests: authentication header, status codes and JSON shapes.
mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use std::sync::Arc;
use tower::ServiceExt;

use rust_prescreen_api::api::build_router;
use rust_prescreen_api::coordinator::CoordinatorSettings;
use rust_prescreen_api::handlers::AppState;

use common::Harness;

async fn app() -> (Harness, Router) {
    let h = Harness::new().await;
    let state = AppState::new(
        h.dyn_store(),
        h.bureau.clone(),
        h.vault.clone(),
        CoordinatorSettings::default(),
    );
    let router = build_router(Arc::new(state)).unwrap();
    (h, router)
}

fn request(method: &str, uri: &str, actor: Option<&str>, body: Option<serde_json::Value>) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("x-forwarded-for", "198.51.100.4");
    if let Some(actor) = actor {
        builder = builder.header("x-actor-id", actor);
    }
    match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_needs_no_identity() {
    let (_h, app) = app().await;
    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["service"], "rust-prescreen-api");
}

#[tokio::test]
async fn bureau_health_reports_probe() {
    let (_h, app) = app().await;
    let response = app
        .oneshot(request("GET", "/api/v1/bureau/health", None, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["status"], "connected");
}

#[tokio::test]
async fn missing_actor_header_is_unauthorized() {
    let (_h, app) = app().await;
    let response = app
        .oneshot(request("GET", "/api/v1/leads", None, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn submitting_one_record_is_a_bad_request() {
    let (h, app) = app().await;
    let body = serde_json::json!({
        "program_id": h.program.id,
        "records": serde_json::to_value(common::records(&["Solo"])).unwrap(),
    });
    let response = app
        .oneshot(request("POST", "/api/v1/batches", Some("analyst-1"), Some(body)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert!(body["error"].as_str().unwrap().contains("minimum batch size"));
    assert_eq!(h.bureau.calls(), 0);
}

#[tokio::test]
async fn submitted_batch_is_accepted_and_processed() {
    let (h, app) = app().await;
    let body = serde_json::json!({
        "program_id": h.program.id,
        "name": "api batch",
        "records": serde_json::to_value(common::records(&["A", "B"])).unwrap(),
    });
    let response = app
        .clone()
        .oneshot(request("POST", "/api/v1/batches", Some("analyst-1"), Some(body)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let accepted = json_body(response).await;
    assert_eq!(accepted["status"], "processing");
    let batch_id = accepted["batch_id"].as_str().unwrap().to_string();

    let mut status = String::new();
    for _ in 0..15 {
        let response = app
            .clone()
            .oneshot(request(
                "GET",
                &format!("/api/v1/batches/{}", batch_id),
                Some("analyst-1"),
                None,
            ))
            .await
            .unwrap();
        let detail = json_body(response).await;
        status = detail["batch"]["status"].as_str().unwrap().to_string();
        if status != "processing" {
            assert_eq!(detail["leads"].as_array().unwrap().len(), 2);
            assert!(detail["leads"][0].get("ssn_encrypted").is_none());
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    assert_eq!(status, "completed");
}

#[tokio::test]
async fn usage_rejects_inverted_range() {
    let (_h, app) = app().await;
    let response = app
        .oneshot(request(
            "GET",
            "/api/v1/usage?from=2026-10-01&to=2026-09-01",
            Some("analyst-1"),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
