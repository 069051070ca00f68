/// Integration tests for the bureau HTTP client against a mocked bureau API.
mod common;

use chrono::NaiveDate;
use rust_prescreen_api::bureau_client::{BureauApi, HttpBureauClient, PrescreenRequest, ProbeStatus};
use rust_prescreen_api::errors::AppError;
use rust_prescreen_api::models::{BureauCode, DateRange};
use std::time::Duration;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client_for(server: &MockServer) -> HttpBureauClient {
    HttpBureauClient::new(
        Some(server.uri()),
        Some("test_key".to_string()),
        Some(server.uri()),
        Duration::from_secs(5),
        Duration::from_secs(2),
    )
    .unwrap()
}

fn request() -> PrescreenRequest {
    PrescreenRequest::new(
        &common::program(),
        BureauCode::Tu,
        &common::record("Lovelace", "123456789"),
    )
}

#[tokio::test]
async fn test_prescreen_successful_response() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/prescreen"))
        .and(header("authorization", "Bearer test_key"))
        .and(body_partial_json(serde_json::json!({
            "bureaus": ["tu"],
            "record": {"lastName": "Lovelace", "ssn": "123456789"},
            "outputAttributes": ["inquiries_6m"]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "hit": true,
            "creditScore": 688,
            "attributes": {"inquiries_6m": 2, "has_mortgage": true}
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let response = client_for(&mock_server).prescreen(&request()).await.unwrap();
    assert!(response.hit);
    assert_eq!(response.credit_score, Some(688));
    assert_eq!(response.attributes["has_mortgage"], serde_json::json!(true));
}

#[tokio::test]
async fn test_prescreen_error_does_not_leak_body() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/prescreen"))
        .respond_with(
            ResponseTemplate::new(500).set_body_string("upstream failure for ssn 123456789"),
        )
        .mount(&mock_server)
        .await;

    let err = client_for(&mock_server)
        .prescreen(&request())
        .await
        .unwrap_err();
    let message = err.to_string();
    assert!(matches!(err, AppError::ExternalApiError(_)));
    assert!(message.contains("500"), "{}", message);
    assert!(!message.contains("123456789"), "{}", message);
}

#[tokio::test]
async fn test_prescreen_malformed_json() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/prescreen"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
        .mount(&mock_server)
        .await;

    let err = client_for(&mock_server)
        .prescreen(&request())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("malformed JSON"));
}

#[tokio::test]
async fn test_health_probe_statuses() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/health"))
        .respond_with(ResponseTemplate::new(403))
        .up_to_n_times(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&mock_server)
        .await;

    let client = client_for(&mock_server);
    let blocked = client.health_probe().await;
    assert_eq!(blocked.status, ProbeStatus::Blocked);
    assert!(blocked.latency_ms.is_some());

    let connected = client.health_probe().await;
    assert_eq!(connected.status, ProbeStatus::Connected);
    assert!(connected.detail.is_none());
}

#[tokio::test]
async fn test_cost_report_rows() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/billing/report"))
        .and(query_param("from", "2026-09-01"))
        .and(query_param("to", "2026-09-30"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "rows": [{
                "date": "2026-09-03",
                "bureau": "eq",
                "matches": 41,
                "baseCost": "20.50",
                "triggerCost": "3.10",
                "total": "23.60"
            }]
        })))
        .mount(&mock_server)
        .await;

    let range = DateRange::new(
        NaiveDate::from_ymd_opt(2026, 9, 1).unwrap(),
        NaiveDate::from_ymd_opt(2026, 9, 30).unwrap(),
    )
    .unwrap();
    let rows = client_for(&mock_server).cost_report(&range).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].bureau, BureauCode::Eq);
    assert_eq!(rows[0].matches, 41);
    assert!(rows[0].add_on_costs.contains_key("triggerCost"));
}

#[tokio::test]
async fn test_cost_report_without_billing_url() {
    let client = HttpBureauClient::new(
        Some("https://bureau.example.com".to_string()),
        Some("key".to_string()),
        None,
        Duration::from_secs(5),
        Duration::from_secs(1),
    )
    .unwrap();
    let today = chrono::Utc::now().date_naive();
    let err = client
        .cost_report(&DateRange::new(today, today).unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Configuration(_)));
}
