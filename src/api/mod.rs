//! HTTP surface: router assembly, middleware and API documentation routes.

pub mod handlers {
    pub use crate::handlers::*;
}

use axum::{
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post, put},
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};

use crate::handlers::{self as h, AppState};

/// Serves the OpenAPI specification YAML file from the working directory.
async fn serve_openapi_spec() -> impl IntoResponse {
    match tokio::fs::read_to_string("openapi.yml").await {
        Ok(content) => (
            StatusCode::OK,
            [(axum::http::header::CONTENT_TYPE, "text/yaml")],
            content,
        )
            .into_response(),
        Err(_) => (StatusCode::NOT_FOUND, "OpenAPI spec not found").into_response(),
    }
}

/// Serves the Swagger UI HTML page, pointed at `/api-docs/openapi.yml`.
async fn serve_swagger_ui() -> impl IntoResponse {
    let html = r#"
<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>Prescreen API - Swagger UI</title>
    <link rel="stylesheet" type="text/css" href="https://unpkg.com/swagger-ui-dist@5/swagger-ui.css">
    <style>
        body { margin: 0; padding: 0; }
    </style>
</head>
<body>
    <div id="swagger-ui"></div>
    <script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-bundle.js"></script>
    <script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-standalone-preset.js"></script>
    <script>
        window.onload = function() {
            window.ui = SwaggerUIBundle({
                url: "/api-docs/openapi.yml",
                dom_id: '#swagger-ui',
                deepLinking: true,
                presets: [
                    SwaggerUIBundle.presets.apis,
                    SwaggerUIStandalonePreset
                ],
                layout: "StandaloneLayout"
            });
        };
    </script>
</body>
</html>
"#;
    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/html; charset=utf-8")],
        html,
    )
}

/// Builds the full application router.
///
/// Everything except `/health` sits behind the per-IP rate limiter and the
/// 5MB body limit. The limiter keys on `X-Forwarded-For`/`X-Real-IP` and
/// falls back to the peer address, so the server must be started with
/// connect info.
pub fn build_router(state: Arc<AppState>) -> anyhow::Result<Router> {
    // 10 requests/second per IP, burst of 20
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(10)
            .burst_size(20)
            .key_extractor(SmartIpKeyExtractor)
            .finish()
            .ok_or_else(|| anyhow::anyhow!("invalid rate limiter configuration"))?,
    );

    let protected_routes = Router::new()
        // API Documentation
        .route("/docs", get(serve_swagger_ui))
        .route("/api-docs/openapi.yml", get(serve_openapi_spec))
        // Bureau connectivity
        .route("/api/v1/bureau/health", get(h::bureau_health))
        // Programs
        .route(
            "/api/v1/programs",
            get(h::list_programs).post(h::create_program),
        )
        .route(
            "/api/v1/programs/:id",
            get(h::get_program).put(h::update_program),
        )
        // Batches
        .route(
            "/api/v1/batches",
            get(h::list_batches).post(h::submit_batch),
        )
        .route(
            "/api/v1/batches/:id",
            get(h::get_batch_detail).patch(h::rename_batch),
        )
        .route("/api/v1/batches/:id/retry", post(h::retry_batch))
        // Leads
        .route("/api/v1/leads", get(h::list_leads))
        .route("/api/v1/leads/:id", get(h::get_lead_detail))
        .route("/api/v1/leads/:id/decrypt", post(h::decrypt_lead_field))
        .route("/api/v1/leads/:id/notes", put(h::update_lead_notes))
        .route("/api/v1/leads/:id/firm-offer", put(h::record_firm_offer))
        .route("/api/v1/leads/:id/hard-pulls", post(h::add_hard_pull))
        .route("/api/v1/hard-pulls/:id", delete(h::delete_hard_pull))
        // Retry queue
        .route("/api/v1/retry-queue", get(h::list_retry_queue))
        .route("/api/v1/retry-queue/enqueue", post(h::enqueue_retry))
        .route("/api/v1/retry-queue/dequeue", post(h::dequeue_retry))
        .route("/api/v1/retry-queue/materialize", post(h::materialize_retry))
        .route("/api/v1/retry-queue/resubmit", post(h::resubmit_retry))
        // Audit & usage
        .route("/api/v1/audit", get(h::list_audit_entries))
        .route("/api/v1/usage", get(h::get_usage_summary))
        .layer(
            ServiceBuilder::new()
                .layer(RequestBodyLimitLayer::new(5 * 1024 * 1024))
                .layer(GovernorLayer {
                    config: governor_conf,
                }),
        );

    // Health check bypasses rate limiting for platform probes
    Ok(Router::new()
        .route("/health", get(h::health))
        .merge(protected_routes)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive()))
}
