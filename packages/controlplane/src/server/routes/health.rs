use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

/// GET /healthz
pub async fn health_handler() -> impl IntoResponse {
    Json(json!({ "ok": true }))
}
