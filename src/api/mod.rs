pub mod chat;
pub mod types;

use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use http::{header, HeaderMap, HeaderValue, StatusCode};

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/v1/chat/completions",
            post(chat::chat_completions).options(preflight),
        )
        .route(
            "/chat/completions",
            post(chat::chat_completions).options(preflight),
        )
        .route("/health", get(health))
        .with_state(state)
}

/// Permissive CORS; the proxy fronts browser-based clients.
pub(crate) fn apply_cors(headers: &mut HeaderMap) {
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("authorization, content-type"),
    );
}

async fn preflight() -> impl IntoResponse {
    let mut headers = HeaderMap::new();
    apply_cors(&mut headers);
    (StatusCode::NO_CONTENT, headers)
}

async fn health() -> impl IntoResponse {
    let mut headers = HeaderMap::new();
    apply_cors(&mut headers);
    (headers, axum::Json(serde_json::json!({ "status": "ok" })))
}
