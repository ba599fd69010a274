//! Error surface for the HTTP layer.
//!
//! Failures that happen before the downstream stream starts map to an
//! OpenAI-style error body. Failures after the first byte has been sent
//! cannot change the status line; the stream is finalized instead.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),

    #[error("upstream returned status {status}: {body}")]
    UpstreamStatus { status: u16, body: String },

    #[error("invalid request: {0}")]
    BadRequest(String),
}

impl ProxyError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Upstream(_) | Self::UpstreamStatus { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Upstream(_) | Self::UpstreamStatus { .. } => "server_error",
            Self::BadRequest(_) => "invalid_request_error",
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::Upstream(_) => "upstream_unreachable",
            Self::UpstreamStatus { .. } => "upstream_error",
            Self::BadRequest(_) => "bad_request",
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        tracing::warn!(code = self.code(), "request failed: {self}");
        let body = serde_json::json!({
            "error": {
                "message": self.to_string(),
                "type": self.kind(),
                "code": self.code(),
            }
        });
        let mut response = (status, axum::Json(body)).into_response();
        crate::api::apply_cors(response.headers_mut());
        response
    }
}
