//! Proxy error taxonomy and HTTP mapping.
//!
//! Client-side rejections (4xx) are produced directly at the handler
//! boundary as responses; `Capacity` and `Timeout` map to 503/504 there too.
//! `Upstream` and `Bridge` errors pass through the retry/supervisor layers
//! first. Exception text is logged server-side and never placed in
//! client-visible bodies.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("{0}")]
    Config(String),
    #[error("{0}")]
    Upstream(String),
    #[error("{0}")]
    Bridge(String),
    #[error("rpc response timeout")]
    Timeout,
    #[error("{0}")]
    Capacity(String),
    #[error("{0}")]
    Internal(String),
}

/// A small JSON error body: `{"error": "..."}`.
pub fn error_body(status: StatusCode, message: &str) -> Response {
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        serde_json::json!({ "error": message }).to_string(),
    )
        .into_response()
}

pub fn unknown_destination(name: &str) -> Response {
    error_body(
        StatusCode::NOT_FOUND,
        &format!("Unknown destination: {name}"),
    )
}

pub fn wrong_destination_kind(expected: &str) -> Response {
    error_body(
        StatusCode::BAD_REQUEST,
        &format!("Destination does not support this transport (expected {expected})"),
    )
}

/// Static 502 body; the upstream failure detail stays in the audit log.
pub fn upstream_unreachable() -> Response {
    error_body(StatusCode::BAD_GATEWAY, "Upstream unreachable")
}

pub fn gone_use_mcp() -> Response {
    error_body(
        StatusCode::GONE,
        "This transport has been removed for stdio destinations; use /{destination}/mcp",
    )
}
