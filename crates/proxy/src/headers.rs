//! Header policy for both proxy directions.
//!
//! The client's `Authorization` header is forwarded verbatim; the proxy owns
//! no credential store. `X-Forwarded-*` from clients is dropped because no
//! trusted fronting proxy is assumed — the source ip comes from the transport
//! peer only.

use axum::http::{HeaderMap, HeaderName};

/// Request headers never forwarded upstream.
const REQUEST_STRIP: &[&str] = &[
    "host",
    "content-length",
    "transfer-encoding",
    "connection",
    "keep-alive",
    "x-forwarded-for",
    "x-real-ip",
    "x-forwarded-host",
    "x-forwarded-proto",
];

/// Response headers never returned to the client.
const RESPONSE_STRIP: &[&str] = &[
    "transfer-encoding",
    "connection",
    "keep-alive",
    "content-length",
    "set-cookie",
    "www-authenticate",
    "proxy-authenticate",
];

fn filtered(headers: &HeaderMap, strip: &[&str]) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if strip.contains(&name.as_str()) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Client request headers → headers for the upstream request.
#[must_use]
pub fn upstream_request_headers(headers: &HeaderMap) -> HeaderMap {
    filtered(headers, REQUEST_STRIP)
}

/// Upstream response headers → headers for the client response.
#[must_use]
pub fn client_response_headers(headers: &HeaderMap) -> HeaderMap {
    filtered(headers, RESPONSE_STRIP)
}

/// Log correlation tag: the first eight characters of a Bearer token, or
/// `anonymous`. The full credential never reaches the audit log.
#[must_use]
pub fn user_tag(headers: &HeaderMap) -> String {
    let Some(auth) = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    else {
        return "anonymous".to_string();
    };
    let Some(token) = auth
        .strip_prefix("Bearer ")
        .or_else(|| auth.strip_prefix("bearer "))
    else {
        return "anonymous".to_string();
    };
    let token = token.trim();
    if token.is_empty() {
        return "anonymous".to_string();
    }
    token.chars().take(8).collect()
}

pub const MCP_SESSION_ID: HeaderName = HeaderName::from_static("mcp-session-id");
