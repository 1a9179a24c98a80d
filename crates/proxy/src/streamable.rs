//! Streamable HTTP forwarder: `POST`/`GET`/`DELETE` on `/{dest}/mcp`.
//!
//! One upstream POST reply is relayed polymorphically: a JSON reply is
//! buffered and returned discretely, an SSE reply switches the handler into
//! streaming mode with line validation. stdio destinations dispatch into the
//! subprocess bridge; the wire surface is identical either way.

use crate::audit::{DetectionAudit, RequestLog};
use crate::bridge;
use crate::config::DestinationKind;
use crate::core::Core;
use crate::error::{
    error_body, unknown_destination, upstream_unreachable, wrong_destination_kind,
};
use crate::headers::{client_response_headers, upstream_request_headers};
use crate::jsonrpc::{self, Envelope};
use crate::sse::{LineAction, relay_sse_body, valid_sse_line};
use crate::upstream::{READ_TIMEOUT, send_with_retries};
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::OwnedSemaphorePermit;

fn content_type(headers: &HeaderMap) -> &str {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

fn capacity_exhausted(name: &str) -> Response {
    error_body(
        StatusCode::SERVICE_UNAVAILABLE,
        &format!("Too many concurrent requests for '{name}'"),
    )
}

/// Grab a concurrency slot for the full lifetime of a request, including a
/// streaming tail (the permit rides inside the relay's completion closure).
fn acquire_slot(core: &Core, name: &str) -> Option<OwnedSemaphorePermit> {
    core.semaphores
        .get(name)
        .and_then(|sem| sem.clone().try_acquire_owned().ok())
}

/// `POST /{dest}/mcp`.
pub async fn post_mcp(
    State(core): State<Arc<Core>>,
    Path(name): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let source_ip = addr.ip().to_string();
    let envelope = jsonrpc::peek(&body);
    let Some(dest) = core.registry.lookup(&name) else {
        let log = RequestLog::new(core.audit.clone(), &headers, source_ip, &name);
        log.emit(404, &envelope, Some("unknown destination".to_string()), Some(body.clone()), None, None);
        return unknown_destination(&name);
    };

    match dest.kind {
        DestinationKind::Stdio => {
            let bridge = match core.bridges.get(&name) {
                Some(b) => b,
                None => return unknown_destination(&name),
            };
            return bridge::handle_post(bridge, &core.scanner, &headers, source_ip, body).await;
        }
        DestinationKind::Sse => {
            let log = RequestLog::new(core.audit.clone(), &headers, source_ip, &name);
            log.emit(400, &envelope, Some("wrong destination kind".to_string()), Some(body.clone()), None, None);
            return wrong_destination_kind("streamable_http or stdio");
        }
        DestinationKind::StreamableHttp => {}
    }

    let log = RequestLog::new(core.audit.clone(), &headers, source_ip, &name);
    let Some(permit) = acquire_slot(&core, &name) else {
        log.emit(503, &envelope, Some("concurrency cap".to_string()), Some(body.clone()), None, None);
        return capacity_exhausted(&name);
    };

    // Scanner hook, request direction.
    let mut effective = body.clone();
    let mut detection_audit: Option<DetectionAudit> = None;
    if let Ok(text) = std::str::from_utf8(&body) {
        let detection = core
            .scanner
            .scan(text, &dest.scan, palisade_scan::Direction::Request)
            .await;
        match detection.action {
            palisade_scan::Action::Pass => {}
            palisade_scan::Action::Block => {
                let error = jsonrpc::error_envelope(
                    &envelope.id,
                    jsonrpc::INVALID_REQUEST,
                    "Request blocked by content policy",
                );
                let out = error.to_string();
                log.emit(
                    200,
                    &envelope,
                    None,
                    Some(body.clone()),
                    Some(Bytes::from(out.clone())),
                    Some(DetectionAudit {
                        action: detection.action.as_str(),
                        engine: detection.engine,
                        detail: detection.detail,
                    }),
                );
                return (
                    StatusCode::OK,
                    [(header::CONTENT_TYPE, "application/json")],
                    out,
                )
                    .into_response();
            }
            action => {
                detection_audit = Some(DetectionAudit {
                    action: action.as_str(),
                    engine: detection.engine,
                    detail: detection.detail.clone(),
                });
                if action == palisade_scan::Action::Redact {
                    effective = Bytes::from(detection.body.into_bytes());
                }
            }
        }
    }

    let Some(url) = dest.url.clone() else {
        log.emit(500, &envelope, Some("destination has no url".to_string()), Some(effective), None, detection_audit);
        return error_body(StatusCode::INTERNAL_SERVER_ERROR, "Internal error");
    };

    let upstream = match send_with_retries(
        &core.http,
        reqwest::Method::POST,
        url,
        upstream_request_headers(&headers),
        Some(effective.clone()),
        None,
    )
    .await
    {
        Ok(resp) => resp,
        Err(e) => {
            log.emit(502, &envelope, Some(e.to_string()), Some(effective), None, detection_audit);
            return upstream_unreachable();
        }
    };

    let status = upstream.status();
    let filtered = client_response_headers(upstream.headers());

    if content_type(upstream.headers()).starts_with("text/event-stream") {
        // Streaming mode: relay validated SSE lines byte-for-byte. The
        // upstream `Mcp-Session-Id` header survives the response filter.
        return stream_response(
            &core,
            upstream,
            filtered,
            log,
            envelope,
            Some(effective),
            detection_audit,
            permit,
        );
    }

    // Discrete mode: buffer the reply under the non-streaming read timeout.
    let resp_body = match tokio::time::timeout(READ_TIMEOUT, upstream.bytes()).await {
        Ok(Ok(b)) => b,
        Ok(Err(e)) => {
            log.emit(502, &envelope, Some(e.to_string()), Some(effective), None, detection_audit);
            return upstream_unreachable();
        }
        Err(_) => {
            log.emit(502, &envelope, Some("upstream body read timed out".to_string()), Some(effective), None, detection_audit);
            return upstream_unreachable();
        }
    };

    // Scanner hook, response direction (discrete JSON replies only).
    let mut out_body = resp_body.clone();
    if let Ok(text) = std::str::from_utf8(&resp_body) {
        let detection = core
            .scanner
            .scan(text, &dest.scan, palisade_scan::Direction::Response)
            .await;
        match detection.action {
            palisade_scan::Action::Pass => {}
            palisade_scan::Action::Block => {
                let error = jsonrpc::error_envelope(
                    &envelope.id,
                    jsonrpc::INTERNAL_ERROR,
                    "Response blocked by content policy",
                );
                let out = error.to_string();
                log.emit(
                    200,
                    &envelope,
                    None,
                    Some(effective),
                    Some(Bytes::from(out.clone())),
                    Some(DetectionAudit {
                        action: detection.action.as_str(),
                        engine: detection.engine,
                        detail: detection.detail,
                    }),
                );
                return (
                    StatusCode::OK,
                    [(header::CONTENT_TYPE, "application/json")],
                    out,
                )
                    .into_response();
            }
            action => {
                detection_audit = Some(DetectionAudit {
                    action: action.as_str(),
                    engine: detection.engine,
                    detail: detection.detail.clone(),
                });
                if action == palisade_scan::Action::Redact {
                    out_body = Bytes::from(detection.body.into_bytes());
                }
            }
        }
    }

    log.emit(
        status.as_u16(),
        &envelope,
        None,
        Some(effective),
        Some(out_body.clone()),
        detection_audit,
    );
    drop(permit);

    let mut resp = (
        StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY),
        out_body,
    )
        .into_response();
    *resp.headers_mut() = filtered;
    resp
}

/// `GET /{dest}/mcp` — long-lived listen stream.
pub async fn get_mcp(
    State(core): State<Arc<Core>>,
    Path(name): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let source_ip = addr.ip().to_string();
    let envelope = Envelope::default();
    let Some(dest) = core.registry.lookup(&name) else {
        let log = RequestLog::new(core.audit.clone(), &headers, source_ip, &name);
        log.emit(404, &envelope, Some("unknown destination".to_string()), None, None, None);
        return unknown_destination(&name);
    };

    match dest.kind {
        DestinationKind::Stdio => {
            let bridge = match core.bridges.get(&name) {
                Some(b) => b,
                None => return unknown_destination(&name),
            };
            return bridge::handle_get(bridge, &headers, source_ip).await;
        }
        DestinationKind::Sse => {
            let log = RequestLog::new(core.audit.clone(), &headers, source_ip, &name);
            log.emit(400, &envelope, Some("wrong destination kind".to_string()), None, None, None);
            return wrong_destination_kind("streamable_http or stdio");
        }
        DestinationKind::StreamableHttp => {}
    }

    let log = RequestLog::new(core.audit.clone(), &headers, source_ip, &name);
    let Some(permit) = acquire_slot(&core, &name) else {
        log.emit(503, &envelope, Some("concurrency cap".to_string()), None, None, None);
        return capacity_exhausted(&name);
    };

    let Some(url) = dest.url.clone() else {
        log.emit(500, &envelope, Some("destination has no url".to_string()), None, None, None);
        return error_body(StatusCode::INTERNAL_SERVER_ERROR, "Internal error");
    };

    let upstream = match send_with_retries(
        &core.http,
        reqwest::Method::GET,
        url,
        upstream_request_headers(&headers),
        None,
        None,
    )
    .await
    {
        Ok(resp) => resp,
        Err(e) => {
            log.emit(502, &envelope, Some(e.to_string()), None, None, None);
            return upstream_unreachable();
        }
    };

    if !upstream.status().is_success() {
        let status = upstream.status();
        let resp_headers = client_response_headers(upstream.headers());
        let body = upstream.bytes().await.unwrap_or_default();
        log.emit(status.as_u16(), &envelope, Some(format!("upstream returned {status}")), None, None, None);
        drop(permit);
        let mut resp = (
            StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY),
            body,
        )
            .into_response();
        *resp.headers_mut() = resp_headers;
        return resp;
    }

    let filtered = client_response_headers(upstream.headers());
    stream_response(&core, upstream, filtered, log, envelope, None, None, permit)
}

/// `DELETE /{dest}/mcp` — forwarded unchanged; terminates the upstream
/// Streamable HTTP session.
pub async fn delete_mcp(
    State(core): State<Arc<Core>>,
    Path(name): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let source_ip = addr.ip().to_string();
    let envelope = Envelope::default();
    let Some(dest) = core.registry.lookup(&name) else {
        let log = RequestLog::new(core.audit.clone(), &headers, source_ip, &name);
        log.emit(404, &envelope, Some("unknown destination".to_string()), None, None, None);
        return unknown_destination(&name);
    };

    match dest.kind {
        DestinationKind::Stdio => {
            let bridge = match core.bridges.get(&name) {
                Some(b) => b,
                None => return unknown_destination(&name),
            };
            return bridge::handle_delete(bridge, &headers, source_ip).await;
        }
        DestinationKind::Sse => {
            let log = RequestLog::new(core.audit.clone(), &headers, source_ip, &name);
            log.emit(400, &envelope, Some("wrong destination kind".to_string()), None, None, None);
            return wrong_destination_kind("streamable_http or stdio");
        }
        DestinationKind::StreamableHttp => {}
    }

    let log = RequestLog::new(core.audit.clone(), &headers, source_ip, &name);
    let Some(url) = dest.url.clone() else {
        log.emit(500, &envelope, Some("destination has no url".to_string()), None, None, None);
        return error_body(StatusCode::INTERNAL_SERVER_ERROR, "Internal error");
    };

    let upstream = match send_with_retries(
        &core.http,
        reqwest::Method::DELETE,
        url,
        upstream_request_headers(&headers),
        (!body.is_empty()).then(|| body.clone()),
        Some(READ_TIMEOUT),
    )
    .await
    {
        Ok(resp) => resp,
        Err(e) => {
            log.emit(502, &envelope, Some(e.to_string()), None, None, None);
            return upstream_unreachable();
        }
    };

    let status = upstream.status();
    let resp_headers = client_response_headers(upstream.headers());
    let resp_body = upstream.bytes().await.unwrap_or_default();
    log.emit(status.as_u16(), &envelope, None, None, None, None);

    let mut resp = (
        StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY),
        resp_body,
    )
        .into_response();
    *resp.headers_mut() = resp_headers;
    resp
}

/// Relay an upstream SSE body with field validation, no rewriting. The
/// concurrency permit and the audit record travel with the stream and settle
/// when it ends.
#[allow(clippy::too_many_arguments)]
fn stream_response(
    core: &Core,
    upstream: reqwest::Response,
    filtered_headers: HeaderMap,
    log: RequestLog,
    envelope: Envelope,
    request_body: Option<Bytes>,
    detection: Option<DetectionAudit>,
    permit: OwnedSemaphorePermit,
) -> Response {
    let status = upstream.status();
    let on_line = |line: &str| -> LineAction {
        if valid_sse_line(line) {
            LineAction::Emit(line.to_string())
        } else {
            LineAction::Skip
        }
    };
    let on_done = move |error: Option<String>| {
        log.emit(status.as_u16(), &envelope, error, request_body, None, detection);
        drop(permit);
    };

    let body = relay_sse_body(upstream, core.shutdown.clone(), on_line, on_done);
    let mut resp = Response::builder()
        .status(StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::OK))
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
    *resp.headers_mut() = filtered_headers;
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    resp.headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    resp
}
