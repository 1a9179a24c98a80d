//! Legacy MCP-over-SSE transport: a long-lived event stream plus a separate
//! message POST endpoint, glued together by the proxy session map.

use crate::audit::{DetectionAudit, RequestLog};
use crate::config::DestinationKind;
use crate::core::Core;
use crate::error::{
    error_body, gone_use_mcp, unknown_destination, upstream_unreachable, wrong_destination_kind,
};
use crate::headers::{client_response_headers, upstream_request_headers};
use crate::jsonrpc::{self, Envelope};
use crate::session::{LegacySession, SessionGuard, SessionMap, resolve_message_url, valid_session_id};
use crate::sse::{
    LineAction, SseEventTracker, TrackedLine, relay_sse_body, rewritten_endpoint_line,
};
use crate::upstream::{READ_TIMEOUT, send_with_retries};
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;

fn sse_url(base: &reqwest::Url) -> Result<reqwest::Url, ()> {
    let joined = format!("{}/sse", base.as_str().trim_end_matches('/'));
    reqwest::Url::parse(&joined).map_err(|_| ())
}

/// `GET /{dest}/sse` — open the upstream event stream, validate and rewrite
/// it, and relay to the client.
pub async fn get_sse(
    State(core): State<Arc<Core>>,
    Path(name): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let source_ip = addr.ip().to_string();
    let Some(dest) = core.registry.lookup(&name) else {
        let log = RequestLog::new(core.audit.clone(), &headers, source_ip, &name);
        log.emit(404, &Envelope::default(), Some("unknown destination".to_string()), None, None, None);
        return unknown_destination(&name);
    };
    let log = RequestLog::new(core.audit.clone(), &headers, source_ip, &name);

    match dest.kind {
        DestinationKind::Stdio => {
            log.emit(410, &Envelope::default(), None, None, None, None);
            return gone_use_mcp();
        }
        DestinationKind::StreamableHttp => {
            log.emit(400, &Envelope::default(), Some("wrong destination kind".to_string()), None, None, None);
            return wrong_destination_kind("sse");
        }
        DestinationKind::Sse => {}
    }

    let Some(base) = dest.url.clone() else {
        log.emit(500, &Envelope::default(), Some("destination has no url".to_string()), None, None, None);
        return error_body(StatusCode::INTERNAL_SERVER_ERROR, "Internal error");
    };
    let Ok(url) = sse_url(&base) else {
        log.emit(500, &Envelope::default(), Some("unbuildable sse url".to_string()), None, None, None);
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
            log.emit(502, &Envelope::default(), Some(e.to_string()), None, None, None);
            return upstream_unreachable();
        }
    };

    // Non-2xx is not a stream: 5xx was already retried away, so this is a
    // 3xx/4xx to hand back discretely.
    if !upstream.status().is_success() {
        let status = upstream.status();
        let resp_headers = client_response_headers(upstream.headers());
        let body = upstream.bytes().await.unwrap_or_default();
        log.emit(status.as_u16(), &Envelope::default(), Some(format!("upstream returned {status}")), None, None, None);
        let mut resp = (StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY), body).into_response();
        *resp.headers_mut() = resp_headers;
        return resp;
    }

    let filtered = client_response_headers(upstream.headers());

    let mut tracker = SseEventTracker::new();
    let mut guard = SessionGuard::new(core.sessions.clone());
    let sessions = core.sessions.clone();
    let dest_for_stream = dest.clone();

    let on_line = move |line: &str| -> LineAction {
        match tracker.observe(line) {
            TrackedLine::Forward => LineAction::Emit(line.to_string()),
            TrackedLine::Drop => LineAction::Skip,
            TrackedLine::EndpointData(payload) => {
                let message_url = match resolve_message_url(&dest_for_stream, &payload) {
                    Ok(url) => url,
                    Err(e) => return LineAction::Abort(e.to_string()),
                };
                let id = SessionMap::mint_id();
                let session = LegacySession {
                    destination: dest_for_stream.name.clone(),
                    upstream_message_url: message_url,
                };
                if let Err(e) = sessions.insert(id.clone(), session) {
                    return LineAction::Abort(e.to_string());
                }
                guard.track(id.clone());
                LineAction::Emit(rewritten_endpoint_line(&dest_for_stream.name, &id))
            }
        }
    };
    let on_done = move |error: Option<String>| {
        log.emit(200, &Envelope::default(), error, None, None, None);
    };

    let body = relay_sse_body(upstream, core.shutdown.clone(), on_line, on_done);

    let mut resp = Response::builder()
        .status(StatusCode::OK)
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
    *resp.headers_mut() = filtered;
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    resp.headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    resp.headers_mut().insert(
        axum::http::HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
    resp
}

#[derive(Debug, Deserialize)]
pub struct MessageParams {
    session_id: Option<String>,
}

/// `POST /{dest}/message?session_id=…` — forward one JSON-RPC message to the
/// upstream URL recorded for this session.
pub async fn post_message(
    State(core): State<Arc<Core>>,
    Path(name): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<MessageParams>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let source_ip = addr.ip().to_string();
    let log = RequestLog::new(core.audit.clone(), &headers, source_ip, &name);
    let envelope = jsonrpc::peek(&body);

    let Some(dest) = core.registry.lookup(&name) else {
        log.emit(404, &envelope, Some("unknown destination".to_string()), Some(body.clone()), None, None);
        return unknown_destination(&name);
    };
    match dest.kind {
        DestinationKind::Stdio => {
            log.emit(410, &envelope, None, Some(body.clone()), None, None);
            return gone_use_mcp();
        }
        DestinationKind::StreamableHttp => {
            log.emit(400, &envelope, Some("wrong destination kind".to_string()), Some(body.clone()), None, None);
            return wrong_destination_kind("sse");
        }
        DestinationKind::Sse => {}
    }

    let Some(session_id) = params.session_id else {
        log.emit(400, &envelope, Some("missing session_id".to_string()), Some(body.clone()), None, None);
        return error_body(StatusCode::BAD_REQUEST, "Missing session_id query parameter");
    };
    if !valid_session_id(&session_id) {
        log.emit(400, &envelope, Some("invalid session_id format".to_string()), Some(body.clone()), None, None);
        return error_body(StatusCode::BAD_REQUEST, "Invalid session_id format");
    }
    let Some(session) = core.sessions.lookup(&session_id) else {
        log.emit(404, &envelope, Some("unknown session".to_string()), Some(body.clone()), None, None);
        return error_body(StatusCode::NOT_FOUND, "Session not found");
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

    let upstream = match send_with_retries(
        &core.http,
        reqwest::Method::POST,
        session.upstream_message_url.clone(),
        upstream_request_headers(&headers),
        Some(effective.clone()),
        Some(READ_TIMEOUT),
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
    let resp_headers = client_response_headers(upstream.headers());
    let resp_body = match upstream.bytes().await {
        Ok(b) => b,
        Err(e) => {
            log.emit(502, &envelope, Some(e.to_string()), Some(effective), None, detection_audit);
            return upstream_unreachable();
        }
    };

    // Scanner hook, response direction.
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

    let mut resp = (
        StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY),
        out_body,
    )
        .into_response();
    *resp.headers_mut() = resp_headers;
    resp
}
