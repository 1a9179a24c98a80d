//! End-to-end tests for the Streamable HTTP forwarder: the JSON reply path,
//! the SSE reply path, header policy, and routing errors.

mod common;

use axum::Router;
use axum::body::Body;
use axum::http::{HeaderMap, header};
use axum::routing::{any, post};
use bytes::Bytes;
use futures::StreamExt as _;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const JSON_REPLY: &str = r#"{"jsonrpc":"2.0","id":7,"result":{"tools":[]}}"#;
const SSE_FRAMES: &str =
    "event: message\ndata: one\n\nevent: message\ndata: two\n\nevent: message\ndata: three\n\n";

#[derive(Default, Clone)]
struct Seen {
    headers: Arc<Mutex<Vec<(String, String)>>>,
}

fn json_upstream(seen: Seen) -> Router {
    Router::new().route(
        "/mcp",
        post(move |headers: HeaderMap, body: String| async move {
            let mut captured = seen.headers.lock().unwrap();
            for (name, value) in &headers {
                captured.push((
                    name.as_str().to_string(),
                    value.to_str().unwrap_or_default().to_string(),
                ));
            }
            drop(captured);
            assert!(body.contains("tools/list"));
            (
                [
                    (header::CONTENT_TYPE, "application/json"),
                    (header::HeaderName::from_static("mcp-session-id"), "upstream-session"),
                    (header::SET_COOKIE, "sid=evil"),
                ],
                JSON_REPLY,
            )
        }),
    )
}

fn sse_upstream() -> Router {
    Router::new().route(
        "/mcp",
        any(|| async {
            (
                [
                    (header::CONTENT_TYPE, "text/event-stream"),
                    (header::HeaderName::from_static("mcp-session-id"), "sse-session-1"),
                ],
                Body::from(Bytes::from_static(SSE_FRAMES.as_bytes())),
            )
        }),
    )
}

#[tokio::test]
async fn post_json_reply_is_buffered_and_forwarded() {
    let seen = Seen::default();
    let upstream = common::serve_mock(json_upstream(seen.clone())).await;
    let proxy = common::spawn_proxy(
        &format!(
            "destinations:\n  dst2:\n    type: streamable_http\n    url: http://{upstream}/mcp\n"
        ),
        &[],
    )
    .unwrap();

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{}/dst2/mcp", proxy.data_base))
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::AUTHORIZATION, "Bearer secrettok")
        .header("x-forwarded-for", "1.2.3.4")
        .body(r#"{"jsonrpc":"2.0","id":7,"method":"tools/list","params":{}}"#)
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    // Upstream session id is preserved; set-cookie is stripped.
    assert_eq!(
        resp.headers().get("mcp-session-id").unwrap(),
        "upstream-session"
    );
    assert!(resp.headers().get(header::SET_COOKIE).is_none());
    assert_eq!(resp.text().await.unwrap(), JSON_REPLY);

    // Header policy on the upstream side: Authorization forwarded verbatim,
    // forwarding headers dropped.
    let captured = seen.headers.lock().unwrap().clone();
    assert!(captured
        .iter()
        .any(|(k, v)| k == "authorization" && v == "Bearer secrettok"));
    assert!(!captured.iter().any(|(k, _)| k == "x-forwarded-for"));

    // Audit record carries method, id, status, and both bodies.
    let lines = common::wait_for_audit(&proxy.log_path, Duration::from_secs(5), |lines| {
        lines.iter().any(|l| l["mcp_method"] == "tools/list")
    });
    let entry = lines
        .iter()
        .find(|l| l["mcp_method"] == "tools/list")
        .expect("audit entry");
    assert_eq!(entry["rpc_id"], 7);
    assert_eq!(entry["status_code"], 200);
    assert!(entry["request_body"].as_str().unwrap().contains("tools/list"));
    assert_eq!(entry["response_body"].as_str().unwrap(), JSON_REPLY);
}

#[tokio::test]
async fn post_sse_reply_streams_validated_frames() {
    let upstream = common::serve_mock(sse_upstream()).await;
    let proxy = common::spawn_proxy(
        &format!(
            "destinations:\n  dst2:\n    type: streamable_http\n    url: http://{upstream}/mcp\n"
        ),
        &[],
    )
    .unwrap();

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{}/dst2/mcp", proxy.data_base))
        .body(r#"{"jsonrpc":"2.0","id":1,"method":"tools/call"}"#)
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    assert!(resp
        .headers()
        .get(header::CONTENT_TYPE)
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));
    assert_eq!(resp.headers().get("mcp-session-id").unwrap(), "sse-session-1");

    let mut collected = String::new();
    let mut stream = resp.bytes_stream();
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(Ok(chunk)) = stream.next().await {
            collected.push_str(&String::from_utf8_lossy(&chunk));
            if collected.contains("three") {
                break;
            }
        }
    })
    .await;
    assert_eq!(collected, SSE_FRAMES);
}

#[tokio::test]
async fn get_opens_a_listen_stream() {
    let upstream = common::serve_mock(sse_upstream()).await;
    let proxy = common::spawn_proxy(
        &format!(
            "destinations:\n  dst2:\n    type: streamable_http\n    url: http://{upstream}/mcp\n"
        ),
        &[],
    )
    .unwrap();

    let client = reqwest::Client::new();
    let resp = client
        .get(format!("{}/dst2/mcp", proxy.data_base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let mut collected = String::new();
    let mut stream = resp.bytes_stream();
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(Ok(chunk)) = stream.next().await {
            collected.push_str(&String::from_utf8_lossy(&chunk));
            if collected.contains("three") {
                break;
            }
        }
    })
    .await;
    assert_eq!(collected, SSE_FRAMES);
}

#[tokio::test]
async fn routing_errors() {
    let proxy = common::spawn_proxy(
        "destinations:\n  legacy:\n    type: sse\n    url: http://127.0.0.1:9\n",
        &[],
    )
    .unwrap();
    let client = reqwest::Client::new();

    // Unknown destination.
    let resp = client
        .post(format!("{}/ghost/mcp", proxy.data_base))
        .body("{}")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    // Wrong destination kind.
    for method in [reqwest::Method::POST, reqwest::Method::GET, reqwest::Method::DELETE] {
        let resp = client
            .request(method, format!("{}/legacy/mcp", proxy.data_base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
    }
}

#[tokio::test]
async fn upstream_4xx_is_forwarded_on_get() {
    let upstream = common::serve_mock(Router::new().route(
        "/mcp",
        any(|| async { (axum::http::StatusCode::UNAUTHORIZED, r#"{"error":"unauthorized"}"#) }),
    ))
    .await;
    let proxy = common::spawn_proxy(
        &format!(
            "destinations:\n  dst2:\n    type: streamable_http\n    url: http://{upstream}/mcp\n"
        ),
        &[],
    )
    .unwrap();

    let client = reqwest::Client::new();
    let resp = client
        .get(format!("{}/dst2/mcp", proxy.data_base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
}

#[tokio::test]
async fn delete_is_forwarded_unchanged() {
    let upstream = common::serve_mock(Router::new().route(
        "/mcp",
        any(|method: axum::http::Method| async move {
            assert_eq!(method, axum::http::Method::DELETE);
            axum::http::StatusCode::NO_CONTENT
        }),
    ))
    .await;
    let proxy = common::spawn_proxy(
        &format!(
            "destinations:\n  dst2:\n    type: streamable_http\n    url: http://{upstream}/mcp\n"
        ),
        &[],
    )
    .unwrap();

    let client = reqwest::Client::new();
    let resp = client
        .delete(format!("{}/dst2/mcp", proxy.data_base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);
}
