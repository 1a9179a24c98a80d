//! SSE wire handling: incremental line splitting, field validation, and the
//! endpoint-event rewrite state machine.
//!
//! Validation is a whitelist. A line is forwarded only when it is blank
//! (event terminator) or begins with one of the five SSE field prefixes;
//! everything else is silently dropped. Frames are never reordered.

use bytes::Bytes;
use futures::{SinkExt as _, StreamExt as _};

/// Reassembles complete lines from arbitrary byte chunks. Carries the
/// unterminated tail across chunks; strips `\n` and an optional `\r`.
#[derive(Debug, Default)]
pub struct SseLineFeed {
    buf: Vec<u8>,
}

impl SseLineFeed {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let rest = self.buf.split_off(pos + 1);
            let mut line = std::mem::replace(&mut self.buf, rest);
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }
}

/// Whitelist check for one SSE line.
#[must_use]
pub fn valid_sse_line(line: &str) -> bool {
    line.is_empty()
        || line.starts_with("data:")
        || line.starts_with("event:")
        || line.starts_with("id:")
        || line.starts_with("retry:")
        || line.starts_with(':')
}

/// Where a validated line should go.
#[derive(Debug, PartialEq, Eq)]
pub enum TrackedLine {
    /// Pass through unchanged.
    Forward,
    /// Invalid line; drop silently.
    Drop,
    /// `data:` payload of an `event: endpoint` frame; the caller rewrites it.
    EndpointData(String),
}

/// Tracks the current event name so `endpoint` data lines can be intercepted.
#[derive(Debug, Default)]
pub struct SseEventTracker {
    current_event: Option<String>,
}

impl SseEventTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, line: &str) -> TrackedLine {
        if line.is_empty() {
            self.current_event = None;
            return TrackedLine::Forward;
        }
        if !valid_sse_line(line) {
            return TrackedLine::Drop;
        }
        if let Some(event) = line.strip_prefix("event:") {
            self.current_event = Some(event.trim().to_string());
            return TrackedLine::Forward;
        }
        if let Some(data) = line.strip_prefix("data:") {
            if self.current_event.as_deref() == Some("endpoint") {
                self.current_event = None;
                return TrackedLine::EndpointData(data.trim().to_string());
            }
        }
        TrackedLine::Forward
    }
}

/// The rewritten `data:` line the client sees for an endpoint event.
#[must_use]
pub fn rewritten_endpoint_line(destination: &str, session_id: &str) -> String {
    format!("data: /{destination}/message?session_id={session_id}")
}

/// Per-line decision made by a relay callback.
pub enum LineAction {
    Emit(String),
    Skip,
    /// Stop relaying; the message lands in the audit record, not the client.
    Abort(String),
}

/// Relay an upstream SSE body to the client line-by-line.
///
/// A pump task reads the upstream stream, feeds complete lines through
/// `on_line`, and forwards emitted lines into the response body. The task
/// ends on upstream EOF, upstream error, `Abort`, client disconnect (the
/// body channel closes), or process shutdown; `on_done` then runs exactly
/// once with the terminal error, if any — cleanup and the audit record live
/// there.
pub fn relay_sse_body<F, D>(
    upstream: reqwest::Response,
    shutdown: tokio_util::sync::CancellationToken,
    mut on_line: F,
    on_done: D,
) -> axum::body::Body
where
    F: FnMut(&str) -> LineAction + Send + 'static,
    D: FnOnce(Option<String>) + Send + 'static,
{
    let (mut tx, rx) = futures::channel::mpsc::channel::<Result<Bytes, std::convert::Infallible>>(32);

    tokio::spawn(async move {
        let mut feed = SseLineFeed::new();
        let mut stream = upstream.bytes_stream();
        let mut error: Option<String> = None;

        'pump: loop {
            let next = tokio::select! {
                () = shutdown.cancelled() => break 'pump,
                next = stream.next() => next,
            };
            let Some(chunk) = next else { break };
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    error = Some(e.to_string());
                    break;
                }
            };
            for line in feed.push(&chunk) {
                match on_line(&line) {
                    LineAction::Emit(out) => {
                        let mut bytes = out.into_bytes();
                        bytes.push(b'\n');
                        if tx.send(Ok(Bytes::from(bytes))).await.is_err() {
                            // Client went away; upstream read is cancelled.
                            break 'pump;
                        }
                    }
                    LineAction::Skip => {}
                    LineAction::Abort(message) => {
                        error = Some(message);
                        break 'pump;
                    }
                }
            }
        }

        on_done(error);
    });

    axum::body::Body::from_stream(rx)
}
