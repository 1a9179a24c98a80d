//! stdio bridge: one supervised subprocess per stdio destination, surfaced
//! through the Streamable HTTP transport.
//!
//! The bridge owns its tables by value: pending calls, the session set, and
//! the notification queues. Sessions are plain ids; request handlers hold
//! only borrowed references for the duration of a request.
//!
//! Three long-lived tasks run per bridge: a stdout dispatcher, a stderr
//! tail, and a supervisor. The supervisor restarts a crashed child with
//! backoff until the budget is spent, after which the bridge is unavailable
//! and every request answers 503.

use crate::audit::{AuditSink, DetectionAudit, RequestLog};
use crate::config::Destination;
use crate::error::{ProxyError, error_body};
use crate::headers::MCP_SESSION_ID;
use crate::jsonrpc::{self, Envelope};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::SinkExt as _;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Bounded per-stream notification buffer; oldest entries drop on overflow.
pub const QUEUE_CAPACITY: usize = 256;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

fn default_restart_delays() -> Vec<Duration> {
    vec![
        Duration::from_millis(500),
        Duration::from_millis(1000),
        Duration::from_millis(2000),
    ]
}

/// Knobs the bridge takes from process settings (tests shrink the delays).
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub max_sessions: usize,
    pub rpc_timeout: Duration,
    pub restart_delays: Vec<Duration>,
}

impl BridgeSettings {
    #[must_use]
    pub fn new(max_sessions: usize, rpc_timeout: Duration) -> Self {
        Self {
            max_sessions,
            rpc_timeout,
            restart_delays: default_restart_delays(),
        }
    }
}

/// Strict UUIDv4 check: lowercase hyphenated form only.
#[must_use]
pub fn valid_uuid4(s: &str) -> bool {
    if s.len() != 36 {
        return false;
    }
    let Ok(u) = uuid::Uuid::parse_str(s) else {
        return false;
    };
    u.get_version() == Some(uuid::Version::Random) && s == u.as_hyphenated().to_string()
}

struct PendingCall {
    client_id: Value,
    tx: oneshot::Sender<Value>,
}

/// Bounded FIFO with drop-oldest overflow; one per active GET stream.
pub struct NotificationQueue {
    inner: Mutex<QueueState>,
    notify: tokio::sync::Notify,
}

struct QueueState {
    buf: VecDeque<String>,
    closed: bool,
    dropped: u64,
}

impl NotificationQueue {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(QueueState {
                buf: VecDeque::with_capacity(QUEUE_CAPACITY),
                closed: false,
                dropped: 0,
            }),
            notify: tokio::sync::Notify::new(),
        })
    }

    /// Never blocks: at capacity the oldest entry is discarded.
    pub fn push(&self, line: &str) {
        {
            let mut st = self.inner.lock();
            if st.closed {
                return;
            }
            if st.buf.len() >= QUEUE_CAPACITY {
                st.buf.pop_front();
                st.dropped += 1;
            }
            st.buf.push_back(line.to_string());
        }
        self.notify.notify_one();
    }

    /// Next notification, or `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            {
                let mut st = self.inner.lock();
                if let Some(line) = st.buf.pop_front() {
                    return Some(line);
                }
                if st.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    #[cfg(test)]
    fn dropped(&self) -> u64 {
        self.inner.lock().dropped
    }
}

struct QueueEntry {
    session_id: String,
    queue: Arc<NotificationQueue>,
}

pub struct StdioBridge {
    dest: Arc<Destination>,
    /// Resolved subprocess environment (allowlist + destination env + secrets).
    env: HashMap<String, String>,
    settings: BridgeSettings,
    audit: Arc<dyn AuditSink>,
    shutdown: CancellationToken,

    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    pending: Mutex<HashMap<u64, PendingCall>>,
    sessions: Mutex<HashSet<String>>,
    queues: Mutex<HashMap<u64, QueueEntry>>,
    next_internal_id: AtomicU64,
    next_queue_id: AtomicU64,
    unavailable: AtomicBool,
    /// Cancelled by the supervisor once the child is fully torn down.
    terminated: CancellationToken,
}

impl StdioBridge {
    /// Spawn the child (first attempt inline so the pipes are ready for the
    /// first request) and start the supervisor.
    pub async fn launch(
        dest: Arc<Destination>,
        env: HashMap<String, String>,
        settings: BridgeSettings,
        audit: Arc<dyn AuditSink>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let bridge = Arc::new(Self {
            dest,
            env,
            settings,
            audit,
            shutdown,
            stdin: tokio::sync::Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashSet::new()),
            queues: Mutex::new(HashMap::new()),
            next_internal_id: AtomicU64::new(0),
            next_queue_id: AtomicU64::new(0),
            unavailable: AtomicBool::new(false),
            terminated: CancellationToken::new(),
        });

        let first = match bridge.spawn_and_attach().await {
            Ok(attached) => Some(attached),
            Err(e) => {
                tracing::warn!(
                    destination = %bridge.dest.name,
                    error = %e,
                    "initial subprocess spawn failed"
                );
                None
            }
        };
        tokio::spawn(supervise(bridge.clone(), first));
        bridge
    }

    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        self.unavailable.load(Ordering::Acquire)
    }

    /// Resolves once the supervisor has fully torn the child down.
    pub async fn terminated(&self) {
        self.terminated.cancelled().await;
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    #[cfg(test)]
    fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Mint and register a session, enforcing the per-destination cap.
    pub fn create_session(&self) -> Result<String, ProxyError> {
        let mut sessions = self.sessions.lock();
        if sessions.len() >= self.settings.max_sessions {
            return Err(ProxyError::Capacity(format!(
                "Too many active sessions for '{}' (max {})",
                self.dest.name, self.settings.max_sessions
            )));
        }
        let id = uuid::Uuid::new_v4().to_string();
        sessions.insert(id.clone());
        Ok(id)
    }

    #[must_use]
    pub fn has_session(&self, id: &str) -> bool {
        self.sessions.lock().contains(id)
    }

    /// Remove a session and close its notification queues. Returns false when
    /// the session was not registered. The subprocess keeps running; it is
    /// shared by the destination's other sessions.
    pub fn remove_session(&self, id: &str) -> bool {
        if !self.sessions.lock().remove(id) {
            return false;
        }
        let mut queues = self.queues.lock();
        queues.retain(|_, entry| {
            if entry.session_id == id {
                entry.queue.close();
                false
            } else {
                true
            }
        });
        true
    }

    /// Register a fresh queue for one GET stream.
    pub fn register_queue(&self, session_id: &str) -> (u64, Arc<NotificationQueue>) {
        let id = self.next_queue_id.fetch_add(1, Ordering::Relaxed) + 1;
        let queue = NotificationQueue::new();
        self.queues.lock().insert(
            id,
            QueueEntry {
                session_id: session_id.to_string(),
                queue: queue.clone(),
            },
        );
        (id, queue)
    }

    pub fn unregister_queue(&self, id: u64) {
        if let Some(entry) = self.queues.lock().remove(&id) {
            entry.queue.close();
        }
    }

    fn broadcast(&self, line: &str) {
        for entry in self.queues.lock().values() {
            entry.queue.push(line);
        }
    }

    /// Write one newline-terminated frame to the child's stdin.
    pub async fn write_line(&self, line: &str) -> Result<(), ProxyError> {
        let mut guard = self.stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            return Err(ProxyError::Bridge(format!(
                "subprocess for '{}' is not running",
                self.dest.name
            )));
        };
        let mut frame = Vec::with_capacity(line.len() + 1);
        frame.extend_from_slice(line.as_bytes());
        frame.push(b'\n');
        stdin
            .write_all(&frame)
            .await
            .map_err(|e| ProxyError::Bridge(format!("stdin write failed: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| ProxyError::Bridge(format!("stdin flush failed: {e}")))
    }

    /// Send a JSON-RPC request: rewrite the id to a bridge-wide monotone
    /// integer, register the pending call, and await the matching stdout
    /// line. The response already carries the client's original id.
    ///
    /// Dropping this future (caller cancellation) deregisters the pending
    /// call and nothing else.
    pub async fn call(
        &self,
        mut message: serde_json::Map<String, Value>,
        client_id: Value,
    ) -> Result<Value, ProxyError> {
        let internal = self.next_internal_id.fetch_add(1, Ordering::Relaxed) + 1;
        message.insert("id".to_string(), Value::from(internal));
        let line = Value::Object(message).to_string();

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .insert(internal, PendingCall { client_id, tx });
        let mut guard = PendingGuard {
            bridge: self,
            internal_id: internal,
            armed: true,
        };

        self.write_line(&line).await?;

        match tokio::time::timeout(self.settings.rpc_timeout, rx).await {
            Err(_) => Err(ProxyError::Timeout),
            Ok(Err(_)) => {
                guard.armed = false;
                Err(ProxyError::Bridge(format!(
                    "subprocess for '{}' exited before responding",
                    self.dest.name
                )))
            }
            Ok(Ok(value)) => {
                guard.armed = false;
                Ok(value)
            }
        }
    }

    async fn spawn_and_attach(&self) -> std::io::Result<(Child, ChildStdout, ChildStderr)> {
        let mut cmd = Command::new(&self.dest.argv[0]);
        cmd.args(&self.dest.argv[1..])
            .env_clear()
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        let stdin = child.stdin.take().ok_or_else(|| {
            std::io::Error::other("child stdin not captured")
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            std::io::Error::other("child stdout not captured")
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            std::io::Error::other("child stderr not captured")
        })?;
        *self.stdin.lock().await = Some(stdin);
        Ok((child, stdout, stderr))
    }

    fn fail_all_pending(&self) {
        // Dropping the senders wakes every waiter with a closed-channel error.
        self.pending.lock().clear();
    }

    fn close_all_queues(&self) {
        let mut queues = self.queues.lock();
        for entry in queues.values() {
            entry.queue.close();
        }
        queues.clear();
    }

    fn mark_unavailable(&self) {
        self.unavailable.store(true, Ordering::Release);
        self.sessions.lock().clear();
    }
}

struct PendingGuard<'a> {
    bridge: &'a StdioBridge,
    internal_id: u64,
    armed: bool,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.bridge.pending.lock().remove(&self.internal_id);
        }
    }
}

async fn supervise(bridge: Arc<StdioBridge>, first: Option<(Child, ChildStdout, ChildStderr)>) {
    run_supervisor(&bridge, first).await;
    bridge.terminated.cancel();
}

async fn run_supervisor(
    bridge: &Arc<StdioBridge>,
    first: Option<(Child, ChildStdout, ChildStderr)>,
) {
    let mut attached = first;
    let mut restarts: usize = 0;
    let delays = bridge.settings.restart_delays.clone();

    loop {
        let (mut child, stdout, stderr) = match attached.take() {
            Some(t) => t,
            None => match bridge.spawn_and_attach().await {
                Ok(t) => t,
                Err(e) => {
                    tracing::warn!(
                        destination = %bridge.dest.name,
                        error = %e,
                        "subprocess spawn failed"
                    );
                    if restarts >= delays.len() {
                        bridge.mark_unavailable();
                        bridge.fail_all_pending();
                        bridge.close_all_queues();
                        return;
                    }
                    tokio::select! {
                        () = bridge.shutdown.cancelled() => return,
                        () = tokio::time::sleep(delays[restarts]) => {}
                    }
                    restarts += 1;
                    continue;
                }
            },
        };

        tracing::info!(
            destination = %bridge.dest.name,
            pid = child.id(),
            executable = %bridge.dest.argv[0],
            "subprocess started"
        );

        let dispatcher = tokio::spawn(dispatch_stdout(bridge.clone(), stdout));
        let stderr_tail = tokio::spawn(tail_stderr(bridge.clone(), stderr));

        tokio::select! {
            () = bridge.shutdown.cancelled() => {
                bridge.stdin.lock().await.take();
                graceful_stop(&mut child, &bridge.dest.name).await;
                dispatcher.abort();
                stderr_tail.abort();
                bridge.fail_all_pending();
                bridge.close_all_queues();
                return;
            }
            status = child.wait() => {
                let code = status.ok().and_then(|s| s.code());
                tracing::warn!(
                    destination = %bridge.dest.name,
                    exit_code = code,
                    restarts,
                    "subprocess exited"
                );
            }
        }

        // Unexpected exit: drop stdin, let the readers drain to EOF, then
        // fail everything in flight before considering a restart.
        bridge.stdin.lock().await.take();
        let _ = dispatcher.await;
        let _ = stderr_tail.await;
        bridge.fail_all_pending();
        bridge.close_all_queues();

        if restarts >= delays.len() {
            tracing::error!(
                destination = %bridge.dest.name,
                "subprocess restart budget exhausted; bridge is unavailable"
            );
            bridge.mark_unavailable();
            return;
        }
        tokio::select! {
            () = bridge.shutdown.cancelled() => return,
            () = tokio::time::sleep(delays[restarts]) => {}
        }
        restarts += 1;
    }
}

/// Read newline-delimited JSON from the child. Lines with an id matching a
/// pending call resolve that call (with the client's original id restored);
/// lines without an id fan out to every notification queue; everything else
/// is logged and discarded.
async fn dispatch_stdout(bridge: Arc<StdioBridge>, stdout: ChildStdout) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(destination = %bridge.dest.name, error = %e, "stdout read failed");
                break;
            }
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let Ok(mut value) = serde_json::from_str::<Value>(trimmed) else {
            tracing::warn!(destination = %bridge.dest.name, "unparseable stdout line discarded");
            continue;
        };
        if !value.is_object() {
            tracing::warn!(destination = %bridge.dest.name, "non-object stdout line discarded");
            continue;
        }

        let id = value.get("id").cloned().unwrap_or(Value::Null);
        if id.is_null() {
            bridge.broadcast(trimmed);
            continue;
        }

        let resolved = id.as_u64().and_then(|internal| {
            bridge.pending.lock().remove(&internal)
        });
        match resolved {
            Some(call) => {
                value["id"] = call.client_id;
                let _ = call.tx.send(value);
            }
            None => {
                tracing::warn!(
                    destination = %bridge.dest.name,
                    "stdout line with unknown id discarded"
                );
            }
        }
    }
}

/// stderr goes to the operational log and the audit file, never to clients.
async fn tail_stderr(bridge: Arc<StdioBridge>, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::warn!(destination = %bridge.dest.name, stderr_line = %line, "subprocess stderr");
        bridge.audit.log_stderr(&bridge.dest.name, &line);
    }
}

async fn graceful_stop(child: &mut Child, destination: &str) {
    #[cfg(unix)]
    if let Some(pid) = child.id().and_then(|p| i32::try_from(p).ok()) {
        tracing::info!(destination, pid, "sending SIGTERM to subprocess");
        if let Err(e) = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), nix::sys::signal::Signal::SIGTERM)
        {
            tracing::warn!(destination, pid, error = %e, "SIGTERM failed");
        }
    }
    if tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await.is_err() {
        tracing::warn!(destination, "subprocess ignored SIGTERM; killing");
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
}

// ---------------------------------------------------------------------------
// HTTP handlers for stdio destinations (dispatched from the /mcp routes)
// ---------------------------------------------------------------------------

fn bridge_unavailable_response() -> Response {
    error_body(
        StatusCode::SERVICE_UNAVAILABLE,
        "Destination bridge is unavailable",
    )
}

fn json_response(status: StatusCode, session_header: Option<&str>, body: String) -> Response {
    let mut resp = (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response();
    if let Some(id) = session_header {
        if let Ok(value) = axum::http::HeaderValue::from_str(id) {
            resp.headers_mut().insert(MCP_SESSION_ID, value);
        }
    }
    resp
}

enum SessionRoute {
    /// Freshly minted; the response must carry the `Mcp-Session-Id` header.
    New(String),
    Existing,
}

fn route_session(
    bridge: &StdioBridge,
    headers: &HeaderMap,
) -> Result<SessionRoute, Response> {
    match headers.get(MCP_SESSION_ID) {
        None => match bridge.create_session() {
            Ok(id) => Ok(SessionRoute::New(id)),
            Err(e) => Err(error_body(StatusCode::SERVICE_UNAVAILABLE, &e.to_string())),
        },
        Some(value) => {
            let Some(id) = value.to_str().ok().filter(|s| valid_uuid4(s)) else {
                return Err(error_body(
                    StatusCode::BAD_REQUEST,
                    "Invalid Mcp-Session-Id format",
                ));
            };
            if !bridge.has_session(id) {
                return Err(error_body(StatusCode::NOT_FOUND, "Session not found"));
            }
            Ok(SessionRoute::Existing)
        }
    }
}

/// `POST /{dest}/mcp` for a stdio destination.
pub async fn handle_post(
    bridge: &Arc<StdioBridge>,
    scanner: &palisade_scan::Scanner,
    headers: &HeaderMap,
    source_ip: String,
    body: Bytes,
) -> Response {
    let log = RequestLog::new(
        bridge.audit.clone(),
        headers,
        source_ip,
        &bridge.dest.name,
    );
    let envelope = jsonrpc::peek(&body);

    if bridge.is_unavailable() {
        log.emit(503, &envelope, Some("bridge unavailable".to_string()), Some(body.clone()), None, None);
        return bridge_unavailable_response();
    }

    let route = match route_session(bridge.as_ref(), headers) {
        Ok(route) => route,
        Err(resp) => {
            log.emit(
                resp.status().as_u16(),
                &envelope,
                Some("session routing rejected".to_string()),
                Some(body.clone()),
                None,
                None,
            );
            return resp;
        }
    };
    let new_session = match &route {
        SessionRoute::New(id) => Some(id.clone()),
        SessionRoute::Existing => None,
    };

    if jsonrpc::is_batch(&body) {
        log.emit(400, &envelope, Some("batch request".to_string()), Some(body.clone()), None, None);
        return error_body(StatusCode::BAD_REQUEST, "Batch requests are not supported");
    }
    if !envelope.parsed {
        log.emit(400, &envelope, Some("unparseable body".to_string()), Some(body.clone()), None, None);
        return error_body(
            StatusCode::BAD_REQUEST,
            "Request body must be a JSON-RPC object",
        );
    }

    // Scanner hook, request direction.
    let mut effective = body.clone();
    let mut detection_audit: Option<DetectionAudit> = None;
    if let Ok(text) = std::str::from_utf8(&body) {
        let detection = scanner
            .scan(text, &bridge.dest.scan, palisade_scan::Direction::Request)
            .await;
        match detection.action {
            palisade_scan::Action::Pass => {}
            palisade_scan::Action::Block => {
                let error = jsonrpc::error_envelope(
                    &envelope.id,
                    jsonrpc::INVALID_REQUEST,
                    "Request blocked by content policy",
                );
                let body_out = error.to_string();
                log.emit(
                    200,
                    &envelope,
                    None,
                    Some(body.clone()),
                    Some(Bytes::from(body_out.clone())),
                    Some(DetectionAudit {
                        action: detection.action.as_str(),
                        engine: detection.engine,
                        detail: detection.detail,
                    }),
                );
                return json_response(StatusCode::OK, new_session.as_deref(), body_out);
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

    let Ok(Value::Object(message)) = serde_json::from_slice::<Value>(&effective) else {
        log.emit(400, &envelope, Some("body unusable after redaction".to_string()), Some(effective.clone()), None, detection_audit);
        return error_body(
            StatusCode::BAD_REQUEST,
            "Request body must be a JSON-RPC object",
        );
    };

    // Notification: fire-and-forget.
    if !envelope.has_id {
        let line = Value::Object(message).to_string();
        return match bridge.write_line(&line).await {
            Ok(()) => {
                log.emit(202, &envelope, None, Some(effective.clone()), None, detection_audit);
                json_response(StatusCode::ACCEPTED, new_session.as_deref(), String::new())
            }
            Err(e) => {
                log.emit(503, &envelope, Some(e.to_string()), Some(effective.clone()), None, detection_audit);
                bridge_unavailable_response()
            }
        };
    }

    match bridge.call(message, envelope.id.clone()).await {
        Ok(response) => {
            let mut body_out = response.to_string();
            // Scanner hook, response direction.
            let detection = scanner
                .scan(&body_out, &bridge.dest.scan, palisade_scan::Direction::Response)
                .await;
            match detection.action {
                palisade_scan::Action::Pass => {}
                palisade_scan::Action::Block => {
                    let error = jsonrpc::error_envelope(
                        &envelope.id,
                        jsonrpc::INTERNAL_ERROR,
                        "Response blocked by content policy",
                    );
                    body_out = error.to_string();
                    detection_audit = Some(DetectionAudit {
                        action: detection.action.as_str(),
                        engine: detection.engine,
                        detail: detection.detail,
                    });
                }
                action => {
                    detection_audit = Some(DetectionAudit {
                        action: action.as_str(),
                        engine: detection.engine,
                        detail: detection.detail.clone(),
                    });
                    if action == palisade_scan::Action::Redact {
                        body_out = detection.body;
                    }
                }
            }
            log.emit(
                200,
                &envelope,
                None,
                Some(effective),
                Some(Bytes::from(body_out.clone())),
                detection_audit,
            );
            json_response(StatusCode::OK, new_session.as_deref(), body_out)
        }
        Err(ProxyError::Timeout) => {
            log.emit(504, &envelope, Some("rpc response timeout".to_string()), Some(effective), None, detection_audit);
            error_body(StatusCode::GATEWAY_TIMEOUT, "Upstream did not respond in time")
        }
        Err(e) => {
            log.emit(503, &envelope, Some(e.to_string()), Some(effective), None, detection_audit);
            bridge_unavailable_response()
        }
    }
}

/// `GET /{dest}/mcp` for a stdio destination: a listen-only SSE stream fed by
/// the bridge's notification fan-out.
pub async fn handle_get(
    bridge: &Arc<StdioBridge>,
    headers: &HeaderMap,
    source_ip: String,
) -> Response {
    let log = RequestLog::new(
        bridge.audit.clone(),
        headers,
        source_ip,
        &bridge.dest.name,
    );
    let envelope = Envelope::default();

    if bridge.is_unavailable() {
        log.emit(503, &envelope, Some("bridge unavailable".to_string()), None, None, None);
        return bridge_unavailable_response();
    }

    let Some(session_id) = headers
        .get(MCP_SESSION_ID)
        .and_then(|v| v.to_str().ok())
        .filter(|s| valid_uuid4(s))
    else {
        log.emit(400, &envelope, Some("missing or invalid session header".to_string()), None, None, None);
        return error_body(
            StatusCode::BAD_REQUEST,
            "A valid Mcp-Session-Id header is required",
        );
    };
    if !bridge.has_session(session_id) {
        log.emit(404, &envelope, Some("unknown session".to_string()), None, None, None);
        return error_body(StatusCode::NOT_FOUND, "Session not found");
    }

    let (queue_id, queue) = bridge.register_queue(session_id);
    let bridge_for_stream = bridge.clone();
    let (mut tx, rx) =
        futures::channel::mpsc::channel::<Result<Bytes, std::convert::Infallible>>(32);

    tokio::spawn(async move {
        while let Some(line) = queue.pop().await {
            let frame = format!("data: {line}\n\n");
            if tx.send(Ok(Bytes::from(frame.into_bytes()))).await.is_err() {
                break;
            }
        }
        bridge_for_stream.unregister_queue(queue_id);
        log.emit(200, &Envelope::default(), None, None, None, None);
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(axum::body::Body::from_stream(rx))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// `DELETE /{dest}/mcp` for a stdio destination: session teardown only.
pub async fn handle_delete(
    bridge: &Arc<StdioBridge>,
    headers: &HeaderMap,
    source_ip: String,
) -> Response {
    let log = RequestLog::new(
        bridge.audit.clone(),
        headers,
        source_ip,
        &bridge.dest.name,
    );
    let envelope = Envelope::default();

    if bridge.is_unavailable() {
        log.emit(503, &envelope, Some("bridge unavailable".to_string()), None, None, None);
        return bridge_unavailable_response();
    }

    let Some(session_id) = headers
        .get(MCP_SESSION_ID)
        .and_then(|v| v.to_str().ok())
        .filter(|s| valid_uuid4(s))
    else {
        log.emit(400, &envelope, Some("missing or invalid session header".to_string()), None, None, None);
        return error_body(
            StatusCode::BAD_REQUEST,
            "A valid Mcp-Session-Id header is required",
        );
    };

    if !bridge.remove_session(session_id) {
        log.emit(404, &envelope, Some("unknown session".to_string()), None, None, None);
        return error_body(StatusCode::NOT_FOUND, "Session not found");
    }

    log.emit(204, &envelope, None, None, None, None);
    StatusCode::NO_CONTENT.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::NoopAuditSink;
    use crate::config::DestinationKind;
    use palisade_scan::ScanPolicy;
    use serde_json::json;
    use std::time::Instant;

    fn dest(argv: &[&str]) -> Arc<Destination> {
        Arc::new(Destination {
            name: "ctx".to_string(),
            kind: DestinationKind::Stdio,
            url: None,
            argv: argv.iter().map(ToString::to_string).collect(),
            env: HashMap::new(),
            scan: ScanPolicy::default(),
        })
    }

    fn settings() -> BridgeSettings {
        BridgeSettings {
            max_sessions: 2,
            rpc_timeout: Duration::from_secs(5),
            restart_delays: vec![Duration::from_millis(10); 3],
        }
    }

    async fn launch(argv: &[&str], settings: BridgeSettings) -> Arc<StdioBridge> {
        StdioBridge::launch(
            dest(argv),
            HashMap::from([("PATH".to_string(), std::env::var("PATH").unwrap_or_default())]),
            settings,
            Arc::new(NoopAuditSink),
            CancellationToken::new(),
        )
        .await
    }

    fn request(id: Value) -> serde_json::Map<String, Value> {
        let Value::Object(map) = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "initialize",
        }) else {
            unreachable!()
        };
        map
    }

    #[test]
    fn uuid4_validation_is_strict() {
        let minted = uuid::Uuid::new_v4().to_string();
        assert!(valid_uuid4(&minted));
        assert!(valid_uuid4("00000000-0000-4000-8000-000000000001"));
        assert!(!valid_uuid4("not-a-uuid"));
        // v1-style version nibble
        assert!(!valid_uuid4("00000000-0000-1000-8000-000000000001"));
        // uppercase rejected
        assert!(!valid_uuid4(&minted.to_uppercase()));
        // simple form rejected
        assert!(!valid_uuid4(&minted.replace('-', "")));
    }

    #[test]
    fn queue_drops_oldest_on_overflow() {
        let queue = NotificationQueue::new();
        for i in 0..(QUEUE_CAPACITY + 5) {
            queue.push(&format!("n{i}"));
        }
        assert_eq!(queue.dropped(), 5);
        // The consumer sees the newest CAPACITY entries, in order.
        let first = queue.inner.lock().buf.front().cloned().unwrap();
        assert_eq!(first, "n5");
    }

    #[tokio::test]
    async fn queue_pop_returns_none_after_close() {
        let queue = NotificationQueue::new();
        queue.push("last");
        queue.close();
        assert_eq!(queue.pop().await, Some("last".to_string()));
        assert_eq!(queue.pop().await, None);
    }

    #[tokio::test]
    async fn echo_subprocess_roundtrip_restores_client_id() {
        let bridge = launch(&["cat"], settings()).await;

        let value = bridge
            .call(request(json!("init")), json!("init"))
            .await
            .unwrap();
        assert_eq!(value["id"], "init");
        assert_eq!(value["method"], "initialize");
        assert_eq!(bridge.pending_len(), 0);

        // Internal ids are monotone; a duplicate client id is safe.
        let again = bridge.call(request(json!("init")), json!("init")).await.unwrap();
        assert_eq!(again["id"], "init");
        bridge.shutdown.cancel();
    }

    #[tokio::test]
    async fn internal_ids_start_at_one_and_increase() {
        let bridge = launch(&["cat"], settings()).await;
        let v = bridge.call(request(json!(42)), json!(42)).await.unwrap();
        assert_eq!(v["id"], 42);
        assert_eq!(bridge.next_internal_id.load(Ordering::Relaxed), 1);
        bridge.shutdown.cancel();
    }

    #[tokio::test]
    async fn session_cap_is_enforced() {
        let bridge = launch(&["cat"], settings()).await;
        bridge.create_session().unwrap();
        bridge.create_session().unwrap();
        let err = bridge.create_session().unwrap_err();
        assert!(matches!(err, ProxyError::Capacity(_)));
        bridge.shutdown.cancel();
    }

    #[tokio::test]
    async fn delete_removes_session_and_closes_its_queues() {
        let bridge = launch(&["cat"], settings()).await;
        let session = bridge.create_session().unwrap();
        let (_qid, queue) = bridge.register_queue(&session);

        assert!(bridge.remove_session(&session));
        assert!(!bridge.has_session(&session));
        assert_eq!(queue.pop().await, None);
        // Second removal reports unknown.
        assert!(!bridge.remove_session(&session));
        bridge.shutdown.cancel();
    }

    #[tokio::test]
    async fn notifications_fan_out_to_every_queue() {
        // The subprocess prints one notification and exits; the dispatcher
        // broadcasts it before the queues close.
        let payload = r#"{"jsonrpc":"2.0","method":"progress","params":{"p":1}}"#;
        let bridge = launch(&["echo", payload], settings()).await;
        let session = bridge.create_session().unwrap();
        let (_qa, queue_a) = bridge.register_queue(&session);
        let (_qb, queue_b) = bridge.register_queue(&session);

        let got_a = tokio::time::timeout(Duration::from_secs(5), queue_a.pop())
            .await
            .unwrap();
        let got_b = tokio::time::timeout(Duration::from_secs(5), queue_b.pop())
            .await
            .unwrap();
        assert_eq!(got_a.as_deref(), Some(payload));
        assert_eq!(got_b.as_deref(), Some(payload));
        bridge.shutdown.cancel();
    }

    #[tokio::test]
    async fn rpc_timeout_deregisters_the_pending_call() {
        let mut s = settings();
        s.rpc_timeout = Duration::from_millis(100);
        // sleep never writes to stdout.
        let bridge = launch(&["sleep", "60"], s).await;

        let err = bridge.call(request(json!(1)), json!(1)).await.unwrap_err();
        assert!(matches!(err, ProxyError::Timeout));
        assert_eq!(bridge.pending_len(), 0);
        bridge.shutdown.cancel();
    }

    #[tokio::test]
    async fn restart_budget_exhaustion_marks_the_bridge_unavailable() {
        // `true` exits immediately: initial run plus three restarts.
        let bridge = launch(&["true"], settings()).await;

        let deadline = Instant::now() + Duration::from_secs(5);
        while !bridge.is_unavailable() {
            assert!(Instant::now() < deadline, "bridge never became unavailable");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(bridge.pending_len(), 0);
        assert_eq!(bridge.session_count(), 0);

        let err = bridge.call(request(json!(1)), json!(1)).await.unwrap_err();
        assert!(matches!(err, ProxyError::Bridge(_)));
    }

    #[tokio::test]
    async fn shutdown_terminates_the_subprocess() {
        let ct = CancellationToken::new();
        let bridge = StdioBridge::launch(
            dest(&["cat"]),
            HashMap::from([("PATH".to_string(), std::env::var("PATH").unwrap_or_default())]),
            settings(),
            Arc::new(NoopAuditSink),
            ct.clone(),
        )
        .await;
        let session = bridge.create_session().unwrap();
        let (_qid, queue) = bridge.register_queue(&session);

        ct.cancel();
        // Queues close as part of teardown.
        assert_eq!(
            tokio::time::timeout(Duration::from_secs(5), queue.pop())
                .await
                .unwrap(),
            None
        );
    }
}
