//! Structured audit log: one JSON object per completed request, appended to a
//! newline-delimited file.
//!
//! The sink owns the body-capture policy. Handlers hand over raw bytes; the
//! sink decides whether a body is logged, truncated away, or nulled out. Disk
//! I/O runs on a dedicated OS thread fed by a bounded channel, so a slow or
//! failing log file can never stall request handling — records are dropped
//! (and counted) instead.

use bytes::Bytes;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;
use std::io::Write as _;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

const CHANNEL_CAPACITY: usize = 10_000;

/// Body-capture policy applied before a record is serialized.
#[derive(Debug, Clone, Copy)]
pub struct BodyPolicy {
    pub capture: bool,
    pub max_bytes: usize,
}

/// What a handler knows about a finished request.
#[derive(Debug, Default)]
pub struct RequestAudit {
    pub user: String,
    pub source_ip: String,
    pub destination: String,
    pub mcp_method: Option<String>,
    pub rpc_id: Value,
    pub status_code: u16,
    pub latency: Duration,
    pub error: Option<String>,
    pub request_body: Option<Bytes>,
    pub response_body: Option<Bytes>,
    pub stderr_line: Option<String>,
    pub detection: Option<DetectionAudit>,
}

#[derive(Debug, Clone)]
pub struct DetectionAudit {
    pub action: &'static str,
    pub engine: Option<&'static str>,
    pub detail: Option<String>,
}

/// The serialized line. Field names are the on-disk contract.
#[derive(Debug, Serialize)]
pub struct AuditRecord {
    timestamp: String,
    user: String,
    source_ip: String,
    destination: String,
    mcp_method: Option<String>,
    rpc_id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    latency_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_body: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_body: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    truncated: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    decode_error: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stderr_line: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detection_action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detection_engine: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detection_detail: Option<String>,
}

enum CapturedBody {
    Omitted,
    Truncated,
    DecodeError,
    Null,
    Text(String),
}

fn capture_body(policy: BodyPolicy, raw: &[u8], json_required: bool) -> CapturedBody {
    if raw.len() > policy.max_bytes {
        return CapturedBody::Truncated;
    }
    let Ok(text) = std::str::from_utf8(raw) else {
        return CapturedBody::DecodeError;
    };
    if json_required && serde_json::from_str::<Value>(text).is_err() {
        return CapturedBody::Null;
    }
    CapturedBody::Text(text.to_string())
}

fn build_record(policy: BodyPolicy, audit: RequestAudit) -> AuditRecord {
    let mut truncated = false;
    let mut decode_error = false;

    let mut fold = |raw: &Option<Bytes>, json_required: bool| -> Option<Value> {
        if !policy.capture {
            return None;
        }
        let raw = raw.as_ref()?;
        match capture_body(policy, raw, json_required) {
            CapturedBody::Omitted => None,
            CapturedBody::Truncated => {
                truncated = true;
                None
            }
            CapturedBody::DecodeError => {
                decode_error = true;
                Some(Value::Null)
            }
            CapturedBody::Null => Some(Value::Null),
            CapturedBody::Text(t) => Some(Value::String(t)),
        }
    };

    let request_body = fold(&audit.request_body, true);
    let response_body = fold(&audit.response_body, false);

    let latency_ms = (audit.latency.as_secs_f64() * 1000.0 * 100.0).round() / 100.0;

    AuditRecord {
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
        user: audit.user,
        source_ip: audit.source_ip,
        destination: audit.destination,
        mcp_method: audit.mcp_method,
        rpc_id: audit.rpc_id,
        status_code: Some(audit.status_code),
        latency_ms: Some(latency_ms),
        error: audit.error,
        request_body,
        response_body,
        truncated: truncated.then_some(true),
        decode_error: decode_error.then_some(true),
        stderr_line: audit.stderr_line,
        detection_action: audit.detection.as_ref().map(|d| d.action.to_string()),
        detection_engine: audit
            .detection
            .as_ref()
            .and_then(|d| d.engine.map(str::to_string)),
        detection_detail: audit.detection.and_then(|d| d.detail),
    }
}

/// Per-request audit context threaded through a handler. Built at entry,
/// emitted exactly once at each exit point.
pub struct RequestLog {
    audit: Arc<dyn AuditSink>,
    user: String,
    source_ip: String,
    destination: String,
    started: std::time::Instant,
}

impl RequestLog {
    #[must_use]
    pub fn new(
        audit: Arc<dyn AuditSink>,
        headers: &axum::http::HeaderMap,
        source_ip: String,
        destination: &str,
    ) -> Self {
        Self {
            audit,
            user: crate::headers::user_tag(headers),
            source_ip,
            destination: destination.to_string(),
            started: std::time::Instant::now(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn emit(
        &self,
        status: u16,
        envelope: &crate::jsonrpc::Envelope,
        error: Option<String>,
        request_body: Option<Bytes>,
        response_body: Option<Bytes>,
        detection: Option<DetectionAudit>,
    ) {
        self.audit.log_request(RequestAudit {
            user: self.user.clone(),
            source_ip: self.source_ip.clone(),
            destination: self.destination.clone(),
            mcp_method: envelope.method.clone(),
            rpc_id: envelope.id.clone(),
            status_code: status,
            latency: self.started.elapsed(),
            error,
            request_body,
            response_body,
            stderr_line: None,
            detection,
        });
    }
}

pub trait AuditSink: Send + Sync {
    /// Record one completed request. Must never block or fail the caller.
    fn log_request(&self, audit: RequestAudit);

    /// Record one stderr line from a stdio subprocess. Never forwarded to
    /// clients; request-only fields stay absent.
    fn log_stderr(&self, _destination: &str, _line: &str) {}
}

/// Sink that discards everything; used in tests.
#[derive(Default)]
pub struct NoopAuditSink;

impl AuditSink for NoopAuditSink {
    fn log_request(&self, _audit: RequestAudit) {}
}

pub struct FileAuditSink {
    policy: BodyPolicy,
    sender: Option<mpsc::Sender<AuditRecord>>,
    dropped: AtomicU64,
    writer: Option<std::thread::JoinHandle<()>>,
}

impl FileAuditSink {
    /// Open (creating parent directories) and start the writer thread.
    pub fn new(path: &Path, policy: BodyPolicy) -> std::io::Result<Arc<Self>> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;

        let (sender, receiver) = mpsc::channel::<AuditRecord>(CHANNEL_CAPACITY);
        let writer = std::thread::Builder::new()
            .name("audit-writer".to_string())
            .spawn(move || write_loop(file, receiver))?;

        Ok(Arc::new(Self {
            policy,
            sender: Some(sender),
            dropped: AtomicU64::new(0),
            writer: Some(writer),
        }))
    }

    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn enqueue(&self, record: AuditRecord) {
        let Some(sender) = &self.sender else { return };
        if sender.try_send(record).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

fn write_loop(mut file: std::fs::File, mut rx: mpsc::Receiver<AuditRecord>) {
    while let Some(record) = rx.blocking_recv() {
        let line = match serde_json::to_string(&record) {
            Ok(l) => l,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize audit record");
                continue;
            }
        };
        if let Err(e) = file
            .write_all(line.as_bytes())
            .and_then(|()| file.write_all(b"\n"))
        {
            tracing::warn!(error = %e, "failed to append to audit log");
        }
    }
    let _ = file.flush();
}

impl AuditSink for FileAuditSink {
    fn log_request(&self, audit: RequestAudit) {
        self.enqueue(build_record(self.policy, audit));
    }

    fn log_stderr(&self, destination: &str, line: &str) {
        self.enqueue(AuditRecord {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            user: "stdio".to_string(),
            source_ip: "localhost".to_string(),
            destination: destination.to_string(),
            mcp_method: None,
            rpc_id: Value::Null,
            status_code: None,
            latency_ms: None,
            error: None,
            request_body: None,
            response_body: None,
            truncated: None,
            decode_error: None,
            stderr_line: Some(line.to_string()),
            detection_action: None,
            detection_engine: None,
            detection_detail: None,
        });
    }
}

impl Drop for FileAuditSink {
    fn drop(&mut self) {
        // Closing the channel lets the writer drain and exit.
        drop(self.sender.take());
        if let Some(handle) = self.writer.take() {
            let _ = handle.join();
        }
    }
}
