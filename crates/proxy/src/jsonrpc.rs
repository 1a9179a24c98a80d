//! Minimal JSON-RPC 2.0 envelope inspection.
//!
//! The proxy never interprets MCP semantics; it only needs `method` and `id`
//! for logging, notification detection, and internal id rewriting. Anything
//! unparseable is tolerated — the fields become null in the audit record.

use serde_json::Value;

/// JSON-RPC error code for an invalid/blocked request.
pub const INVALID_REQUEST: i64 = -32600;
/// JSON-RPC error code for a blocked/failed response.
pub const INTERNAL_ERROR: i64 = -32603;

/// What the proxy could read out of a request body.
#[derive(Debug, Clone, Default)]
pub struct Envelope {
    pub method: Option<String>,
    /// The client-supplied id, verbatim (number, string, or null).
    pub id: Value,
    /// True when the body parsed as a JSON object at all.
    pub parsed: bool,
    /// True when the object has an `id` key with a non-null value.
    pub has_id: bool,
}

/// Best-effort peek at a JSON-RPC body. Arrays and scalars yield an
/// unparsed envelope; callers decide whether that is an error.
#[must_use]
pub fn peek(body: &[u8]) -> Envelope {
    let Ok(value) = serde_json::from_slice::<Value>(body) else {
        return Envelope::default();
    };
    let Value::Object(obj) = value else {
        return Envelope::default();
    };
    let id = obj.get("id").cloned().unwrap_or(Value::Null);
    Envelope {
        method: obj.get("method").and_then(Value::as_str).map(str::to_string),
        has_id: !id.is_null(),
        id,
        parsed: true,
    }
}

#[must_use]
pub fn is_batch(body: &[u8]) -> bool {
    matches!(serde_json::from_slice::<Value>(body), Ok(Value::Array(_)))
}

/// A synthesized JSON-RPC error envelope carrying the client's original id.
#[must_use]
pub fn error_envelope(id: &Value, code: i64, message: &str) -> Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message }
    })
}
