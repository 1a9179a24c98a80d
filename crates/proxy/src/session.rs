//! Legacy SSE session map: proxy-minted session id → upstream message URL.
//!
//! Ids are minted by the proxy (never taken from the upstream) and handed to
//! the client inside the rewritten `endpoint` event. Entries live exactly as
//! long as their SSE stream; every termination path removes them.

use crate::config::Destination;
use crate::error::ProxyError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct LegacySession {
    pub destination: String,
    pub upstream_message_url: reqwest::Url,
}

pub struct SessionMap {
    capacity: usize,
    inner: Mutex<HashMap<String, LegacySession>>,
}

impl SessionMap {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Mint a fresh session id: 32 hex chars from the OS CSPRNG, well inside
    /// the `[A-Za-z0-9_-]{8,128}` grammar.
    #[must_use]
    pub fn mint_id() -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }

    pub fn insert(&self, id: String, session: LegacySession) -> Result<(), ProxyError> {
        let mut map = self.inner.lock();
        if map.len() >= self.capacity {
            return Err(ProxyError::Capacity("session map is full".to_string()));
        }
        map.insert(id, session);
        Ok(())
    }

    #[must_use]
    pub fn lookup(&self, id: &str) -> Option<LegacySession> {
        self.inner.lock().get(id).cloned()
    }

    pub fn remove(&self, id: &str) {
        self.inner.lock().remove(id);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().len()
    }
}

/// Guard that removes a session on drop, covering client disconnect, upstream
/// EOF, and handler errors with one path.
pub struct SessionGuard {
    map: Arc<SessionMap>,
    id: Option<String>,
}

impl SessionGuard {
    #[must_use]
    pub fn new(map: Arc<SessionMap>) -> Self {
        Self { map, id: None }
    }

    pub fn track(&mut self, id: String) {
        // A later endpoint event replaces the tracked session.
        if let Some(old) = self.id.replace(id) {
            self.map.remove(&old);
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            self.map.remove(&id);
        }
    }
}

/// Session-id grammar for the legacy transport.
#[must_use]
pub fn valid_session_id(id: &str) -> bool {
    (8..=128).contains(&id.len())
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn same_origin(a: &reqwest::Url, b: &reqwest::Url) -> bool {
    a.scheme() == b.scheme() && a.host_str() == b.host_str() && a.port_or_known_default() == b.port_or_known_default()
}

/// Resolve an `endpoint` event payload against the destination's upstream.
///
/// Relative payloads resolve against the upstream base. Absolute payloads
/// must be same-origin with the configured upstream; anything else aborts the
/// stream upstream of this call.
pub fn resolve_message_url(dest: &Destination, payload: &str) -> Result<reqwest::Url, ProxyError> {
    let base = dest
        .url
        .as_ref()
        .ok_or_else(|| ProxyError::Internal(format!("destination '{}' has no url", dest.name)))?;

    let payload = payload.trim();
    if payload.starts_with("http://") || payload.starts_with("https://") {
        let url = reqwest::Url::parse(payload).map_err(|e| {
            ProxyError::Upstream(format!("endpoint event carries an invalid URL: {e}"))
        })?;
        if !same_origin(base, &url) {
            return Err(ProxyError::Upstream(format!(
                "endpoint event URL origin {}://{} does not match upstream",
                url.scheme(),
                url.host_str().unwrap_or_default()
            )));
        }
        Ok(url)
    } else {
        base.join(payload).map_err(|e| {
            ProxyError::Upstream(format!("endpoint event carries an unresolvable path: {e}"))
        })
    }
}
