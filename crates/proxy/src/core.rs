//! Shared process state assembled once at startup and passed through
//! handlers. No process-wide singletons; everything hangs off this value.

use crate::audit::AuditSink;
use crate::bridge::StdioBridge;
use crate::config::{DestinationKind, Registry, Settings};
use crate::session::SessionMap;
use palisade_scan::Scanner;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

pub struct Core {
    pub registry: Registry,
    pub settings: Settings,
    pub http: reqwest::Client,
    pub audit: Arc<dyn AuditSink>,
    pub sessions: Arc<SessionMap>,
    /// One bridge per stdio destination, launched eagerly at startup.
    pub bridges: HashMap<String, Arc<StdioBridge>>,
    /// Per-destination concurrency budget for the Streamable HTTP forwarder.
    pub semaphores: HashMap<String, Arc<Semaphore>>,
    pub scanner: Arc<Scanner>,
    pub shutdown: CancellationToken,
}

impl Core {
    /// Build the semaphore table for every HTTP-forwarded destination.
    #[must_use]
    pub fn build_semaphores(
        registry: &Registry,
        max_conn_per_destination: usize,
    ) -> HashMap<String, Arc<Semaphore>> {
        registry
            .iter()
            .filter(|d| d.kind == DestinationKind::StreamableHttp)
            .map(|d| {
                (
                    d.name.clone(),
                    Arc::new(Semaphore::new(max_conn_per_destination)),
                )
            })
            .collect()
    }
}
