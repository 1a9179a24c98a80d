//! Control-plane router, bound to loopback only. None of these endpoints are
//! audited.

use crate::core::Core;
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;

pub fn router(core: Arc<Core>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/admin/reload-patterns", post(reload_patterns))
        .with_state(core)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn reload_patterns(State(core): State<Arc<Core>>) -> Json<serde_json::Value> {
    let loaded = core.scanner.reload(&core.settings.patterns_dir);
    Json(json!({ "loaded": loaded }))
}
