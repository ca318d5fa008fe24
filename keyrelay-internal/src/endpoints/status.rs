//! Liveness and version endpoints, outside the admission path.

use axum::Json;
use serde_json::{json, Value};

pub const KEYRELAY_VERSION: &str = env!("CARGO_PKG_VERSION");

/// The handler for the `/health` endpoint.
pub async fn health_handler() -> Json<Value> {
    Json(json!({"gateway": "ok"}))
}

/// The handler for the `/status` endpoint.
pub async fn status_handler() -> Json<Value> {
    Json(json!({
        "name": "keyrelay",
        "version": KEYRELAY_VERSION,
    }))
}
