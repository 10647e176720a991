//! Health and system introspection handlers.

use axum::{extract::State, Json};
use serde::Serialize;
use serde_json::json;

use crate::network::IpamStats;

use super::AppState;

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Serialize)]
pub struct SystemInfo {
    pub version: String,
    pub live_machines: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<IpamStats>,
}

pub async fn system_info(State(state): State<AppState>) -> Json<SystemInfo> {
    Json(SystemInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        live_machines: state.service.registry().len(),
        network: state.service.network().map(|n| n.stats()),
    })
}
