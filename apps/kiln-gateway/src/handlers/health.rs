//! 健康检查与只读访问器
//!
//! - GET /health
//! - GET /latest
//! - GET /latest/:device_id/:module_id

use crate::AppState;
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use kiln_protocol::LinkStatus;
use kiln_storage::FallbackStats;
use kiln_telemetry::{MetricsSnapshot, metrics};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub link: LinkStatus,
    /// 兜底日志不可读时为 null
    pub fallback: Option<FallbackStats>,
    pub buffered: usize,
    pub connections: usize,
    pub modules: usize,
    pub metrics: MetricsSnapshot,
}

pub async fn health(State(state): State<AppState>) -> Response {
    let link = state.link_status.borrow().clone();
    let fallback = match state.sink.fallback_stats().await {
        Ok(stats) => Some(stats),
        Err(err) => {
            tracing::warn!(target: "kiln.sink", error = %err, "fallback_stats_failed");
            None
        }
    };
    let modules = state
        .hub
        .latest_all()
        .values()
        .map(|modules| modules.len())
        .sum();
    let body = HealthResponse {
        ok: true,
        link,
        fallback,
        buffered: state.sink.buffered().await,
        connections: state.hub.connection_count(),
        modules,
        metrics: metrics().snapshot(),
    };
    (StatusCode::OK, Json(body)).into_response()
}

pub async fn get_latest(State(state): State<AppState>) -> Response {
    (StatusCode::OK, Json(state.hub.latest_all())).into_response()
}

#[derive(Deserialize)]
pub struct ModulePath {
    pub(crate) device_id: String,
    pub(crate) module_id: String,
}

pub async fn get_latest_module(
    State(state): State<AppState>,
    Path(path): Path<ModulePath>,
) -> Response {
    match state.hub.latest(&path.device_id, &path.module_id) {
        Some(sample) => (StatusCode::OK, Json(sample)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "error": "not_found",
                "device_id": path.device_id,
                "module_id": path.module_id,
            })),
        )
            .into_response(),
    }
}
