//! 路由定义
//!
//! - 健康检查：/health
//! - 最新值：/latest, /latest/:device_id/:module_id
//! - 实时推送：/ws

use crate::AppState;
use crate::handlers::{get_latest, get_latest_module, health, ws_upgrade};
use crate::middleware::request_context;
use axum::{Router, middleware, routing::get};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

/// 创建网关路由（含请求追踪中间件）。
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/latest", get(get_latest))
        .route("/latest/:device_id/:module_id", get(get_latest_module))
        .route("/ws", get(ws_upgrade))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(middleware::from_fn(request_context))
                .layer(TraceLayer::new_for_http()),
        )
}
