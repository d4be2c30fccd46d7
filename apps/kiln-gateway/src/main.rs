//! 窑炉遥测采集网关入口：采集 → {历史库, 实时推送}，附 WebSocket 与健康检查。

use std::future::IntoFuture;

use kiln_codec::validate_schema;
use kiln_config::{AppConfig, load_schema};
use kiln_gateway::acquisition::{Acquisition, ws_settings};
use kiln_gateway::create_router;
use kiln_telemetry::init_tracing;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 加载本地 .env（如存在），便于直接 cargo run 启动
    dotenvy::dotenv().ok();
    // 从环境变量加载运行配置
    let config = AppConfig::from_env()?;
    // 初始化结构化日志
    init_tracing();

    // 设备 schema：解析失败或校验失败直接退出
    let schema = validate_schema(load_schema(&config.schema_path)?)?;
    info!(
        schema_path = %config.schema_path,
        blocks = schema.blocks().len(),
        modules = schema.modules().count(),
        "schema_loaded"
    );

    // 采集链路：轮询、持久化、分发
    let cancel = CancellationToken::new();
    let acquisition = Acquisition::start(&config, schema, cancel.clone()).await?;

    // HTTP 在采集停完之后再停，停机期间 /health 仍可访问
    let http_cancel = CancellationToken::new();
    let state = acquisition.app_state(ws_settings(&config), http_cancel.clone());
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.http_addr).await?;
    info!(addr = %config.http_addr, "http_listening");
    let server = tokio::spawn(
        axum::serve(listener, app).with_graceful_shutdown(http_cancel.clone().cancelled_owned())
            .into_future(),
    );

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "ctrl_c_listen_failed");
    }
    info!("shutdown_requested");

    cancel.cancel();
    acquisition.shutdown().await;
    http_cancel.cancel();

    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!(error = %err, "http_server_failed"),
        Err(err) => error!(error = %err, "http_task_join_failed"),
    }
    info!("shutdown_complete");
    Ok(())
}
