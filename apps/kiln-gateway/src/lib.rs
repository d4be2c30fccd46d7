//! 窑炉遥测采集网关：装配采集链路，并提供 WebSocket 实时推送与健康检查。

pub mod acquisition;
pub mod handlers;
pub mod middleware;
pub mod routes;

use kiln_hub::DistributionHub;
use kiln_pipeline::DurableSink;
use kiln_protocol::LinkStatus;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

pub use routes::create_router;

/// WebSocket 连接参数。
#[derive(Debug, Clone)]
pub struct WsSettings {
    /// 每连接出站队列容量
    pub outbound_capacity: usize,
    /// 单帧写超时
    pub write_timeout: Duration,
    /// 读空闲超时（与心跳超时一致）
    pub idle_timeout: Duration,
}

impl Default for WsSettings {
    fn default() -> Self {
        Self {
            outbound_capacity: 64,
            write_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(45),
        }
    }
}

/// 应用共享状态。
#[derive(Clone)]
pub struct AppState {
    pub hub: DistributionHub,
    pub sink: DurableSink,
    pub link_status: watch::Receiver<LinkStatus>,
    pub ws: WsSettings,
    /// HTTP 停机信号：在途 WebSocket 收到后主动关闭。
    pub shutdown: CancellationToken,
}
