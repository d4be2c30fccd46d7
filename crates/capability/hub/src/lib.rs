//! # 实时分发
//!
//! 维护在线订阅连接、频道订阅与心跳存活，并把轮询结果推送给订阅者：
//!
//! - 每条样本到达时立即推送，同时写入"最新值"快照
//! - 以固定间隔（默认 100ms）从快照重发，推送频率与采集频率解耦
//! - 定时巡检，心跳超时的连接直接移除
//!
//! 每个连接持有独立的有界出站队列；投递使用 `try_send`，
//! 队列满或已关闭的连接被移除，不影响其他连接。

mod hub;

pub use hub::{ConnectionId, DistributionHub, Frame, HubConfig, HubHandle};

/// 分发错误。
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("unknown connection: {0}")]
    UnknownConnection(ConnectionId),
}
