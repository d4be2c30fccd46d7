//! 链路相关类型定义

use crate::error::LinkError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 块读取传输层。
///
/// 实现方只负责单次打开/读取/关闭；超时、重连与串行化由 [`crate::ConnectionManager`] 负责。
#[async_trait]
pub trait BlockTransport: Send {
    async fn open(&mut self) -> Result<(), LinkError>;

    async fn read_block(
        &mut self,
        block_id: u16,
        start: u32,
        length: usize,
    ) -> Result<Vec<u8>, LinkError>;

    async fn close(&mut self);

    /// 用于日志的端点描述。
    fn endpoint(&self) -> String;
}

/// 连接管理参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// 连接超时（毫秒）
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// 单次读取超时（毫秒）
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,
    /// 每次读失败后的最大重连次数
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,
    /// 初始退避（毫秒），每次翻倍
    #[serde(default = "default_backoff")]
    pub backoff_initial_ms: u64,
    /// 退避上限（毫秒）
    #[serde(default = "default_backoff_max")]
    pub backoff_max_ms: u64,
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_read_timeout() -> u64 {
    5000
}

fn default_reconnect_attempts() -> u32 {
    3
}

fn default_backoff() -> u64 {
    500
}

fn default_backoff_max() -> u64 {
    8000
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout(),
            read_timeout_ms: default_read_timeout(),
            reconnect_attempts: default_reconnect_attempts(),
            backoff_initial_ms: default_backoff(),
            backoff_max_ms: default_backoff_max(),
        }
    }
}

impl LinkConfig {
    pub(crate) fn sanitized(mut self) -> Self {
        if self.reconnect_attempts == 0 {
            self.reconnect_attempts = 1;
        }
        if self.backoff_max_ms < self.backoff_initial_ms {
            self.backoff_max_ms = self.backoff_initial_ms;
        }
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// 第 `attempt` 次重连前的退避（从 0 开始计数，首次不等待）。
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 1u64 << (attempt - 1).min(16);
        let delay = self
            .backoff_initial_ms
            .saturating_mul(factor)
            .min(self.backoff_max_ms);
        Duration::from_millis(delay)
    }
}

/// 链路状态快照（只读访问器使用）
#[derive(Debug, Clone, Default, Serialize)]
pub struct LinkStatus {
    pub endpoint: String,
    pub connected: bool,
    pub connect_count: u64,
    pub reconnect_count: u64,
    pub error_count: u64,
    pub consecutive_errors: u32,
    pub last_error: Option<String>,
    pub last_read_ms: Option<i64>,
}
