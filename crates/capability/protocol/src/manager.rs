//! 现场连接管理器
//!
//! 独占唯一的物理链路；`&mut self` 保证同一时刻只有一个读请求在途。
//! 读失败且判定为断链时，在返回调用方之前按指数退避自动重连并重试一次。

use crate::error::LinkError;
use crate::types::{BlockTransport, LinkConfig, LinkStatus};
use domain::now_epoch_ms;
use tracing::{debug, info, warn};

pub struct ConnectionManager {
    transport: Box<dyn BlockTransport>,
    config: LinkConfig,
    status: LinkStatus,
    /// 是否发起过建链；首次惰性建链不算重连。
    attempted: bool,
}

impl ConnectionManager {
    pub fn new(transport: Box<dyn BlockTransport>, config: LinkConfig) -> Self {
        let status = LinkStatus {
            endpoint: transport.endpoint(),
            ..LinkStatus::default()
        };
        Self {
            transport,
            config: config.sanitized(),
            status,
            attempted: false,
        }
    }

    /// 单次建链（带连接超时）。
    pub async fn connect(&mut self) -> Result<(), LinkError> {
        self.attempted = true;
        let timeout = self.config.connect_timeout();
        let result = match tokio::time::timeout(timeout, self.transport.open()).await {
            Ok(result) => result,
            Err(_) => Err(LinkError::Timeout(format!(
                "connect to {} after {}ms",
                self.status.endpoint, self.config.connect_timeout_ms
            ))),
        };
        match result {
            Ok(()) => {
                self.status.connected = true;
                self.status.connect_count += 1;
                info!(target: "kiln.link", endpoint = %self.status.endpoint, "link_connected");
                Ok(())
            }
            Err(err) => {
                self.status.connected = false;
                self.record_error(&err);
                warn!(
                    target: "kiln.link",
                    endpoint = %self.status.endpoint,
                    error = %err,
                    "link_connect_failed"
                );
                Err(err)
            }
        }
    }

    /// 读取一个数据块。
    ///
    /// 调用方无需处理重连；只有重连耗尽或非断链错误（如地址越界）才会返回。
    pub async fn read_block(
        &mut self,
        block_id: u16,
        start: u32,
        length: usize,
    ) -> Result<Vec<u8>, LinkError> {
        if !self.status.connected {
            self.reconnect().await?;
        }
        match self.read_once(block_id, start, length).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.is_connection_lost() => {
                warn!(
                    target: "kiln.link",
                    endpoint = %self.status.endpoint,
                    block_id,
                    error = %err,
                    "link_lost"
                );
                self.drop_link().await;
                self.reconnect().await?;
                let result = self.read_once(block_id, start, length).await;
                if let Err(err) = &result {
                    if err.is_connection_lost() {
                        self.drop_link().await;
                    }
                }
                result
            }
            Err(err) => Err(err),
        }
    }

    /// 释放物理链路。
    pub async fn disconnect(&mut self) {
        if self.status.connected {
            info!(target: "kiln.link", endpoint = %self.status.endpoint, "link_disconnected");
        }
        self.drop_link().await;
    }

    pub fn status(&self) -> &LinkStatus {
        &self.status
    }

    pub fn is_connected(&self) -> bool {
        self.status.connected
    }

    async fn read_once(
        &mut self,
        block_id: u16,
        start: u32,
        length: usize,
    ) -> Result<Vec<u8>, LinkError> {
        let timeout = self.config.read_timeout();
        let result = match tokio::time::timeout(
            timeout,
            self.transport.read_block(block_id, start, length),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(LinkError::Timeout(format!(
                "read block {block_id} after {}ms",
                self.config.read_timeout_ms
            ))),
        };
        match result {
            Ok(bytes) => {
                self.status.consecutive_errors = 0;
                self.status.last_read_ms = Some(now_epoch_ms());
                debug!(target: "kiln.link", block_id, bytes = bytes.len(), "block_read");
                Ok(bytes)
            }
            Err(err) => {
                self.record_error(&err);
                Err(err)
            }
        }
    }

    /// 有界指数退避重连。
    ///
    /// 之前发起过建链时，成功即计入 `reconnect_count`：断链后重连与初次建链失败后的补建都算。
    async fn reconnect(&mut self) -> Result<(), LinkError> {
        let counted = self.attempted;
        let attempts = self.config.reconnect_attempts;
        let mut last = String::new();
        for attempt in 0..attempts {
            let delay = self.config.backoff_for(attempt);
            if !delay.is_zero() {
                debug!(
                    target: "kiln.link",
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "link_backoff"
                );
                tokio::time::sleep(delay).await;
            }
            match self.connect().await {
                Ok(()) => {
                    if counted {
                        self.status.reconnect_count += 1;
                    }
                    return Ok(());
                }
                Err(err) => {
                    last = err.to_string();
                    self.transport.close().await;
                }
            }
        }
        Err(LinkError::ReconnectExhausted { attempts, last })
    }

    async fn drop_link(&mut self) {
        self.transport.close().await;
        self.status.connected = false;
    }

    fn record_error(&mut self, err: &LinkError) {
        self.status.error_count += 1;
        self.status.consecutive_errors = self.status.consecutive_errors.saturating_add(1);
        self.status.last_error = Some(err.to_string());
    }
}
