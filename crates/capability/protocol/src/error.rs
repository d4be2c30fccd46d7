//! 链路错误类型定义

/// 现场链路错误
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// 连接断开
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// 超时
    #[error("timeout: {0}")]
    Timeout(String),

    /// 读地址越界（控制器拒绝，不重连）
    #[error("address out of range: block {block_id} start {start} length {length}")]
    AddressOutOfRange {
        block_id: u16,
        start: u32,
        length: usize,
    },

    /// 报文不符合协议
    #[error("protocol error: {0}")]
    Protocol(String),

    /// IO 错误
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// 尚未建立连接
    #[error("not connected")]
    NotConnected,

    /// 重连次数耗尽
    #[error("reconnect exhausted after {attempts} attempts: {last}")]
    ReconnectExhausted { attempts: u32, last: String },
}

impl LinkError {
    /// 该错误是否意味着物理链路需要重建。
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            LinkError::ConnectionLost(_)
                | LinkError::Timeout(_)
                | LinkError::Protocol(_)
                | LinkError::Io(_)
                | LinkError::NotConnected
        )
    }
}
