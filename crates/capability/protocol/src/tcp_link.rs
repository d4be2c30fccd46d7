//! TCP 块读取传输
//!
//! 会话式连接：先建链握手，再逐个发送读块请求，应答按 invoke_id 校验。

use crate::error::LinkError;
use crate::frame::{
    FN_OPEN, OPEN_RESPONSE_LEN, READ_RESPONSE_HEADER_LEN, ReadRequest, ResponseHeader,
    STATUS_OK, STATUS_OUT_OF_RANGE,
};
use crate::types::BlockTransport;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// TCP 链路配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpLinkConfig {
    /// 控制器主机地址
    pub host: String,
    /// 控制器端口（默认 102）
    #[serde(default = "default_port")]
    pub port: u16,
    /// 机架号
    #[serde(default)]
    pub rack: u8,
    /// 槽位号
    #[serde(default = "default_slot")]
    pub slot: u8,
}

fn default_port() -> u16 {
    102
}

fn default_slot() -> u8 {
    1
}

/// TCP 块读取传输
pub struct TcpBlockTransport {
    config: TcpLinkConfig,
    stream: Option<TcpStream>,
    invoke_id: u16,
}

impl TcpBlockTransport {
    pub fn new(config: TcpLinkConfig) -> Self {
        Self {
            config,
            stream: None,
            invoke_id: 0,
        }
    }

    fn next_invoke_id(&mut self) -> u16 {
        self.invoke_id = self.invoke_id.wrapping_add(1);
        self.invoke_id
    }
}

fn map_io(err: std::io::Error) -> LinkError {
    match err.kind() {
        ErrorKind::UnexpectedEof
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe => LinkError::ConnectionLost(err.to_string()),
        _ => LinkError::Io(err),
    }
}

#[async_trait]
impl BlockTransport for TcpBlockTransport {
    async fn open(&mut self) -> Result<(), LinkError> {
        self.stream = None;
        let mut stream = TcpStream::connect((self.config.host.as_str(), self.config.port))
            .await
            .map_err(map_io)?;
        stream.set_nodelay(true).map_err(map_io)?;

        stream
            .write_all(&[FN_OPEN, self.config.rack, self.config.slot])
            .await
            .map_err(map_io)?;
        let mut reply = [0u8; OPEN_RESPONSE_LEN];
        stream.read_exact(&mut reply).await.map_err(map_io)?;
        if reply[0] != FN_OPEN || reply[1] != STATUS_OK {
            return Err(LinkError::Protocol(format!(
                "session rejected: function {:#04x} status {:#04x}",
                reply[0], reply[1]
            )));
        }
        debug!(target: "kiln.link", endpoint = %self.endpoint(), "session_opened");
        self.stream = Some(stream);
        Ok(())
    }

    async fn read_block(
        &mut self,
        block_id: u16,
        start: u32,
        length: usize,
    ) -> Result<Vec<u8>, LinkError> {
        let Ok(wire_length) = u16::try_from(length) else {
            return Err(LinkError::AddressOutOfRange {
                block_id,
                start,
                length,
            });
        };
        let invoke_id = self.next_invoke_id();
        let stream = self.stream.as_mut().ok_or(LinkError::NotConnected)?;

        let request = ReadRequest {
            invoke_id,
            block_id,
            start,
            length: wire_length,
        };
        stream.write_all(&request.encode()).await.map_err(map_io)?;

        let mut header = [0u8; READ_RESPONSE_HEADER_LEN];
        stream.read_exact(&mut header).await.map_err(map_io)?;
        let header = ResponseHeader::decode(&header)
            .ok_or_else(|| LinkError::Protocol("unexpected response function".to_string()))?;

        let mut payload = vec![0u8; header.length as usize];
        stream.read_exact(&mut payload).await.map_err(map_io)?;

        if header.invoke_id != invoke_id {
            return Err(LinkError::Protocol(format!(
                "invoke id mismatch: sent {invoke_id} got {}",
                header.invoke_id
            )));
        }
        match header.status {
            STATUS_OK => {}
            STATUS_OUT_OF_RANGE => {
                return Err(LinkError::AddressOutOfRange {
                    block_id,
                    start,
                    length,
                });
            }
            other => {
                return Err(LinkError::Protocol(format!(
                    "block {block_id} read status {other:#04x}"
                )));
            }
        }
        if payload.len() != length {
            return Err(LinkError::Protocol(format!(
                "short payload for block {block_id}: expected {length} got {}",
                payload.len()
            )));
        }
        Ok(payload)
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
    }

    fn endpoint(&self) -> String {
        format!("{}:{}", self.config.host, self.config.port)
    }
}
