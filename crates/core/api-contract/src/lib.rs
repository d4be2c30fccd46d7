//! 实时推送协议契约（JSON 文本帧）。

use domain::PhysicalSample;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// 按 `device_id -> module_id -> 样本` 组织的推送数据。
pub type SampleTree = BTreeMap<String, BTreeMap<String, PhysicalSample>>;

/// 客户端 -> 服务端。
///
/// `channel` 保持为字符串，便于区分格式错误与无效频道。
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe { channel: String },
    Unsubscribe { channel: String },
    Heartbeat {
        #[serde(default)]
        timestamp: Option<serde_json::Value>,
    },
}

/// 数据来源。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    Plc,
    Simulated,
}

/// 设备状态汇总。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSummary {
    pub total: usize,
    pub normal: usize,
    pub error: usize,
}

/// 错误码。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidMessage,
    InvalidChannel,
    InternalError,
}

/// 服务端 -> 客户端。
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    RealtimeData {
        success: bool,
        timestamp: i64,
        source: DataSource,
        data: SampleTree,
    },
    DeviceStatus {
        success: bool,
        timestamp: i64,
        source: DataSource,
        data: SampleTree,
        summary: StatusSummary,
    },
    Heartbeat {
        timestamp: i64,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
}

impl ServerMessage {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
