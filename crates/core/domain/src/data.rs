use crate::schema::ModuleKind;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

/// 模块键：`(device_id, module_id)`。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleKey {
    pub device_id: String,
    pub module_id: String,
}

impl ModuleKey {
    pub fn new(device_id: impl Into<String>, module_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            module_id: module_id.into(),
        }
    }
}

/// 解码后的原始字段（单模块、单轮询周期）。不落库。
#[derive(Debug, Clone, PartialEq)]
pub struct RawSample {
    pub device_id: String,
    pub module_id: String,
    pub kind: ModuleKind,
    pub ts_ms: i64,
    pub raw_fields: BTreeMap<String, f64>,
}

impl RawSample {
    pub fn field(&self, name: &str) -> Option<f64> {
        self.raw_fields.get(name).copied()
    }
}

/// 换算后的物理量样本。
///
/// 同时流向持久化写入与实时分发，两者都按值持有。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhysicalSample {
    pub device_id: String,
    pub module_id: String,
    #[serde(default)]
    pub device_type: String,
    pub kind: ModuleKind,
    pub ts_ms: i64,
    /// JSON 中非有限值写作 null，读回时还原为 NaN。
    #[serde(deserialize_with = "fields_with_null")]
    pub fields: BTreeMap<String, f64>,
    /// 出现越界值（NaN、低于绝对零度等）时为 false，样本仍向下游流动。
    pub valid: bool,
}

impl PhysicalSample {
    pub fn key(&self) -> ModuleKey {
        ModuleKey::new(self.device_id.clone(), self.module_id.clone())
    }

    pub fn field(&self, name: &str) -> Option<f64> {
        self.fields.get(name).copied()
    }

    /// 该样本所属的实时推送频道。
    pub fn channel(&self) -> Channel {
        match self.kind {
            ModuleKind::DigitalStatus => Channel::DeviceStatus,
            _ => Channel::Realtime,
        }
    }
}

fn fields_with_null<'de, D>(deserializer: D) -> Result<BTreeMap<String, f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = BTreeMap::<String, Option<f64>>::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .map(|(name, value)| (name, value.unwrap_or(f64::NAN)))
        .collect())
}

/// 实时推送频道。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Realtime,
    DeviceStatus,
}

impl Channel {
    pub const ALL: [Channel; 2] = [Channel::Realtime, Channel::DeviceStatus];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Realtime => "realtime",
            Channel::DeviceStatus => "device_status",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "realtime" => Some(Channel::Realtime),
            "device_status" => Some(Channel::DeviceStatus),
            _ => None,
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
