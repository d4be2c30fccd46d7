//! 存储数据模型

use domain::PhysicalSample;
use serde::Serialize;
use std::collections::BTreeMap;

/// 历史库写入单元：测量标签 + 物理量字段 + 时间戳。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeasurementPoint {
    pub device_id: String,
    pub device_type: String,
    pub module_kind: String,
    pub module_id: String,
    pub ts_ms: i64,
    pub fields: BTreeMap<String, f64>,
    pub valid: bool,
}

impl From<&PhysicalSample> for MeasurementPoint {
    fn from(sample: &PhysicalSample) -> Self {
        Self {
            device_id: sample.device_id.clone(),
            device_type: sample.device_type.clone(),
            module_kind: sample.kind.as_str().to_string(),
            module_id: sample.module_id.clone(),
            ts_ms: sample.ts_ms,
            fields: sample.fields.clone(),
            valid: sample.valid,
        }
    }
}

/// 兜底日志条目。`seq` 单调递增，回放按 `seq` 升序。
#[derive(Debug, Clone, PartialEq)]
pub struct FallbackEntry {
    pub seq: i64,
    pub sample: PhysicalSample,
    pub created_at_ms: i64,
    /// 回放写库失败的次数。
    pub retry_count: u32,
}

/// 兜底日志统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FallbackStats {
    /// 全部留存条目（含已跳过的）。
    pub pending: usize,
    /// 重试次数已达上限、回放时跳过但仍保留的条目。
    pub exhausted: usize,
    pub oldest_created_at_ms: Option<i64>,
}
