//! 存储接口 Trait 定义
//!
//! - HistoricalStore：远端历史库（可失败、重试幂等）
//! - FallbackLog：本地追加式兜底日志
//!
//! 设计原则：
//! - 所有接口返回 StorageError
//! - 使用 async_trait 支持动态分发

use crate::error::StorageError;
use crate::models::{FallbackEntry, FallbackStats, MeasurementPoint};
use async_trait::async_trait;
use domain::PhysicalSample;

/// 历史库写入接口
#[async_trait]
pub trait HistoricalStore: Send + Sync {
    /// 批量写入，成功返回写入条数。整批要么成功要么失败。
    async fn write_batch(&self, points: &[MeasurementPoint]) -> Result<usize, StorageError>;

    /// 连通性检查，回放前调用。
    async fn health_check(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// 兜底日志接口
///
/// 追加顺序即回放顺序，因此单设备内 FIFO 得以保持。
#[async_trait]
pub trait FallbackLog: Send + Sync {
    /// 按给定顺序追加。
    async fn append(&self, samples: &[PhysicalSample]) -> Result<usize, StorageError>;

    /// 重试次数低于 `max_retries` 的最旧 `limit` 条（按 seq 升序）。
    async fn oldest(
        &self,
        limit: usize,
        max_retries: u32,
    ) -> Result<Vec<FallbackEntry>, StorageError>;

    /// 删除已确认写入历史库的条目。
    async fn remove(&self, seqs: &[i64]) -> Result<usize, StorageError>;

    /// 回放失败：重试次数加一，条目保留。
    async fn mark_retry(&self, seqs: &[i64]) -> Result<usize, StorageError>;

    async fn depth(&self) -> Result<usize, StorageError>;

    /// `exhausted` 按 `max_retries` 统计。
    async fn stats(&self, max_retries: u32) -> Result<FallbackStats, StorageError>;
}
