//! 历史库内存实现
//!
//! 仅用于本地测试和未配置历史库时的占位。

use crate::error::StorageError;
use crate::models::MeasurementPoint;
use crate::traits::HistoricalStore;
use std::sync::RwLock;

pub struct InMemoryHistoricalStore {
    points: RwLock<Vec<MeasurementPoint>>,
}

impl InMemoryHistoricalStore {
    pub fn new() -> Self {
        Self {
            points: RwLock::new(Vec::new()),
        }
    }

    /// 当前累计的写入条数（用于测试）
    pub fn len(&self) -> usize {
        self.points.read().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 已写入数据的副本（用于测试）
    pub fn points(&self) -> Vec<MeasurementPoint> {
        self.points.read().map(|p| p.clone()).unwrap_or_default()
    }
}

impl Default for InMemoryHistoricalStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl HistoricalStore for InMemoryHistoricalStore {
    async fn write_batch(&self, points: &[MeasurementPoint]) -> Result<usize, StorageError> {
        let mut store = self
            .points
            .write()
            .map_err(|_| StorageError::new("lock failed"))?;
        store.extend(points.iter().cloned());
        Ok(points.len())
    }
}
