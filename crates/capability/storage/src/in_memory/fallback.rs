//! 兜底日志内存实现（进程退出即丢失，仅用于测试）。

use crate::error::StorageError;
use crate::models::{FallbackEntry, FallbackStats};
use crate::traits::FallbackLog;
use domain::{PhysicalSample, now_epoch_ms};
use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

struct FallbackState {
    next_seq: i64,
    entries: VecDeque<FallbackEntry>,
}

pub struct InMemoryFallbackLog {
    state: Mutex<FallbackState>,
}

impl InMemoryFallbackLog {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FallbackState {
                next_seq: 1,
                entries: VecDeque::new(),
            }),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, FallbackState>, StorageError> {
        self.state
            .lock()
            .map_err(|_| StorageError::new("lock failed"))
    }
}

impl Default for InMemoryFallbackLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl FallbackLog for InMemoryFallbackLog {
    async fn append(&self, samples: &[PhysicalSample]) -> Result<usize, StorageError> {
        let mut state = self.lock()?;
        let created_at_ms = now_epoch_ms();
        for sample in samples {
            let seq = state.next_seq;
            state.next_seq += 1;
            state.entries.push_back(FallbackEntry {
                seq,
                sample: sample.clone(),
                created_at_ms,
                retry_count: 0,
            });
        }
        Ok(samples.len())
    }

    async fn oldest(
        &self,
        limit: usize,
        max_retries: u32,
    ) -> Result<Vec<FallbackEntry>, StorageError> {
        let state = self.lock()?;
        Ok(state
            .entries
            .iter()
            .filter(|entry| entry.retry_count < max_retries)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn remove(&self, seqs: &[i64]) -> Result<usize, StorageError> {
        let targets: HashSet<i64> = seqs.iter().copied().collect();
        let mut state = self.lock()?;
        let before = state.entries.len();
        state.entries.retain(|entry| !targets.contains(&entry.seq));
        Ok(before - state.entries.len())
    }

    async fn mark_retry(&self, seqs: &[i64]) -> Result<usize, StorageError> {
        let targets: HashSet<i64> = seqs.iter().copied().collect();
        let mut state = self.lock()?;
        let mut marked = 0;
        for entry in state.entries.iter_mut().filter(|entry| targets.contains(&entry.seq)) {
            entry.retry_count = entry.retry_count.saturating_add(1);
            marked += 1;
        }
        Ok(marked)
    }

    async fn depth(&self) -> Result<usize, StorageError> {
        Ok(self.lock()?.entries.len())
    }

    async fn stats(&self, max_retries: u32) -> Result<FallbackStats, StorageError> {
        let state = self.lock()?;
        Ok(FallbackStats {
            pending: state.entries.len(),
            exhausted: state
                .entries
                .iter()
                .filter(|entry| entry.retry_count >= max_retries)
                .count(),
            oldest_created_at_ms: state.entries.front().map(|entry| entry.created_at_ms),
        })
    }
}
