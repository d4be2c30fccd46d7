//! 持久化写入：批量刷写历史库，失败时落本地兜底日志，后台回放。
//!
//! 已入队的样本任何时刻都位于以下三处之一：历史库、内存缓冲、兜底日志。
//! 回放时被历史库拒绝的条目累计重试次数，达到上限后跳过但不删除。

use async_trait::async_trait;
use domain::PhysicalSample;
use kiln_ingest::{IngestError, SampleSink};
use kiln_storage::{FallbackEntry, FallbackLog, FallbackStats, HistoricalStore, MeasurementPoint};
use kiln_telemetry::{
    record_backpressure, record_samples_replayed, record_samples_spilled,
    record_store_write_failure, record_store_write_success, record_write_latency_ms,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 持久化写入错误。
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("store error: {0}")]
    Store(String),
    #[error("store write timed out after {0:?}")]
    Timeout(Duration),
    #[error("fallback error: {0}")]
    Fallback(String),
}

/// 持久化写入参数。
#[derive(Debug, Clone)]
pub struct DurableSinkConfig {
    /// 缓冲达到多少条时立即刷写
    pub batch_size: usize,
    /// 定时刷写间隔
    pub flush_interval: Duration,
    /// 兜底日志回放间隔
    pub replay_interval: Duration,
    /// 每批回放条数
    pub replay_batch: usize,
    /// 入站队列容量（满时背压）
    pub queue_capacity: usize,
    /// 单次写库超时
    pub write_timeout: Duration,
    /// 单条兜底记录的回放重试上限
    pub replay_max_retries: u32,
}

impl Default for DurableSinkConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            flush_interval: Duration::from_secs(60),
            replay_interval: Duration::from_secs(60),
            replay_batch: 100,
            queue_capacity: 1024,
            write_timeout: Duration::from_secs(10),
            replay_max_retries: 5,
        }
    }
}

impl DurableSinkConfig {
    fn sanitized(mut self) -> Self {
        if self.batch_size == 0 {
            self.batch_size = 1;
        }
        if self.replay_batch == 0 {
            self.replay_batch = 1;
        }
        if self.queue_capacity == 0 {
            self.queue_capacity = 1;
        }
        if self.flush_interval.is_zero() {
            self.flush_interval = Duration::from_millis(1);
        }
        if self.replay_interval.is_zero() {
            self.replay_interval = Duration::from_millis(1);
        }
        if self.replay_max_retries == 0 {
            self.replay_max_retries = 1;
        }
        self
    }
}

/// 单次刷写结果。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    Empty,
    Written(usize),
    Spilled(usize),
}

struct DurableSinkInner {
    store: Arc<dyn HistoricalStore>,
    fallback: Arc<dyn FallbackLog>,
    config: DurableSinkConfig,
    buffer: Mutex<Vec<PhysicalSample>>,
    /// 串行化刷写与回放，保证兜底日志追加顺序与入队顺序一致。
    flush_gate: Mutex<()>,
}

/// 持久化写入入口。
#[derive(Clone)]
pub struct DurableSink {
    inner: Arc<DurableSinkInner>,
}

impl DurableSink {
    pub fn new(
        store: Arc<dyn HistoricalStore>,
        fallback: Arc<dyn FallbackLog>,
        config: DurableSinkConfig,
    ) -> Self {
        let inner = DurableSinkInner {
            store,
            fallback,
            config: config.sanitized(),
            buffer: Mutex::new(Vec::new()),
            flush_gate: Mutex::new(()),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn config(&self) -> &DurableSinkConfig {
        &self.inner.config
    }

    /// 入缓冲；达到批量阈值时立即刷写。
    pub async fn enqueue(&self, sample: PhysicalSample) -> Result<FlushOutcome, PipelineError> {
        let pending = {
            let mut buffer = self.inner.buffer.lock().await;
            buffer.push(sample);
            buffer.len()
        };
        if pending < self.inner.config.batch_size {
            return Ok(FlushOutcome::Empty);
        }
        self.flush().await
    }

    /// 刷写当前缓冲。
    ///
    /// 写库失败时整批按原顺序追加到兜底日志并清空缓冲；
    /// 兜底日志也写不进去时，样本放回缓冲头部等待下次刷写。
    pub async fn flush(&self) -> Result<FlushOutcome, PipelineError> {
        let _gate = self.inner.flush_gate.lock().await;
        let batch = std::mem::take(&mut *self.inner.buffer.lock().await);
        if batch.is_empty() {
            return Ok(FlushOutcome::Empty);
        }

        match self.write_store(&batch).await {
            Ok(written) => {
                debug!(target: "kiln.sink", written, "batch_flushed");
                Ok(FlushOutcome::Written(written))
            }
            Err(err) => {
                warn!(
                    target: "kiln.sink",
                    samples = batch.len(),
                    error = %err,
                    "flush_failed_spilling"
                );
                match self.inner.fallback.append(&batch).await {
                    Ok(spilled) => {
                        record_samples_spilled(spilled as u64);
                        Ok(FlushOutcome::Spilled(spilled))
                    }
                    Err(fallback_err) => {
                        error!(
                            target: "kiln.sink",
                            samples = batch.len(),
                            error = %fallback_err,
                            "fallback_append_failed"
                        );
                        self.requeue(batch).await;
                        Err(PipelineError::Fallback(fallback_err.to_string()))
                    }
                }
            }
        }
    }

    /// 回放兜底日志，直到清空或本轮不再有进展。
    ///
    /// 历史库健康检查失败时本轮跳过。条目只在写库确认后删除。
    /// 整批被拒时逐条重写以隔离坏条目：写成功的删除，失败的重试次数加一；
    /// 逐条写超时说明历史库不可用，立即结束本轮。
    pub async fn replay_once(&self) -> Result<usize, PipelineError> {
        let _gate = self.inner.flush_gate.lock().await;
        let max_retries = self.inner.config.replay_max_retries;
        let mut replayed = 0usize;
        let mut checked = false;
        loop {
            let entries = self
                .inner
                .fallback
                .oldest(self.inner.config.replay_batch, max_retries)
                .await
                .map_err(|err| PipelineError::Fallback(err.to_string()))?;
            if entries.is_empty() {
                break;
            }
            if !checked {
                if let Err(err) = self.inner.store.health_check().await {
                    debug!(target: "kiln.sink", error = %err, "replay_skipped_unhealthy");
                    return Ok(0);
                }
                checked = true;
            }
            let samples: Vec<PhysicalSample> =
                entries.iter().map(|entry| entry.sample.clone()).collect();
            let (written, failed, timed_out) = match self.write_store(&samples).await {
                Ok(_) => (entries.iter().map(|entry| entry.seq).collect(), Vec::new(), false),
                Err(PipelineError::Timeout(timeout)) => {
                    self.mark_retry(&entries.iter().map(|entry| entry.seq).collect::<Vec<_>>())
                        .await?;
                    return Err(PipelineError::Timeout(timeout));
                }
                Err(err) => {
                    debug!(
                        target: "kiln.sink",
                        entries = entries.len(),
                        error = %err,
                        "replay_batch_rejected"
                    );
                    self.replay_individually(&entries).await
                }
            };
            self.remove(&written).await?;
            replayed += written.len();
            record_samples_replayed(written.len() as u64);
            if !failed.is_empty() {
                self.mark_retry(&failed).await?;
                warn!(
                    target: "kiln.sink",
                    failed = failed.len(),
                    max_retries,
                    "replay_entries_rejected"
                );
            }
            if timed_out || written.is_empty() || entries.len() < self.inner.config.replay_batch {
                break;
            }
        }
        if replayed > 0 {
            info!(target: "kiln.sink", replayed, "fallback_replayed");
        }
        Ok(replayed)
    }

    /// 逐条写库，返回已写入与写失败的 seq，以及是否因超时提前停止。
    async fn replay_individually(
        &self,
        entries: &[FallbackEntry],
    ) -> (Vec<i64>, Vec<i64>, bool) {
        let mut written = Vec::new();
        let mut failed = Vec::new();
        for entry in entries {
            match self.write_store(std::slice::from_ref(&entry.sample)).await {
                Ok(_) => written.push(entry.seq),
                Err(PipelineError::Timeout(_)) => {
                    failed.push(entry.seq);
                    return (written, failed, true);
                }
                Err(err) => {
                    debug!(
                        target: "kiln.sink",
                        seq = entry.seq,
                        device_id = %entry.sample.device_id,
                        retry_count = entry.retry_count,
                        error = %err,
                        "replay_entry_rejected"
                    );
                    failed.push(entry.seq);
                }
            }
        }
        (written, failed, false)
    }

    async fn remove(&self, seqs: &[i64]) -> Result<(), PipelineError> {
        if seqs.is_empty() {
            return Ok(());
        }
        self.inner
            .fallback
            .remove(seqs)
            .await
            .map(|_| ())
            .map_err(|err| PipelineError::Fallback(err.to_string()))
    }

    async fn mark_retry(&self, seqs: &[i64]) -> Result<(), PipelineError> {
        self.inner
            .fallback
            .mark_retry(seqs)
            .await
            .map(|_| ())
            .map_err(|err| PipelineError::Fallback(err.to_string()))
    }

    /// 兜底日志待回放条数。
    pub async fn fallback_depth(&self) -> Result<usize, PipelineError> {
        self.inner
            .fallback
            .depth()
            .await
            .map_err(|err| PipelineError::Fallback(err.to_string()))
    }

    /// 兜底日志留存条数、已跳过条数与最旧条目时间。
    pub async fn fallback_stats(&self) -> Result<FallbackStats, PipelineError> {
        self.inner
            .fallback
            .stats(self.inner.config.replay_max_retries)
            .await
            .map_err(|err| PipelineError::Fallback(err.to_string()))
    }

    /// 内存缓冲中的条数。
    pub async fn buffered(&self) -> usize {
        self.inner.buffer.lock().await.len()
    }

    /// 创建有界入站队列，返回给轮询任务使用的句柄与接收端。
    pub fn channel(&self) -> (DurableSinkHandle, mpsc::Receiver<PhysicalSample>) {
        let (tx, rx) = mpsc::channel(self.inner.config.queue_capacity);
        (DurableSinkHandle { tx }, rx)
    }

    /// 入站任务：消费队列、按时间阈值刷写。
    ///
    /// 所有句柄被丢弃后排空队列并做最后一次刷写，然后退出。
    pub fn spawn_ingest(&self, mut rx: mpsc::Receiver<PhysicalSample>) -> JoinHandle<()> {
        let sink = self.clone();
        tokio::spawn(async move {
            let period = sink.inner.config.flush_interval;
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    maybe = rx.recv() => {
                        let Some(sample) = maybe else { break };
                        if let Err(err) = sink.enqueue(sample).await {
                            warn!(target: "kiln.sink", error = %err, "enqueue_flush_failed");
                        }
                    }
                    _ = ticker.tick() => {
                        if let Err(err) = sink.flush().await {
                            warn!(target: "kiln.sink", error = %err, "timed_flush_failed");
                        }
                    }
                }
            }
            match sink.flush().await {
                Ok(outcome) => info!(target: "kiln.sink", ?outcome, "final_flush"),
                Err(err) => {
                    let buffered = sink.buffered().await;
                    error!(
                        target: "kiln.sink",
                        error = %err,
                        buffered = buffered,
                        "final_flush_failed"
                    )
                }
            }
        })
    }

    /// 回放任务：按固定间隔回放兜底日志，直到取消。
    pub fn spawn_replay(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let sink = self.clone();
        tokio::spawn(async move {
            let period = sink.inner.config.replay_interval;
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = sink.replay_once().await {
                            warn!(target: "kiln.sink", error = %err, "replay_failed");
                        }
                    }
                }
            }
            debug!(target: "kiln.sink", "replay_stopped");
        })
    }

    async fn write_store(&self, batch: &[PhysicalSample]) -> Result<usize, PipelineError> {
        let points: Vec<MeasurementPoint> = batch.iter().map(MeasurementPoint::from).collect();
        let timeout = self.inner.config.write_timeout;
        let started = Instant::now();
        let result = match tokio::time::timeout(timeout, self.inner.store.write_batch(&points)).await
        {
            Ok(Ok(written)) => Ok(written),
            Ok(Err(err)) => Err(PipelineError::Store(err.to_string())),
            Err(_) => Err(PipelineError::Timeout(timeout)),
        };
        match &result {
            Ok(written) => {
                record_store_write_success(*written as u64);
                record_write_latency_ms(started.elapsed().as_millis() as u64);
            }
            Err(_) => record_store_write_failure(),
        }
        result
    }

    async fn requeue(&self, mut batch: Vec<PhysicalSample>) {
        let mut buffer = self.inner.buffer.lock().await;
        batch.append(&mut buffer);
        *buffer = batch;
    }
}

/// 轮询任务持有的入站句柄。队列满时等待（背压），不丢样本。
#[derive(Clone)]
pub struct DurableSinkHandle {
    tx: mpsc::Sender<PhysicalSample>,
}

#[async_trait]
impl SampleSink for DurableSinkHandle {
    fn name(&self) -> &'static str {
        "durable"
    }

    async fn publish(&self, sample: PhysicalSample) -> Result<(), IngestError> {
        match self.tx.try_send(sample) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(sample)) => {
                record_backpressure();
                self.tx
                    .send(sample)
                    .await
                    .map_err(|_| IngestError::SinkClosed("durable"))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(IngestError::SinkClosed("durable")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::ModuleKind;
    use kiln_storage::{InMemoryFallbackLog, InMemoryHistoricalStore, StorageError};
    use std::collections::BTreeMap;

    struct RejectingStore;

    #[async_trait]
    impl HistoricalStore for RejectingStore {
        async fn write_batch(&self, _points: &[MeasurementPoint]) -> Result<usize, StorageError> {
            Err(StorageError::new("forced failure"))
        }
    }

    struct BrokenFallback;

    #[async_trait]
    impl FallbackLog for BrokenFallback {
        async fn append(&self, _samples: &[PhysicalSample]) -> Result<usize, StorageError> {
            Err(StorageError::new("disk full"))
        }

        async fn oldest(
            &self,
            _limit: usize,
            _max_retries: u32,
        ) -> Result<Vec<FallbackEntry>, StorageError> {
            Ok(Vec::new())
        }

        async fn remove(&self, _seqs: &[i64]) -> Result<usize, StorageError> {
            Ok(0)
        }

        async fn mark_retry(&self, _seqs: &[i64]) -> Result<usize, StorageError> {
            Ok(0)
        }

        async fn depth(&self) -> Result<usize, StorageError> {
            Ok(0)
        }

        async fn stats(&self, _max_retries: u32) -> Result<FallbackStats, StorageError> {
            Ok(FallbackStats::default())
        }
    }

    fn sample(ts_ms: i64) -> PhysicalSample {
        let mut fields = BTreeMap::new();
        fields.insert("temperature".to_string(), 900.0);
        PhysicalSample {
            device_id: "kiln_1".to_string(),
            module_id: "temp".to_string(),
            device_type: "kiln".to_string(),
            kind: ModuleKind::Temperature,
            ts_ms,
            fields,
            valid: true,
        }
    }

    fn config(batch_size: usize) -> DurableSinkConfig {
        DurableSinkConfig {
            batch_size,
            ..DurableSinkConfig::default()
        }
    }

    #[tokio::test]
    async fn enqueue_flushes_at_batch_size() {
        let store = Arc::new(InMemoryHistoricalStore::new());
        let sink = DurableSink::new(
            store.clone(),
            Arc::new(InMemoryFallbackLog::new()),
            config(2),
        );
        assert_eq!(sink.enqueue(sample(1)).await.expect("queued"), FlushOutcome::Empty);
        assert_eq!(store.len(), 0);
        assert_eq!(
            sink.enqueue(sample(2)).await.expect("flushed"),
            FlushOutcome::Written(2)
        );
        assert_eq!(store.len(), 2);
        assert_eq!(sink.buffered().await, 0);
    }

    #[tokio::test]
    async fn flush_on_empty_buffer_is_noop() {
        let sink = DurableSink::new(
            Arc::new(RejectingStore),
            Arc::new(InMemoryFallbackLog::new()),
            config(10),
        );
        assert_eq!(sink.flush().await.expect("flush"), FlushOutcome::Empty);
        assert_eq!(sink.fallback_depth().await.expect("depth"), 0);
    }

    #[tokio::test]
    async fn broken_fallback_keeps_samples_buffered() {
        let sink = DurableSink::new(Arc::new(RejectingStore), Arc::new(BrokenFallback), config(3));
        sink.enqueue(sample(1)).await.expect("queued");
        sink.enqueue(sample(2)).await.expect("queued");
        let err = sink.enqueue(sample(3)).await.expect_err("fallback failure");
        assert!(matches!(err, PipelineError::Fallback(_)));
        assert_eq!(sink.buffered().await, 3);
    }

    #[tokio::test]
    async fn replay_skipped_while_store_unhealthy() {
        struct DownStore;

        #[async_trait]
        impl HistoricalStore for DownStore {
            async fn write_batch(
                &self,
                _points: &[MeasurementPoint],
            ) -> Result<usize, StorageError> {
                Err(StorageError::new("down"))
            }

            async fn health_check(&self) -> Result<(), StorageError> {
                Err(StorageError::new("down"))
            }
        }

        let fallback = Arc::new(InMemoryFallbackLog::new());
        fallback.append(&[sample(1), sample(2)]).await.expect("append");
        let sink = DurableSink::new(Arc::new(DownStore), fallback.clone(), config(10));
        assert_eq!(sink.replay_once().await.expect("skipped"), 0);
        assert_eq!(sink.fallback_depth().await.expect("depth"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn replay_timeout_counts_a_retry_and_stops() {
        struct HangingStore;

        #[async_trait]
        impl HistoricalStore for HangingStore {
            async fn write_batch(
                &self,
                _points: &[MeasurementPoint],
            ) -> Result<usize, StorageError> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(0)
            }
        }

        let fallback = Arc::new(InMemoryFallbackLog::new());
        fallback.append(&[sample(1), sample(2)]).await.expect("append");
        let sink = DurableSink::new(
            Arc::new(HangingStore),
            fallback.clone(),
            DurableSinkConfig {
                write_timeout: Duration::from_secs(1),
                ..DurableSinkConfig::default()
            },
        );
        let err = sink.replay_once().await.expect_err("timeout");
        assert!(matches!(err, PipelineError::Timeout(_)));
        let entries = fallback.oldest(10, 5).await.expect("oldest");
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|entry| entry.retry_count == 1));
    }
}
