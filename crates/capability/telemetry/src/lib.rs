//! 追踪初始化、请求 ID 生成与进程内计数指标。

use serde::Serialize;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing_subscriber::{EnvFilter, fmt};

/// 请求级追踪标识。
#[derive(Debug, Clone)]
pub struct RequestIds {
    pub request_id: String,
    pub trace_id: String,
}

/// 指标快照（/health 输出）。
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct MetricsSnapshot {
    pub poll_cycles: u64,
    pub block_read_failures: u64,
    pub link_reconnects: u64,
    pub samples_converted: u64,
    pub samples_invalid: u64,
    pub store_write_success: u64,
    pub store_write_failure: u64,
    pub samples_spilled: u64,
    pub samples_replayed: u64,
    pub hub_lagged: u64,
    pub subscribers_evicted: u64,
    pub backpressure: u64,
    pub write_latency_ms_total: u64,
    pub write_latency_ms_count: u64,
}

/// 进程内计数指标。
pub struct TelemetryMetrics {
    poll_cycles: AtomicU64,
    block_read_failures: AtomicU64,
    link_reconnects: AtomicU64,
    samples_converted: AtomicU64,
    samples_invalid: AtomicU64,
    store_write_success: AtomicU64,
    store_write_failure: AtomicU64,
    samples_spilled: AtomicU64,
    samples_replayed: AtomicU64,
    hub_lagged: AtomicU64,
    subscribers_evicted: AtomicU64,
    backpressure: AtomicU64,
    write_latency_ms_total: AtomicU64,
    write_latency_ms_count: AtomicU64,
}

impl TelemetryMetrics {
    pub fn new() -> Self {
        Self {
            poll_cycles: AtomicU64::new(0),
            block_read_failures: AtomicU64::new(0),
            link_reconnects: AtomicU64::new(0),
            samples_converted: AtomicU64::new(0),
            samples_invalid: AtomicU64::new(0),
            store_write_success: AtomicU64::new(0),
            store_write_failure: AtomicU64::new(0),
            samples_spilled: AtomicU64::new(0),
            samples_replayed: AtomicU64::new(0),
            hub_lagged: AtomicU64::new(0),
            subscribers_evicted: AtomicU64::new(0),
            backpressure: AtomicU64::new(0),
            write_latency_ms_total: AtomicU64::new(0),
            write_latency_ms_count: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            poll_cycles: self.poll_cycles.load(Ordering::Relaxed),
            block_read_failures: self.block_read_failures.load(Ordering::Relaxed),
            link_reconnects: self.link_reconnects.load(Ordering::Relaxed),
            samples_converted: self.samples_converted.load(Ordering::Relaxed),
            samples_invalid: self.samples_invalid.load(Ordering::Relaxed),
            store_write_success: self.store_write_success.load(Ordering::Relaxed),
            store_write_failure: self.store_write_failure.load(Ordering::Relaxed),
            samples_spilled: self.samples_spilled.load(Ordering::Relaxed),
            samples_replayed: self.samples_replayed.load(Ordering::Relaxed),
            hub_lagged: self.hub_lagged.load(Ordering::Relaxed),
            subscribers_evicted: self.subscribers_evicted.load(Ordering::Relaxed),
            backpressure: self.backpressure.load(Ordering::Relaxed),
            write_latency_ms_total: self.write_latency_ms_total.load(Ordering::Relaxed),
            write_latency_ms_count: self.write_latency_ms_count.load(Ordering::Relaxed),
        }
    }
}

impl Default for TelemetryMetrics {
    fn default() -> Self {
        Self::new()
    }
}

static METRICS: OnceLock<TelemetryMetrics> = OnceLock::new();

/// 获取全局指标实例。
pub fn metrics() -> &'static TelemetryMetrics {
    METRICS.get_or_init(TelemetryMetrics::new)
}

/// 初始化 tracing（默认 info）。
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}

/// 生成新的 request_id 与 trace_id。
pub fn new_request_ids() -> RequestIds {
    RequestIds {
        request_id: uuid::Uuid::new_v4().to_string(),
        trace_id: uuid::Uuid::new_v4().to_string(),
    }
}

/// 记录完成的轮询周期。
pub fn record_poll_cycle() {
    metrics().poll_cycles.fetch_add(1, Ordering::Relaxed);
}

/// 记录读块失败次数。
pub fn record_block_read_failure() {
    metrics().block_read_failures.fetch_add(1, Ordering::Relaxed);
}

/// 记录链路重连成功次数。
pub fn record_link_reconnect() {
    metrics().link_reconnects.fetch_add(1, Ordering::Relaxed);
}

/// 记录换算输出条数。
pub fn record_sample_converted() {
    metrics().samples_converted.fetch_add(1, Ordering::Relaxed);
}

/// 记录标记为无效的样本。
pub fn record_sample_invalid() {
    metrics().samples_invalid.fetch_add(1, Ordering::Relaxed);
}

/// 记录历史库批量写入成功（按条数累加）。
pub fn record_store_write_success(count: u64) {
    metrics()
        .store_write_success
        .fetch_add(count, Ordering::Relaxed);
}

/// 记录历史库批量写入失败次数。
pub fn record_store_write_failure() {
    metrics().store_write_failure.fetch_add(1, Ordering::Relaxed);
}

/// 记录落入兜底日志的样本数。
pub fn record_samples_spilled(count: u64) {
    metrics().samples_spilled.fetch_add(count, Ordering::Relaxed);
}

/// 记录回放成功的样本数。
pub fn record_samples_replayed(count: u64) {
    metrics().samples_replayed.fetch_add(count, Ordering::Relaxed);
}

/// 记录分发队列滞后丢弃的条数。
pub fn record_hub_lagged(count: u64) {
    metrics().hub_lagged.fetch_add(count, Ordering::Relaxed);
}

/// 记录因发送失败被移除的订阅连接。
pub fn record_subscriber_evicted() {
    metrics().subscribers_evicted.fetch_add(1, Ordering::Relaxed);
}

/// 记录背压次数。
pub fn record_backpressure() {
    metrics().backpressure.fetch_add(1, Ordering::Relaxed);
}

/// 记录写入延迟（毫秒）。
pub fn record_write_latency_ms(latency_ms: u64) {
    let metrics = metrics();
    metrics
        .write_latency_ms_total
        .fetch_add(latency_ms, Ordering::Relaxed);
    metrics
        .write_latency_ms_count
        .fetch_add(1, Ordering::Relaxed);
}
