//! 轮询编排：定时读块 → 解码 → 换算 → 分发到下游 sink。
//!
//! 轮询任务是物理链路与换算状态的唯一写者；下游通过 [`SampleSink`] 接收样本，
//! 各自决定排队策略（持久化路径背压、实时路径丢弃最旧）。

mod orchestrator;

pub use orchestrator::{CycleReport, PollConfig, PollOrchestrator, PollState};

use async_trait::async_trait;
use domain::PhysicalSample;

/// 采集错误。
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("sink closed: {0}")]
    SinkClosed(&'static str),
    #[error("sink error: {0}")]
    Sink(String),
}

/// 样本下游。
#[async_trait]
pub trait SampleSink: Send + Sync {
    /// 用于日志的名称。
    fn name(&self) -> &'static str;

    /// 投递一条样本。只允许有界等待。
    async fn publish(&self, sample: PhysicalSample) -> Result<(), IngestError>;
}

/// 空 sink（用于接线与测试）。
#[derive(Debug, Default)]
pub struct NoopSink;

#[async_trait]
impl SampleSink for NoopSink {
    fn name(&self) -> &'static str {
        "noop"
    }

    async fn publish(&self, _sample: PhysicalSample) -> Result<(), IngestError> {
        Ok(())
    }
}
