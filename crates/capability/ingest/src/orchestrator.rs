use crate::SampleSink;
use domain::{BlockSchema, now_epoch_ms};
use kiln_codec::{ValidatedSchema, decode, module_slice};
use kiln_normalize::{LoadingEvent, UnitConverter};
use kiln_protocol::{ConnectionManager, LinkStatus};
use kiln_telemetry::{
    record_block_read_failure, record_link_reconnect, record_poll_cycle, record_sample_converted,
    record_sample_invalid,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 轮询参数。
#[derive(Debug, Clone)]
pub struct PollConfig {
    /// 正常轮询间隔
    pub interval: Duration,
    /// 降级后的重试间隔
    pub degraded_interval: Duration,
    /// 连续读块失败多少次后进入降级
    pub degraded_after: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            degraded_interval: Duration::from_secs(30),
            degraded_after: 5,
        }
    }
}

impl PollConfig {
    fn sanitized(mut self) -> Self {
        if self.interval.is_zero() {
            self.interval = Duration::from_millis(1);
        }
        if self.degraded_interval < self.interval {
            self.degraded_interval = self.interval;
        }
        if self.degraded_after == 0 {
            self.degraded_after = 1;
        }
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Idle,
    Polling,
    Degraded,
}

/// 单个轮询周期的结果。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub blocks_ok: usize,
    pub blocks_failed: usize,
    pub samples: usize,
    pub invalid: usize,
    pub failed_blocks: Vec<u16>,
}

pub struct PollOrchestrator {
    link: ConnectionManager,
    schema: ValidatedSchema,
    converter: UnitConverter,
    sinks: Vec<Arc<dyn SampleSink>>,
    config: PollConfig,
    state: PollState,
    consecutive_failures: u32,
    status_tx: Option<watch::Sender<LinkStatus>>,
}

impl PollOrchestrator {
    pub fn new(
        link: ConnectionManager,
        schema: ValidatedSchema,
        converter: UnitConverter,
        sinks: Vec<Arc<dyn SampleSink>>,
        config: PollConfig,
    ) -> Self {
        Self {
            link,
            schema,
            converter,
            sinks,
            config: config.sanitized(),
            state: PollState::Idle,
            consecutive_failures: 0,
            status_tx: None,
        }
    }

    /// 订阅链路状态；每个轮询周期结束后更新。
    pub fn watch_link_status(&mut self) -> watch::Receiver<LinkStatus> {
        match &self.status_tx {
            Some(tx) => tx.subscribe(),
            None => {
                let (tx, rx) = watch::channel(self.link.status().clone());
                self.status_tx = Some(tx);
                rx
            }
        }
    }

    pub fn state(&self) -> PollState {
        self.state
    }

    pub fn link_status(&self) -> &LinkStatus {
        self.link.status()
    }

    pub fn converter(&self) -> &UnitConverter {
        &self.converter
    }

    /// 当前状态下的下一次轮询间隔。
    pub fn current_interval(&self) -> Duration {
        match self.state {
            PollState::Degraded => self.config.degraded_interval,
            _ => self.config.interval,
        }
    }

    pub async fn poll_once(&mut self) -> CycleReport {
        self.poll_once_at(now_epoch_ms()).await
    }

    /// 以给定时间戳执行一个轮询周期。
    ///
    /// 单块失败只跳过该块的模块，其余块照常发布。
    pub async fn poll_once_at(&mut self, ts_ms: i64) -> CycleReport {
        if self.state == PollState::Idle {
            self.state = PollState::Polling;
        }
        let mut report = CycleReport::default();
        let blocks: Vec<BlockSchema> = self.schema.blocks().to_vec();
        for block in &blocks {
            let reconnects_before = self.link.status().reconnect_count;
            let result = self
                .link
                .read_block(block.block_id, block.start_offset, block.size)
                .await;
            let reconnects = self.link.status().reconnect_count - reconnects_before;
            for _ in 0..reconnects {
                record_link_reconnect();
            }
            match result {
                Ok(bytes) if bytes.len() >= block.size => {
                    report.blocks_ok += 1;
                    self.on_block_success();
                    self.publish_block(block, &bytes, ts_ms, &mut report).await;
                }
                Ok(bytes) => {
                    let reason = format!("short block: {} of {} bytes", bytes.len(), block.size);
                    self.on_block_failure(block.block_id, &reason);
                    report.blocks_failed += 1;
                    report.failed_blocks.push(block.block_id);
                }
                Err(err) => {
                    self.on_block_failure(block.block_id, &err.to_string());
                    report.blocks_failed += 1;
                    report.failed_blocks.push(block.block_id);
                }
            }
        }
        record_poll_cycle();
        self.publish_status();
        debug!(
            target: "kiln.poll",
            blocks_ok = report.blocks_ok,
            blocks_failed = report.blocks_failed,
            samples = report.samples,
            invalid = report.invalid,
            "poll_cycle_done"
        );
        report
    }

    async fn publish_block(
        &mut self,
        block: &BlockSchema,
        bytes: &[u8],
        ts_ms: i64,
        report: &mut CycleReport,
    ) {
        for module in &block.modules {
            let Some(region) = module_slice(bytes, module) else {
                continue;
            };
            let raw = decode(module, region, ts_ms);
            let converted = self.converter.convert(module, &raw);
            record_sample_converted();
            report.samples += 1;
            if let Some(anomaly) = &converted.anomaly {
                record_sample_invalid();
                report.invalid += 1;
                debug!(
                    target: "kiln.poll",
                    device_id = %module.device_id,
                    module_id = %module.module_id,
                    anomaly = %anomaly,
                    "sample_invalid"
                );
            }
            match &converted.loading_event {
                Some(LoadingEvent::Started { ts_ms, weight }) => info!(
                    target: "kiln.poll",
                    device_id = %module.device_id,
                    module_id = %module.module_id,
                    start_ts_ms = *ts_ms,
                    weight = *weight,
                    "loading_started"
                ),
                Some(LoadingEvent::Finished(record)) => info!(
                    target: "kiln.poll",
                    device_id = %module.device_id,
                    module_id = %module.module_id,
                    start_ts_ms = record.start_ts_ms,
                    end_ts_ms = record.end_ts_ms,
                    min_weight = record.min_weight,
                    max_weight = record.max_weight,
                    amount = record.amount(),
                    "loading_finished"
                ),
                None => {}
            }
            for sink in &self.sinks {
                if let Err(err) = sink.publish(converted.sample.clone()).await {
                    warn!(
                        target: "kiln.poll",
                        sink = sink.name(),
                        device_id = %module.device_id,
                        module_id = %module.module_id,
                        error = %err,
                        "sink_publish_failed"
                    );
                }
            }
        }
    }

    fn on_block_success(&mut self) {
        self.consecutive_failures = 0;
        if self.state == PollState::Degraded {
            info!(target: "kiln.poll", "poll_recovered");
        }
        self.state = PollState::Polling;
    }

    fn on_block_failure(&mut self, block_id: u16, reason: &str) {
        record_block_read_failure();
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        warn!(
            target: "kiln.poll",
            block_id,
            consecutive = self.consecutive_failures,
            error = reason,
            "block_read_failed"
        );
        if self.state != PollState::Degraded
            && self.consecutive_failures >= self.config.degraded_after
        {
            self.state = PollState::Degraded;
            warn!(
                target: "kiln.poll",
                consecutive = self.consecutive_failures,
                retry_ms = self.config.degraded_interval.as_millis() as u64,
                "poll_degraded"
            );
        }
    }

    fn publish_status(&self) {
        if let Some(tx) = &self.status_tx {
            tx.send_replace(self.link.status().clone());
        }
    }

    /// 定时轮询直到取消。
    ///
    /// 退出时先丢弃 sink 句柄（下游据此收尾），链路保持打开，
    /// 由调用方在最终刷写之后调用 [`Self::release_link`]。
    pub async fn run(mut self, cancel: CancellationToken) -> Self {
        if let Err(err) = self.link.connect().await {
            warn!(target: "kiln.poll", error = %err, "initial_connect_failed");
        }
        self.publish_status();
        info!(
            target: "kiln.poll",
            blocks = self.schema.blocks().len(),
            interval_ms = self.config.interval.as_millis() as u64,
            "poll_started"
        );
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = self.poll_once() => {}
            }
            let delay = self.current_interval();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        self.sinks.clear();
        self.state = PollState::Idle;
        info!(target: "kiln.poll", "poll_stopped");
        self
    }

    /// 释放物理链路。
    pub async fn release_link(&mut self) {
        self.link.disconnect().await;
        self.publish_status();
    }
}
