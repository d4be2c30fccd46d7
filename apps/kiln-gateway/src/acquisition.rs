//! 采集链路装配与停机。
//!
//! 轮询任务 → {持久化队列, 分发队列}；持久化与分发各自的后台任务独立运行。

use crate::{AppState, WsSettings};
use api_contract::DataSource;
use kiln_codec::ValidatedSchema;
use kiln_config::AppConfig;
use kiln_hub::{DistributionHub, HubConfig};
use kiln_ingest::{PollConfig, PollOrchestrator, SampleSink};
use kiln_normalize::{FeedRateConfig, UnitConverter};
use kiln_pipeline::{DurableSink, DurableSinkConfig};
use kiln_protocol::{
    BlockTransport, ConnectionManager, LinkConfig, LinkStatus, SimulatedConfig,
    SimulatedTransport, TcpBlockTransport, TcpLinkConfig,
};
use kiln_storage::{
    FallbackLog, HistoricalStore, InMemoryHistoricalStore, PgHistoricalStore, SqliteFallbackLog,
    StorageError,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const WS_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// 运行中的采集链路。
pub struct Acquisition {
    hub: DistributionHub,
    sink: DurableSink,
    link_status: watch::Receiver<LinkStatus>,
    cancel: CancellationToken,
    poll_task: JoinHandle<PollOrchestrator>,
    sink_task: JoinHandle<()>,
    background: Vec<JoinHandle<()>>,
}

impl Acquisition {
    /// 按配置构建历史库与兜底日志，然后启动。
    pub async fn start(
        config: &AppConfig,
        schema: ValidatedSchema,
        cancel: CancellationToken,
    ) -> Result<Self, StorageError> {
        let store: Arc<dyn HistoricalStore> = match config.store_url.as_deref() {
            Some(url) => Arc::new(PgHistoricalStore::connect_lazy(url)?),
            None => {
                warn!(target: "kiln.sink", "store_url_unset_using_in_memory_store");
                Arc::new(InMemoryHistoricalStore::new())
            }
        };
        let fallback: Arc<dyn FallbackLog> =
            Arc::new(SqliteFallbackLog::open(&config.fallback_path).await?);
        Ok(Self::start_with(config, schema, store, fallback, cancel))
    }

    /// 使用给定的存储启动全部后台任务。
    pub fn start_with(
        config: &AppConfig,
        schema: ValidatedSchema,
        store: Arc<dyn HistoricalStore>,
        fallback: Arc<dyn FallbackLog>,
        cancel: CancellationToken,
    ) -> Self {
        let sink = DurableSink::new(store, fallback, sink_config(config));
        let (sink_handle, sink_rx) = sink.channel();
        let sink_task = sink.spawn_ingest(sink_rx);

        let hub = DistributionHub::new(hub_config(config));
        let (hub_handle, hub_rx) = hub.channel();

        let background = vec![
            sink.spawn_replay(cancel.clone()),
            hub.spawn_ingest(hub_rx, cancel.clone()),
            hub.spawn_reemit(cancel.clone()),
            hub.spawn_sweep(cancel.clone()),
        ];

        let link = ConnectionManager::new(build_transport(config, &schema), link_config(config));
        let converter = UnitConverter::new(FeedRateConfig {
            window_size: config.feed_window_size,
            recompute_interval: config.feed_recompute_interval,
        });
        let sinks: Vec<Arc<dyn SampleSink>> = vec![Arc::new(sink_handle), Arc::new(hub_handle)];
        let mut orchestrator =
            PollOrchestrator::new(link, schema, converter, sinks, poll_config(config));
        let link_status = orchestrator.watch_link_status();
        let poll_task = tokio::spawn(orchestrator.run(cancel.clone()));

        info!(
            target: "kiln.poll",
            simulated = config.simulated,
            poll_interval_ms = config.poll_interval_ms,
            "acquisition_started"
        );

        Self {
            hub,
            sink,
            link_status,
            cancel,
            poll_task,
            sink_task,
            background,
        }
    }

    pub fn hub(&self) -> &DistributionHub {
        &self.hub
    }

    pub fn sink(&self) -> &DurableSink {
        &self.sink
    }

    pub fn link_status(&self) -> watch::Receiver<LinkStatus> {
        self.link_status.clone()
    }

    /// HTTP 层共享状态。
    pub fn app_state(&self, ws: WsSettings, shutdown: CancellationToken) -> AppState {
        AppState {
            hub: self.hub.clone(),
            sink: self.sink.clone(),
            link_status: self.link_status.clone(),
            ws,
            shutdown,
        }
    }

    /// 协作式停机：停止轮询 → 最后一次刷写 → 停止其余后台任务 → 断开现场链路。
    pub async fn shutdown(self) {
        self.cancel.cancel();

        let orchestrator = match self.poll_task.await {
            Ok(orchestrator) => Some(orchestrator),
            Err(err) => {
                error!(target: "kiln.poll", error = %err, "poll_task_join_failed");
                None
            }
        };

        if let Err(err) = self.sink_task.await {
            error!(target: "kiln.sink", error = %err, "sink_task_join_failed");
        }

        for task in self.background {
            if let Err(err) = task.await {
                warn!(error = %err, "background_task_join_failed");
            }
        }

        if let Some(mut orchestrator) = orchestrator {
            orchestrator.release_link().await;
        }
        info!(target: "kiln.poll", "acquisition_stopped");
    }
}

fn build_transport(config: &AppConfig, schema: &ValidatedSchema) -> Box<dyn BlockTransport> {
    if config.simulated {
        Box::new(SimulatedTransport::new(
            schema,
            SimulatedConfig {
                error_rate: config.sim_error_rate,
                seed: config.sim_seed,
            },
        ))
    } else {
        Box::new(TcpBlockTransport::new(TcpLinkConfig {
            host: config.link_host.clone(),
            port: config.link_port,
            rack: config.link_rack,
            slot: config.link_slot,
        }))
    }
}

fn link_config(config: &AppConfig) -> LinkConfig {
    LinkConfig {
        connect_timeout_ms: config.link_connect_timeout_ms,
        read_timeout_ms: config.link_read_timeout_ms,
        reconnect_attempts: config.link_reconnect_attempts,
        backoff_initial_ms: config.link_backoff_ms,
        backoff_max_ms: config.link_backoff_max_ms,
    }
}

fn poll_config(config: &AppConfig) -> PollConfig {
    PollConfig {
        interval: Duration::from_millis(config.poll_interval_ms),
        degraded_interval: Duration::from_millis(config.degraded_interval_ms),
        degraded_after: config.degraded_after,
    }
}

fn sink_config(config: &AppConfig) -> DurableSinkConfig {
    DurableSinkConfig {
        batch_size: config.flush_batch_size,
        flush_interval: Duration::from_millis(config.flush_interval_ms),
        replay_interval: Duration::from_millis(config.replay_interval_ms),
        replay_batch: config.replay_batch_size,
        queue_capacity: config.sink_queue_capacity,
        write_timeout: Duration::from_millis(config.store_write_timeout_ms),
        replay_max_retries: config.replay_max_retries,
    }
}

fn hub_config(config: &AppConfig) -> HubConfig {
    HubConfig {
        heartbeat_timeout: Duration::from_secs(config.heartbeat_timeout_secs),
        sweep_interval: Duration::from_secs(config.sweep_interval_secs),
        reemit_interval: Duration::from_millis(config.reemit_interval_ms),
        queue_capacity: config.hub_queue_capacity,
        source: if config.simulated {
            DataSource::Simulated
        } else {
            DataSource::Plc
        },
    }
}

/// WebSocket 参数：读空闲超时与心跳超时一致。
pub fn ws_settings(config: &AppConfig) -> WsSettings {
    WsSettings {
        outbound_capacity: config.subscriber_queue_capacity,
        write_timeout: WS_WRITE_TIMEOUT,
        idle_timeout: Duration::from_secs(config.heartbeat_timeout_secs),
    }
}
