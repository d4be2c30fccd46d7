use crate::HubError;
use api_contract::{DataSource, SampleTree, ServerMessage, StatusSummary};
use async_trait::async_trait;
use domain::{Channel, ModuleKey, ModuleKind, PhysicalSample, now_epoch_ms};
use kiln_ingest::{IngestError, SampleSink};
use kiln_telemetry::{record_hub_lagged, record_subscriber_evicted};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 连接标识。
pub type ConnectionId = uuid::Uuid;

/// 已序列化的 JSON 文本帧，多个连接共享同一份。
pub type Frame = Arc<str>;

/// 分发参数。
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// 心跳超时
    pub heartbeat_timeout: Duration,
    /// 存活巡检间隔
    pub sweep_interval: Duration,
    /// 快照重发间隔
    pub reemit_interval: Duration,
    /// 入站队列容量（满时丢弃最旧）
    pub queue_capacity: usize,
    /// 推送消息中的数据来源
    pub source: DataSource,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(45),
            sweep_interval: Duration::from_secs(10),
            reemit_interval: Duration::from_millis(100),
            queue_capacity: 256,
            source: DataSource::Plc,
        }
    }
}

impl HubConfig {
    fn sanitized(mut self) -> Self {
        if self.queue_capacity == 0 {
            self.queue_capacity = 1;
        }
        if self.sweep_interval.is_zero() {
            self.sweep_interval = Duration::from_secs(1);
        }
        if self.reemit_interval.is_zero() {
            self.reemit_interval = Duration::from_millis(100);
        }
        self
    }
}

struct Subscription {
    channels: HashSet<Channel>,
    last_heartbeat: Instant,
    outbound: mpsc::Sender<Frame>,
}

struct HubInner {
    config: HubConfig,
    connections: Mutex<HashMap<ConnectionId, Subscription>>,
    snapshot: RwLock<BTreeMap<ModuleKey, PhysicalSample>>,
}

#[derive(Clone)]
pub struct DistributionHub {
    inner: Arc<HubInner>,
}

impl DistributionHub {
    pub fn new(config: HubConfig) -> Self {
        let inner = HubInner {
            config: config.sanitized(),
            connections: Mutex::new(HashMap::new()),
            snapshot: RwLock::new(BTreeMap::new()),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    /// 登记新连接，心跳计时从此刻开始。
    pub fn register(&self, outbound: mpsc::Sender<Frame>) -> ConnectionId {
        let id = uuid::Uuid::new_v4();
        self.connections().insert(
            id,
            Subscription {
                channels: HashSet::new(),
                last_heartbeat: Instant::now(),
                outbound,
            },
        );
        debug!(target: "kiln.hub", connection_id = %id, "connection_registered");
        id
    }

    /// 订阅频道，并立即推送该频道的当前快照。
    pub fn subscribe(&self, id: ConnectionId, channel: Channel) -> Result<(), HubError> {
        let seed = self.channel_message(channel).and_then(|message| encode(&message));
        let mut connections = self.connections();
        let subscription = connections
            .get_mut(&id)
            .ok_or(HubError::UnknownConnection(id))?;
        subscription.channels.insert(channel);
        debug!(target: "kiln.hub", connection_id = %id, channel = %channel, "subscribed");
        if let Some(frame) = seed {
            if subscription.outbound.try_send(frame).is_err() {
                connections.remove(&id);
                record_subscriber_evicted();
                warn!(target: "kiln.hub", connection_id = %id, "seed_send_failed_evicted");
            }
        }
        Ok(())
    }

    /// 取消订阅，返回此前是否已订阅。
    pub fn unsubscribe(&self, id: ConnectionId, channel: Channel) -> Result<bool, HubError> {
        let mut connections = self.connections();
        let subscription = connections
            .get_mut(&id)
            .ok_or(HubError::UnknownConnection(id))?;
        Ok(subscription.channels.remove(&channel))
    }

    /// 移除连接。重复调用无副作用。
    pub fn unregister(&self, id: ConnectionId) -> bool {
        let removed = self.connections().remove(&id).is_some();
        if removed {
            debug!(target: "kiln.hub", connection_id = %id, "connection_unregistered");
        }
        removed
    }

    pub fn heartbeat(&self, id: ConnectionId) -> Result<(), HubError> {
        let mut connections = self.connections();
        let subscription = connections
            .get_mut(&id)
            .ok_or(HubError::UnknownConnection(id))?;
        subscription.last_heartbeat = Instant::now();
        Ok(())
    }

    /// 向频道的所有订阅者投递，返回成功投递的连接数。
    ///
    /// 投递失败（队列满或连接已关闭）的连接被移除。
    pub fn publish(&self, channel: Channel, message: &ServerMessage) -> usize {
        let mut connections = self.connections();
        if !connections
            .values()
            .any(|subscription| subscription.channels.contains(&channel))
        {
            return 0;
        }
        let Some(frame) = encode(message) else {
            return 0;
        };
        let mut delivered = 0;
        let mut failed = Vec::new();
        for (id, subscription) in connections.iter() {
            if !subscription.channels.contains(&channel) {
                continue;
            }
            match subscription.outbound.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(_) => failed.push(*id),
            }
        }
        for id in failed {
            connections.remove(&id);
            record_subscriber_evicted();
            warn!(
                target: "kiln.hub",
                connection_id = %id,
                channel = %channel,
                "subscriber_send_failed_evicted"
            );
        }
        delivered
    }

    /// 更新快照并立即推送该样本。
    pub fn ingest(&self, sample: PhysicalSample) -> usize {
        let channel = sample.channel();
        let mut data = SampleTree::new();
        data.entry(sample.device_id.clone())
            .or_default()
            .insert(sample.module_id.clone(), sample.clone());
        self.write_snapshot().insert(sample.key(), sample);
        let message = self.build_message(channel, data);
        self.publish(channel, &message)
    }

    /// 从快照重发所有有订阅者的频道。
    pub fn reemit(&self) -> usize {
        let mut delivered = 0;
        for channel in Channel::ALL {
            if self.subscriber_count(channel) == 0 {
                continue;
            }
            if let Some(message) = self.channel_message(channel) {
                delivered += self.publish(channel, &message);
            }
        }
        delivered
    }

    /// 移除心跳超时的连接。
    pub fn sweep_expired_at(&self, now: Instant) -> Vec<ConnectionId> {
        let timeout = self.inner.config.heartbeat_timeout;
        let mut connections = self.connections();
        let expired: Vec<ConnectionId> = connections
            .iter()
            .filter(|(_, subscription)| {
                now.saturating_duration_since(subscription.last_heartbeat) > timeout
            })
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            connections.remove(id);
            info!(
                target: "kiln.hub",
                connection_id = %id,
                timeout_secs = timeout.as_secs(),
                "heartbeat_expired"
            );
        }
        expired
    }

    pub fn sweep_expired(&self) -> Vec<ConnectionId> {
        self.sweep_expired_at(Instant::now())
    }

    pub fn connection_count(&self) -> usize {
        self.connections().len()
    }

    pub fn is_registered(&self, id: ConnectionId) -> bool {
        self.connections().contains_key(&id)
    }

    pub fn subscriber_count(&self, channel: Channel) -> usize {
        self.connections()
            .values()
            .filter(|subscription| subscription.channels.contains(&channel))
            .count()
    }

    /// 指定模块的最新样本。
    pub fn latest(&self, device_id: &str, module_id: &str) -> Option<PhysicalSample> {
        self.read_snapshot()
            .get(&ModuleKey::new(device_id, module_id))
            .cloned()
    }

    /// 全部模块的最新样本。
    pub fn latest_all(&self) -> SampleTree {
        let mut tree = SampleTree::new();
        for sample in self.read_snapshot().values() {
            tree.entry(sample.device_id.clone())
                .or_default()
                .insert(sample.module_id.clone(), sample.clone());
        }
        tree
    }

    /// 按频道组装快照消息，快照为空时返回 `None`。
    pub fn channel_message(&self, channel: Channel) -> Option<ServerMessage> {
        let mut data = SampleTree::new();
        for sample in self
            .read_snapshot()
            .values()
            .filter(|sample| sample.channel() == channel)
        {
            data.entry(sample.device_id.clone())
                .or_default()
                .insert(sample.module_id.clone(), sample.clone());
        }
        if data.is_empty() {
            return None;
        }
        Some(self.build_message(channel, data))
    }

    fn build_message(&self, channel: Channel, data: SampleTree) -> ServerMessage {
        let timestamp = now_epoch_ms();
        let source = self.inner.config.source;
        match channel {
            Channel::Realtime => ServerMessage::RealtimeData {
                success: true,
                timestamp,
                source,
                data,
            },
            Channel::DeviceStatus => ServerMessage::DeviceStatus {
                success: true,
                timestamp,
                source,
                data,
                summary: self.status_summary(),
            },
        }
    }

    /// 按快照中全部数字状态模块汇总。
    pub fn status_summary(&self) -> StatusSummary {
        let snapshot = self.read_snapshot();
        let mut summary = StatusSummary::default();
        for sample in snapshot
            .values()
            .filter(|sample| sample.kind == ModuleKind::DigitalStatus)
        {
            summary.total += 1;
            let faulted = !sample.valid || sample.field("error").unwrap_or(0.0) > 0.5;
            if faulted {
                summary.error += 1;
            } else {
                summary.normal += 1;
            }
        }
        summary
    }

    /// 创建入站队列（满时丢弃最旧），返回轮询任务使用的句柄与接收端。
    pub fn channel(&self) -> (HubHandle, broadcast::Receiver<PhysicalSample>) {
        let (tx, rx) = broadcast::channel(self.inner.config.queue_capacity);
        (HubHandle { tx }, rx)
    }

    /// 入站任务：消费队列直到所有句柄被丢弃或取消。
    pub fn spawn_ingest(
        &self,
        mut rx: broadcast::Receiver<PhysicalSample>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let hub = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    received = rx.recv() => match received {
                        Ok(sample) => {
                            hub.ingest(sample);
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            record_hub_lagged(skipped);
                            warn!(target: "kiln.hub", skipped, "hub_queue_lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
            debug!(target: "kiln.hub", "hub_ingest_stopped");
        })
    }

    /// 快照重发任务。
    pub fn spawn_reemit(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let hub = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(hub.inner.config.reemit_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        hub.reemit();
                    }
                }
            }
            debug!(target: "kiln.hub", "reemit_stopped");
        })
    }

    /// 存活巡检任务。
    pub fn spawn_sweep(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let hub = self.clone();
        tokio::spawn(async move {
            let period = hub.inner.config.sweep_interval;
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        hub.sweep_expired();
                    }
                }
            }
            debug!(target: "kiln.hub", "sweep_stopped");
        })
    }

    fn connections(&self) -> MutexGuard<'_, HashMap<ConnectionId, Subscription>> {
        self.inner
            .connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read_snapshot(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, BTreeMap<ModuleKey, PhysicalSample>> {
        self.inner
            .snapshot
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_snapshot(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, BTreeMap<ModuleKey, PhysicalSample>> {
        self.inner
            .snapshot
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn encode(message: &ServerMessage) -> Option<Frame> {
    match message.to_json() {
        Ok(text) => Some(Arc::from(text)),
        Err(err) => {
            warn!(target: "kiln.hub", error = %err, "message_encode_failed");
            None
        }
    }
}

/// 轮询任务持有的入站句柄。广播队列满时最旧的样本被覆盖，发送从不等待。
#[derive(Clone)]
pub struct HubHandle {
    tx: broadcast::Sender<PhysicalSample>,
}

#[async_trait]
impl SampleSink for HubHandle {
    fn name(&self) -> &'static str {
        "hub"
    }

    async fn publish(&self, sample: PhysicalSample) -> Result<(), IngestError> {
        self.tx
            .send(sample)
            .map(|_| ())
            .map_err(|_| IngestError::SinkClosed("hub"))
    }
}
