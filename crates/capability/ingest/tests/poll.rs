use async_trait::async_trait;
use domain::{BlockSchema, DeviceModule, DeviceSchema, ModuleKind, PhysicalSample};
use kiln_codec::{ValidatedSchema, encode_block, validate_schema};
use kiln_ingest::{IngestError, PollConfig, PollOrchestrator, PollState, SampleSink};
use kiln_normalize::{FeedRateConfig, UnitConverter};
use kiln_protocol::{BlockTransport, ConnectionManager, LinkConfig, LinkError};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn module(device_id: &str, module_id: &str, kind: ModuleKind, length: usize) -> DeviceModule {
    DeviceModule {
        module_id: module_id.to_string(),
        device_id: device_id.to_string(),
        device_type: "kiln".to_string(),
        kind,
        byte_offset: 0,
        byte_length: length,
        fields: Vec::new(),
        ct_ratio: None,
    }
}

fn block(block_id: u16, size: usize, modules: Vec<DeviceModule>) -> BlockSchema {
    BlockSchema {
        block_id,
        name: format!("db{block_id}"),
        size,
        start_offset: 0,
        modules,
    }
}

fn three_block_schema() -> ValidatedSchema {
    validate_schema(DeviceSchema {
        blocks: vec![
            block(
                1,
                2,
                vec![module("kiln_1", "temp", ModuleKind::Temperature, 2)],
            ),
            block(2, 10, vec![module("pump_1", "flow", ModuleKind::Flow, 10)]),
            block(8, 14, vec![module("hopper_1", "weight", ModuleKind::Weight, 14)]),
        ],
    })
    .expect("schema")
}

fn fields(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
    pairs
        .iter()
        .map(|(name, value)| (name.to_string(), *value))
        .collect()
}

/// 每个块返回固定字节，可按块注入失败；称重块可按脚本逐次返回。
#[derive(Clone, Default)]
struct FieldScript {
    blocks: Arc<Mutex<HashMap<u16, Vec<u8>>>>,
    queued: Arc<Mutex<HashMap<u16, VecDeque<Vec<u8>>>>>,
    failing: Arc<Mutex<HashSet<u16>>>,
}

impl FieldScript {
    fn set_block(&self, block_id: u16, bytes: Vec<u8>) {
        self.blocks.lock().expect("lock").insert(block_id, bytes);
    }

    fn queue_block(&self, block_id: u16, bytes: Vec<u8>) {
        self.queued
            .lock()
            .expect("lock")
            .entry(block_id)
            .or_default()
            .push_back(bytes);
    }

    fn fail(&self, block_id: u16, failing: bool) {
        let mut set = self.failing.lock().expect("lock");
        if failing {
            set.insert(block_id);
        } else {
            set.remove(&block_id);
        }
    }
}

struct ScriptTransport {
    script: FieldScript,
}

#[async_trait]
impl BlockTransport for ScriptTransport {
    async fn open(&mut self) -> Result<(), LinkError> {
        Ok(())
    }

    async fn read_block(
        &mut self,
        block_id: u16,
        start: u32,
        length: usize,
    ) -> Result<Vec<u8>, LinkError> {
        if self.script.failing.lock().expect("lock").contains(&block_id) {
            return Err(LinkError::AddressOutOfRange {
                block_id,
                start,
                length,
            });
        }
        if let Some(bytes) = self
            .script
            .queued
            .lock()
            .expect("lock")
            .get_mut(&block_id)
            .and_then(VecDeque::pop_front)
        {
            return Ok(bytes);
        }
        Ok(self
            .script
            .blocks
            .lock()
            .expect("lock")
            .get(&block_id)
            .cloned()
            .unwrap_or_else(|| vec![0; length]))
    }

    async fn close(&mut self) {}

    fn endpoint(&self) -> String {
        "script".to_string()
    }
}

#[derive(Default)]
struct CollectingSink {
    samples: Mutex<Vec<PhysicalSample>>,
}

impl CollectingSink {
    fn take(&self) -> Vec<PhysicalSample> {
        std::mem::take(&mut *self.samples.lock().expect("lock"))
    }
}

#[async_trait]
impl SampleSink for CollectingSink {
    fn name(&self) -> &'static str {
        "collect"
    }

    async fn publish(&self, sample: PhysicalSample) -> Result<(), IngestError> {
        self.samples.lock().expect("lock").push(sample);
        Ok(())
    }
}

fn fast_link(script: &FieldScript) -> ConnectionManager {
    ConnectionManager::new(
        Box::new(ScriptTransport {
            script: script.clone(),
        }),
        LinkConfig {
            connect_timeout_ms: 100,
            read_timeout_ms: 100,
            reconnect_attempts: 1,
            backoff_initial_ms: 1,
            backoff_max_ms: 1,
        },
    )
}

fn seed_blocks(script: &FieldScript, schema: &ValidatedSchema) {
    let mut values = HashMap::new();
    values.insert("temp".to_string(), fields(&[("Temperature", 8505.0)]));
    script.set_block(1, encode_block(schema.block(1).expect("block 1"), &values));

    let mut values = HashMap::new();
    values.insert(
        "flow".to_string(),
        fields(&[("RtFlow", 120_000.0), ("TotalFlow", 42.0), ("TotalFlowMilli", 500.0)]),
    );
    script.set_block(2, encode_block(schema.block(2).expect("block 2"), &values));

    let mut values = HashMap::new();
    values.insert("weight".to_string(), fields(&[("NetWeight", 1500.0)]));
    script.set_block(8, encode_block(schema.block(8).expect("block 8"), &values));
}

fn modules_of(samples: &[PhysicalSample]) -> Vec<String> {
    let mut ids: Vec<String> = samples.iter().map(|s| s.module_id.clone()).collect();
    ids.sort();
    ids
}

#[tokio::test]
async fn failing_block_does_not_block_others() {
    let schema = three_block_schema();
    let script = FieldScript::default();
    seed_blocks(&script, &schema);
    script.fail(2, true);

    let sink = Arc::new(CollectingSink::default());
    let mut orchestrator = PollOrchestrator::new(
        fast_link(&script),
        schema,
        UnitConverter::new(FeedRateConfig::default()),
        vec![sink.clone()],
        PollConfig {
            interval: Duration::from_millis(10),
            degraded_interval: Duration::from_millis(50),
            degraded_after: 10,
        },
    );

    for cycle in 0..5 {
        let report = orchestrator.poll_once_at(1000 + cycle * 5000).await;
        assert_eq!(report.blocks_ok, 2);
        assert_eq!(report.failed_blocks, vec![2]);
        assert_eq!(modules_of(&sink.take()), vec!["temp", "weight"]);
    }
    assert_eq!(orchestrator.state(), PollState::Polling);

    script.fail(2, false);
    let report = orchestrator.poll_once_at(30_000).await;
    assert_eq!(report.blocks_failed, 0);
    let samples = sink.take();
    assert_eq!(modules_of(&samples), vec!["flow", "temp", "weight"]);

    let flow = samples
        .iter()
        .find(|s| s.module_id == "flow")
        .expect("flow sample");
    assert!((flow.field("flow_rate").expect("flow_rate") - 7.2).abs() < 1e-9);
    assert!((flow.field("total_flow").expect("total_flow") - 42.5).abs() < 1e-9);
    let temp = samples
        .iter()
        .find(|s| s.module_id == "temp")
        .expect("temp sample");
    assert!((temp.field("temperature").expect("temperature") - 850.5).abs() < 1e-9);
}

#[tokio::test]
async fn consecutive_failures_enter_degraded_and_recover() {
    let schema = validate_schema(DeviceSchema {
        blocks: vec![block(
            1,
            2,
            vec![module("kiln_1", "temp", ModuleKind::Temperature, 2)],
        )],
    })
    .expect("schema");
    let script = FieldScript::default();
    script.fail(1, true);

    let mut orchestrator = PollOrchestrator::new(
        fast_link(&script),
        schema,
        UnitConverter::new(FeedRateConfig::default()),
        Vec::new(),
        PollConfig {
            interval: Duration::from_millis(10),
            degraded_interval: Duration::from_millis(50),
            degraded_after: 3,
        },
    );
    assert_eq!(orchestrator.state(), PollState::Idle);

    for _ in 0..2 {
        orchestrator.poll_once().await;
    }
    assert_eq!(orchestrator.state(), PollState::Polling);
    assert_eq!(orchestrator.current_interval(), Duration::from_millis(10));

    orchestrator.poll_once().await;
    assert_eq!(orchestrator.state(), PollState::Degraded);
    assert_eq!(orchestrator.current_interval(), Duration::from_millis(50));

    script.fail(1, false);
    orchestrator.poll_once().await;
    assert_eq!(orchestrator.state(), PollState::Polling);
}

#[tokio::test]
async fn hopper_feed_rate_from_two_reads() {
    let schema = validate_schema(DeviceSchema {
        blocks: vec![block(
            8,
            14,
            vec![module("hopper_1", "weight", ModuleKind::Weight, 14)],
        )],
    })
    .expect("schema");
    let weigh_block = schema.block(8).expect("block 8").clone();
    let script = FieldScript::default();
    for weight in [1691.11, 1660.0] {
        let mut values = HashMap::new();
        values.insert("weight".to_string(), fields(&[("NetWeight", weight)]));
        script.queue_block(8, encode_block(&weigh_block, &values));
    }

    let sink = Arc::new(CollectingSink::default());
    let mut orchestrator = PollOrchestrator::new(
        fast_link(&script),
        schema,
        UnitConverter::new(FeedRateConfig {
            window_size: 2,
            recompute_interval: 1,
        }),
        vec![sink.clone()],
        PollConfig::default(),
    );

    let t0 = 1_700_000_000_000;
    orchestrator.poll_once_at(t0).await;
    orchestrator.poll_once_at(t0 + 5000).await;

    let samples = sink.take();
    assert_eq!(samples.len(), 2);
    assert_eq!(samples[0].field("feed_rate"), Some(0.0));
    assert!((samples[0].field("weight").expect("weight") - 1691.11).abs() < 1e-3);
    let rate = samples[1].field("feed_rate").expect("feed_rate");
    assert!((rate - 6.222).abs() < 0.01, "rate = {rate}");
    assert!(samples.iter().all(|s| s.valid));
}

#[tokio::test(start_paused = true)]
async fn run_stops_on_cancel_and_drops_sinks() {
    let schema = three_block_schema();
    let script = FieldScript::default();
    seed_blocks(&script, &schema);

    let sink = Arc::new(CollectingSink::default());
    let mut orchestrator = PollOrchestrator::new(
        fast_link(&script),
        schema,
        UnitConverter::new(FeedRateConfig::default()),
        vec![sink.clone()],
        PollConfig {
            interval: Duration::from_millis(100),
            ..PollConfig::default()
        },
    );
    let status = orchestrator.watch_link_status();
    assert!(!status.borrow().connected);
    let cancel = tokio_util::sync::CancellationToken::new();
    let task = tokio::spawn(orchestrator.run(cancel.clone()));

    tokio::time::sleep(Duration::from_millis(350)).await;
    cancel.cancel();
    let mut orchestrator = task.await.expect("join");

    assert_eq!(orchestrator.state(), PollState::Idle);
    assert!(orchestrator.link_status().connected);
    assert_eq!(Arc::strong_count(&sink), 1);
    let published = sink.take().len();
    assert!(published >= 9, "published = {published}");

    assert!(status.borrow().connected);
    assert!(status.borrow().last_read_ms.is_some());

    orchestrator.release_link().await;
    assert!(!orchestrator.link_status().connected);
    assert!(!status.borrow().connected);
}
