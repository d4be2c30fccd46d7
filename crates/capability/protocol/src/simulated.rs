//! 模拟模式传输
//!
//! 不连接现场设备，按模块类型生成合理的伪随机数据，并经帧编码器写成与真实控制器
//! 相同的块字节，下游解码/换算无需区分数据来源。

use crate::error::LinkError;
use crate::types::BlockTransport;
use async_trait::async_trait;
use domain::{BlockSchema, ModuleKind};
use kiln_codec::{ValidatedSchema, encode_block};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, HashMap};

/// 模拟模式配置
#[derive(Debug, Clone, Default)]
pub struct SimulatedConfig {
    /// 数字状态字段的故障注入概率（0.0 ~ 1.0）
    pub error_rate: f64,
    /// 固定随机种子（便于复现）
    pub seed: Option<u64>,
}

/// 需要跨读取保持的模拟量（料斗余量、累计量等）。
#[derive(Debug, Clone, Default)]
struct ModuleSimState {
    weight: f64,
    energy: f64,
    total_flow: f64,
    temperature: f64,
}

pub struct SimulatedTransport {
    blocks: HashMap<u16, BlockSchema>,
    error_rate: f64,
    rng: StdRng,
    states: HashMap<String, ModuleSimState>,
    open: bool,
}

impl SimulatedTransport {
    pub fn new(schema: &ValidatedSchema, config: SimulatedConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            blocks: schema
                .blocks()
                .iter()
                .map(|block| (block.block_id, block.clone()))
                .collect(),
            error_rate: config.error_rate.clamp(0.0, 1.0),
            rng,
            states: HashMap::new(),
            open: false,
        }
    }

    fn generate_block(&mut self, block: &BlockSchema) -> Vec<u8> {
        let mut values = HashMap::new();
        for module in &block.modules {
            let key = format!("{}/{}", module.device_id, module.module_id);
            let state = self.states.entry(key).or_default();
            let fields = generate_module(&mut self.rng, module.kind, state, self.error_rate);
            values.insert(module.module_id.clone(), fields);
        }
        encode_block(block, &values)
    }
}

fn generate_module(
    rng: &mut StdRng,
    kind: ModuleKind,
    state: &mut ModuleSimState,
    error_rate: f64,
) -> BTreeMap<String, f64> {
    let mut fields = BTreeMap::new();
    match kind {
        ModuleKind::Meter => {
            let pt: f64 = rng.gen_range(20_000.0..60_000.0);
            state.energy += rng.gen_range(1.0..5.0_f64);
            for phase in 0..3 {
                fields.insert(format!("Uab_{phase}"), rng.gen_range(3800.0..4000.0));
                fields.insert(format!("Ua_{phase}"), rng.gen_range(2200.0..2400.0));
                fields.insert(format!("I_{phase}"), rng.gen_range(500.0..2000.0));
            }
            fields.insert("Pt".to_string(), pt);
            for name in ["Pa", "Pb", "Pc"] {
                fields.insert(name.to_string(), pt / 3.0);
            }
            fields.insert("ImpEp".to_string(), state.energy.round());
        }
        ModuleKind::Temperature => {
            // 0.1 °C 分辨率，20 ~ 900 °C 之间缓慢游走
            if state.temperature == 0.0 {
                state.temperature = rng.gen_range(200.0..9000.0_f64);
            }
            state.temperature =
                (state.temperature + rng.gen_range(-30.0..30.0_f64)).clamp(200.0, 9000.0);
            fields.insert("Temperature".to_string(), state.temperature.round());
        }
        ModuleKind::Weight => {
            if state.weight < 200.0 {
                state.weight = rng.gen_range(1500.0..2000.0_f64);
            } else {
                state.weight -= rng.gen_range(0.5..3.0_f64);
            }
            let net = state.weight;
            let gross = net + 300.0;
            fields.insert("GrossWeight_W".to_string(), gross.round());
            fields.insert("NetWeight_W".to_string(), net.round());
            fields.insert("StatusWord".to_string(), 0.0);
            fields.insert("GrossWeight".to_string(), gross);
            fields.insert("NetWeight".to_string(), net);
        }
        ModuleKind::Flow => {
            state.total_flow += rng.gen_range(0.05..0.5_f64);
            let whole = state.total_flow.floor();
            fields.insert("RtFlow".to_string(), rng.gen_range(50_000.0..200_000.0_f64).round());
            fields.insert("TotalFlow".to_string(), whole);
            fields.insert(
                "TotalFlowMilli".to_string(),
                ((state.total_flow - whole) * 1000.0).floor(),
            );
        }
        ModuleKind::DigitalStatus => {
            let error = rng.gen_bool(error_rate);
            fields.insert("done".to_string(), f64::from(u8::from(!error && rng.gen_bool(0.5))));
            fields.insert("busy".to_string(), f64::from(u8::from(rng.gen_bool(0.5))));
            fields.insert("error".to_string(), f64::from(u8::from(error)));
            let code: u16 = if error { rng.gen_range(0x8001..0x8100) } else { 0 };
            fields.insert("status_code".to_string(), f64::from(code));
        }
    }
    fields
}

#[async_trait]
impl BlockTransport for SimulatedTransport {
    async fn open(&mut self) -> Result<(), LinkError> {
        self.open = true;
        Ok(())
    }

    async fn read_block(
        &mut self,
        block_id: u16,
        start: u32,
        length: usize,
    ) -> Result<Vec<u8>, LinkError> {
        if !self.open {
            return Err(LinkError::NotConnected);
        }
        let out_of_range = LinkError::AddressOutOfRange {
            block_id,
            start,
            length,
        };
        let Some(block) = self.blocks.get(&block_id).cloned() else {
            return Err(out_of_range);
        };
        let Some(relative) = start.checked_sub(block.start_offset) else {
            return Err(out_of_range);
        };
        let relative = relative as usize;
        let bytes = self.generate_block(&block);
        match bytes.get(relative..relative.saturating_add(length)) {
            Some(slice) => Ok(slice.to_vec()),
            None => Err(out_of_range),
        }
    }

    async fn close(&mut self) {
        self.open = false;
    }

    fn endpoint(&self) -> String {
        "simulated".to_string()
    }
}
