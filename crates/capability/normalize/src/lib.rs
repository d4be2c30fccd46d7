//! 单位换算：原始字段 -> 物理量。
//!
//! 除称重外均为无状态换算；称重模块按 `(device_id, module_id)` 持有
//! [`ConverterState`]，首个样本到达时惰性创建。称重样本除重量与下料速率外，
//! 还输出累计投料量 `feeding_total` 与上料标记 `loading`（0/1）。

mod feed_rate;
mod feeding;

pub use feed_rate::{FeedRateConfig, FeedRateWindow};
pub use feeding::{
    DEAD_ZONE_KG, FeedingTracker, FeedingUpdate, LOADING_DEBOUNCE, LoadingEvent, LoadingRecord,
};

use domain::{DeviceModule, ModuleKey, ModuleKind, PhysicalSample, RawSample};
use std::collections::{BTreeMap, HashMap};

/// 电表默认互感器变比。
pub const DEFAULT_CT_RATIO: f64 = 20.0;
/// 绝对零度（°C）。
pub const ABSOLUTE_ZERO_C: f64 = -273.15;

const VOLTAGE_SCALE: f64 = 0.1;
const CURRENT_SCALE: f64 = 0.001;
const POWER_SCALE: f64 = 0.0001;
const TEMPERATURE_SCALE: f64 = 0.1;

/// 换算结果越界（样本仍然输出，但标记为无效）。
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConversionAnomaly {
    #[error("non-finite value in field {0}")]
    NonFinite(String),
    #[error("temperature {0} below absolute zero")]
    BelowAbsoluteZero(f64),
}

/// 单次换算输出。
#[derive(Debug, Clone)]
pub struct Converted {
    pub sample: PhysicalSample,
    pub anomaly: Option<ConversionAnomaly>,
    /// 本次称重样本触发的上料状态迁移。
    pub loading_event: Option<LoadingEvent>,
}

/// 单模块保留状态。
#[derive(Debug, Clone)]
pub struct ConverterState {
    pub last_weight: Option<f64>,
    pub last_ts_ms: Option<i64>,
    pub feeding: FeedingTracker,
}

impl ConverterState {
    pub fn new(config: FeedRateConfig) -> Self {
        Self {
            last_weight: None,
            last_ts_ms: None,
            feeding: FeedingTracker::new(config),
        }
    }

    pub fn window(&self) -> &FeedRateWindow {
        self.feeding.window()
    }
}

/// 换算器：持有所有称重模块的状态，仅由轮询任务调用。
#[derive(Debug, Default)]
pub struct UnitConverter {
    feed_rate: FeedRateConfig,
    states: HashMap<ModuleKey, ConverterState>,
}

impl UnitConverter {
    pub fn new(feed_rate: FeedRateConfig) -> Self {
        Self {
            feed_rate,
            states: HashMap::new(),
        }
    }

    pub fn convert(&mut self, module: &DeviceModule, raw: &RawSample) -> Converted {
        if module.kind != ModuleKind::Weight {
            return convert_stateless(module, raw);
        }
        let config = self.feed_rate;
        let state = self
            .states
            .entry(ModuleKey::new(raw.device_id.clone(), raw.module_id.clone()))
            .or_insert_with(|| ConverterState::new(config));
        convert_with_state(module, raw, state)
    }

    pub fn state(&self, key: &ModuleKey) -> Option<&ConverterState> {
        self.states.get(key)
    }

    pub fn tracked_modules(&self) -> usize {
        self.states.len()
    }
}

/// 带状态换算。非称重模块忽略 `state`。
pub fn convert_with_state(
    module: &DeviceModule,
    raw: &RawSample,
    state: &mut ConverterState,
) -> Converted {
    if module.kind != ModuleKind::Weight {
        return convert_stateless(module, raw);
    }
    let weight = current_weight(raw);
    let update = if weight.is_finite() {
        state.last_weight = Some(weight);
        state.last_ts_ms = Some(raw.ts_ms);
        state.feeding.push(weight, raw.ts_ms)
    } else {
        state.feeding.current()
    };
    let mut fields = BTreeMap::new();
    fields.insert("weight".to_string(), weight);
    fields.insert("feed_rate".to_string(), update.feed_rate);
    fields.insert("feeding_total".to_string(), update.feeding_total);
    fields.insert("loading".to_string(), f64::from(u8::from(update.loading)));
    let mut converted = finish(module, raw, fields);
    converted.loading_event = update.event;
    converted
}

fn convert_stateless(module: &DeviceModule, raw: &RawSample) -> Converted {
    let get = |name: &str| raw.field(name).unwrap_or(f64::NAN);
    let mut fields = BTreeMap::new();
    match module.kind {
        ModuleKind::Meter => {
            let ratio = module.ct_ratio.unwrap_or(DEFAULT_CT_RATIO);
            fields.insert("power".to_string(), get("Pt") * POWER_SCALE * ratio);
            fields.insert("energy".to_string(), get("ImpEp") * ratio);
            for (phase, suffix) in ["a", "b", "c"].iter().enumerate() {
                fields.insert(
                    format!("voltage_{suffix}"),
                    get(&format!("Ua_{phase}")) * VOLTAGE_SCALE,
                );
                fields.insert(
                    format!("current_{suffix}"),
                    get(&format!("I_{phase}")) * CURRENT_SCALE * ratio,
                );
            }
        }
        ModuleKind::Temperature => {
            fields.insert(
                "temperature".to_string(),
                get("Temperature") * TEMPERATURE_SCALE,
            );
        }
        ModuleKind::Flow => {
            // L/min -> m³/h
            let litres_per_minute = get("RtFlow") * 0.001;
            fields.insert("flow_rate".to_string(), litres_per_minute * 60.0 / 1000.0);
            fields.insert(
                "total_flow".to_string(),
                get("TotalFlow") + get("TotalFlowMilli") / 1000.0,
            );
        }
        ModuleKind::DigitalStatus => {
            fields.insert("done".to_string(), get("done"));
            fields.insert("busy".to_string(), raw.field("busy").unwrap_or(0.0));
            fields.insert("error".to_string(), get("error"));
            fields.insert("status_code".to_string(), get("status_code"));
        }
        ModuleKind::Weight => {
            fields.insert("weight".to_string(), current_weight(raw));
            fields.insert("feed_rate".to_string(), 0.0);
            fields.insert("feeding_total".to_string(), 0.0);
            fields.insert("loading".to_string(), 0.0);
        }
    }
    finish(module, raw, fields)
}

/// 高精度净重为 0 时回落到整数净重字段。
fn current_weight(raw: &RawSample) -> f64 {
    let precise = raw.field("NetWeight").unwrap_or(f64::NAN);
    match raw.field("NetWeight_W") {
        Some(fallback) if precise == 0.0 => fallback,
        _ => precise,
    }
}

fn finish(module: &DeviceModule, raw: &RawSample, fields: BTreeMap<String, f64>) -> Converted {
    let anomaly = check_domain(module.kind, &fields);
    Converted {
        sample: PhysicalSample {
            device_id: raw.device_id.clone(),
            module_id: raw.module_id.clone(),
            device_type: module.device_type.clone(),
            kind: module.kind,
            ts_ms: raw.ts_ms,
            fields,
            valid: anomaly.is_none(),
        },
        anomaly,
        loading_event: None,
    }
}

fn check_domain(kind: ModuleKind, fields: &BTreeMap<String, f64>) -> Option<ConversionAnomaly> {
    if let Some((name, _)) = fields.iter().find(|(_, value)| !value.is_finite()) {
        return Some(ConversionAnomaly::NonFinite(name.clone()));
    }
    if kind == ModuleKind::Temperature {
        let temperature = fields.get("temperature").copied().unwrap_or_default();
        if temperature < ABSOLUTE_ZERO_C {
            return Some(ConversionAnomaly::BelowAbsoluteZero(temperature));
        }
    }
    None
}
