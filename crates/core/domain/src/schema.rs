//! 设备模块 schema：数据块内按偏移划分的类型化区域。
//!
//! 启动时加载一次，之后只读；新增设备只需新增配置，不新增代码路径。

use serde::{Deserialize, Serialize};

/// 模块类型，每种类型有固定的输出字段集合。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleKind {
    Meter,
    Temperature,
    Weight,
    Flow,
    DigitalStatus,
}

impl ModuleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleKind::Meter => "meter",
            ModuleKind::Temperature => "temperature",
            ModuleKind::Weight => "weight",
            ModuleKind::Flow => "flow",
            ModuleKind::DigitalStatus => "digital_status",
        }
    }

    /// 换算后输出的字段集合（顺序固定）。
    pub fn output_fields(&self) -> &'static [&'static str] {
        match self {
            ModuleKind::Meter => &[
                "power",
                "energy",
                "voltage_a",
                "voltage_b",
                "voltage_c",
                "current_a",
                "current_b",
                "current_c",
            ],
            ModuleKind::Temperature => &["temperature"],
            ModuleKind::Weight => &["weight", "feed_rate", "feeding_total", "loading"],
            ModuleKind::Flow => &["flow_rate", "total_flow"],
            ModuleKind::DigitalStatus => &["done", "busy", "error", "status_code"],
        }
    }
}

impl std::fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 字段编码类型（全部大端）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldType {
    Int16,
    #[serde(rename = "uint16")]
    UInt16,
    Int32,
    #[serde(rename = "uint32")]
    UInt32,
    Real32,
    Bool { bit: u8 },
}

impl FieldType {
    /// 字段占用的字节数。
    pub fn width(&self) -> usize {
        match self {
            FieldType::Int16 | FieldType::UInt16 => 2,
            FieldType::Int32 | FieldType::UInt32 | FieldType::Real32 => 4,
            FieldType::Bool { .. } => 1,
        }
    }
}

/// 单个原始字段：名称 + 模块内字节偏移 + 编码类型。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub offset: usize,
    #[serde(flatten)]
    pub field_type: FieldType,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, offset: usize, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            offset,
            field_type,
        }
    }
}

/// 设备模块：数据块中的一段命名区域。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceModule {
    pub module_id: String,
    pub device_id: String,
    #[serde(default)]
    pub device_type: String,
    pub kind: ModuleKind,
    pub byte_offset: usize,
    pub byte_length: usize,
    /// 为空时使用该类型的默认布局。
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
    /// 电流互感器变比，仅电表使用。
    #[serde(default)]
    pub ct_ratio: Option<f64>,
}

/// 一个可整体读取的数据块。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockSchema {
    pub block_id: u16,
    #[serde(default)]
    pub name: String,
    /// 每次读取的字节数。
    pub size: usize,
    #[serde(default)]
    pub start_offset: u32,
    pub modules: Vec<DeviceModule>,
}

/// 整站设备 schema。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceSchema {
    pub blocks: Vec<BlockSchema>,
}

impl DeviceSchema {
    pub fn module_count(&self) -> usize {
        self.blocks.iter().map(|block| block.modules.len()).sum()
    }
}
