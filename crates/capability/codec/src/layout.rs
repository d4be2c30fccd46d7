//! 各模块类型的默认字节布局与必需字段。

use domain::{FieldSpec, FieldType, ModuleKind};

const METER_FIELDS: [&str; 14] = [
    "Uab_0", "Uab_1", "Uab_2", "Ua_0", "Ua_1", "Ua_2", "I_0", "I_1", "I_2", "Pt", "Pa", "Pb",
    "Pc", "ImpEp",
];

/// 默认布局：`(模块字节长度, 字段表)`。
pub fn default_layout(kind: ModuleKind) -> (usize, Vec<FieldSpec>) {
    match kind {
        ModuleKind::Meter => {
            let fields = METER_FIELDS
                .iter()
                .enumerate()
                .map(|(index, name)| FieldSpec::new(*name, index * 4, FieldType::Real32))
                .collect();
            (METER_FIELDS.len() * 4, fields)
        }
        ModuleKind::Temperature => (2, vec![FieldSpec::new("Temperature", 0, FieldType::Int16)]),
        ModuleKind::Weight => (
            14,
            vec![
                FieldSpec::new("GrossWeight_W", 0, FieldType::UInt16),
                FieldSpec::new("NetWeight_W", 2, FieldType::UInt16),
                FieldSpec::new("StatusWord", 4, FieldType::UInt16),
                FieldSpec::new("GrossWeight", 6, FieldType::Real32),
                FieldSpec::new("NetWeight", 10, FieldType::Real32),
            ],
        ),
        ModuleKind::Flow => (
            10,
            vec![
                FieldSpec::new("RtFlow", 0, FieldType::UInt32),
                FieldSpec::new("TotalFlow", 4, FieldType::UInt32),
                FieldSpec::new("TotalFlowMilli", 8, FieldType::UInt16),
            ],
        ),
        ModuleKind::DigitalStatus => (
            4,
            vec![
                FieldSpec::new("done", 0, FieldType::Bool { bit: 0 }),
                FieldSpec::new("busy", 0, FieldType::Bool { bit: 1 }),
                FieldSpec::new("error", 0, FieldType::Bool { bit: 2 }),
                FieldSpec::new("status_code", 2, FieldType::UInt16),
            ],
        ),
    }
}

/// 换算所依赖的原始字段。
pub fn required_fields(kind: ModuleKind) -> &'static [&'static str] {
    match kind {
        ModuleKind::Meter => &["Ua_0", "Ua_1", "Ua_2", "I_0", "I_1", "I_2", "Pt", "ImpEp"],
        ModuleKind::Temperature => &["Temperature"],
        ModuleKind::Weight => &["NetWeight"],
        ModuleKind::Flow => &["RtFlow", "TotalFlow", "TotalFlowMilli"],
        ModuleKind::DigitalStatus => &["done", "error", "status_code"],
    }
}
