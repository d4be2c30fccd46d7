//! # 帧编解码
//!
//! 纯函数：按 [`DeviceModule`] 的字段表把一段大端二进制记录解码为 [`RawSample`]，
//! 或把原始字段编码回字节（自检与模拟模式使用）。无状态、无 I/O。
//!
//! - 多字节整数与浮点一律大端
//! - 布尔位以 (字节偏移, 位序号) 寻址，位 0 为最低位
//! - 长度不匹配属于配置错误，只在 [`validate_schema`] 阶段报告

mod error;
mod layout;
mod schema;

pub use error::DecodeConfigError;
pub use layout::{default_layout, required_fields};
pub use schema::{ValidatedSchema, validate_schema};

use domain::{BlockSchema, DeviceModule, FieldSpec, FieldType, RawSample};
use std::collections::{BTreeMap, HashMap};

/// 从整块字节中截取模块区域。块长度不足时返回 `None`。
pub fn module_slice<'a>(block: &'a [u8], module: &DeviceModule) -> Option<&'a [u8]> {
    let end = module.byte_offset.checked_add(module.byte_length)?;
    block.get(module.byte_offset..end)
}

/// 解码单个模块。
///
/// 对已校验的 schema 与等长字节不会失败；越界读取得到 NaN，由换算阶段标记为无效。
pub fn decode(module: &DeviceModule, bytes: &[u8], ts_ms: i64) -> RawSample {
    let raw_fields = module
        .fields
        .iter()
        .map(|field| (field.name.clone(), read_field(bytes, field)))
        .collect();
    RawSample {
        device_id: module.device_id.clone(),
        module_id: module.module_id.clone(),
        kind: module.kind,
        ts_ms,
        raw_fields,
    }
}

/// 编码单个模块，输出长度恒为 `byte_length`。缺失字段按 0 写入。
pub fn encode(module: &DeviceModule, raw_fields: &BTreeMap<String, f64>) -> Vec<u8> {
    let mut bytes = vec![0u8; module.byte_length];
    for field in &module.fields {
        let value = raw_fields.get(&field.name).copied().unwrap_or(0.0);
        write_field(&mut bytes, field, value);
    }
    bytes
}

/// 按块布局拼装整块字节，未出现在 `values` 中的模块保持全 0。
pub fn encode_block(
    block: &BlockSchema,
    values: &HashMap<String, BTreeMap<String, f64>>,
) -> Vec<u8> {
    let mut bytes = vec![0u8; block.size];
    for module in &block.modules {
        let Some(raw_fields) = values.get(&module.module_id) else {
            continue;
        };
        let encoded = encode(module, raw_fields);
        let end = module.byte_offset + encoded.len();
        if let Some(target) = bytes.get_mut(module.byte_offset..end) {
            target.copy_from_slice(&encoded);
        }
    }
    bytes
}

fn read_array<const N: usize>(bytes: &[u8], start: usize) -> Option<[u8; N]> {
    let end = start.checked_add(N)?;
    bytes.get(start..end)?.try_into().ok()
}

fn read_field(bytes: &[u8], field: &FieldSpec) -> f64 {
    let offset = field.offset;
    let value = match field.field_type {
        FieldType::Int16 => read_array::<2>(bytes, offset).map(|b| i16::from_be_bytes(b) as f64),
        FieldType::UInt16 => read_array::<2>(bytes, offset).map(|b| u16::from_be_bytes(b) as f64),
        FieldType::Int32 => read_array::<4>(bytes, offset).map(|b| i32::from_be_bytes(b) as f64),
        FieldType::UInt32 => read_array::<4>(bytes, offset).map(|b| u32::from_be_bytes(b) as f64),
        FieldType::Real32 => read_array::<4>(bytes, offset).map(|b| f32::from_be_bytes(b) as f64),
        FieldType::Bool { bit } => bytes
            .get(offset)
            .map(|byte| f64::from((byte >> (bit & 7)) & 1)),
    };
    value.unwrap_or(f64::NAN)
}

fn write_field(bytes: &mut [u8], field: &FieldSpec, value: f64) {
    let offset = field.offset;
    match field.field_type {
        FieldType::Int16 => put(bytes, offset, &(value.round() as i16).to_be_bytes()),
        FieldType::UInt16 => put(bytes, offset, &(value.round() as u16).to_be_bytes()),
        FieldType::Int32 => put(bytes, offset, &(value.round() as i32).to_be_bytes()),
        FieldType::UInt32 => put(bytes, offset, &(value.round() as u32).to_be_bytes()),
        FieldType::Real32 => put(bytes, offset, &(value as f32).to_be_bytes()),
        FieldType::Bool { bit } => {
            if let Some(byte) = bytes.get_mut(offset) {
                let mask = 1u8 << (bit & 7);
                if value != 0.0 {
                    *byte |= mask;
                } else {
                    *byte &= !mask;
                }
            }
        }
    }
}

fn put(bytes: &mut [u8], offset: usize, encoded: &[u8]) {
    if let Some(target) = bytes.get_mut(offset..offset + encoded.len()) {
        target.copy_from_slice(encoded);
    }
}
