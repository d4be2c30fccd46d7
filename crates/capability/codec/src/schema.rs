//! 加载期 schema 校验。
//!
//! 通过校验的 [`ValidatedSchema`] 保证每个模块区域落在块内、每个字段落在模块内，
//! 因此运行期解码不需要再做长度检查。

use crate::error::DecodeConfigError;
use crate::layout::{default_layout, required_fields};
use domain::{BlockSchema, DeviceModule, DeviceSchema, FieldType};
use std::collections::HashSet;

/// 已校验的 schema。只能通过 [`validate_schema`] 构造。
#[derive(Debug, Clone)]
pub struct ValidatedSchema {
    blocks: Vec<BlockSchema>,
}

impl ValidatedSchema {
    pub fn blocks(&self) -> &[BlockSchema] {
        &self.blocks
    }

    pub fn block(&self, block_id: u16) -> Option<&BlockSchema> {
        self.blocks.iter().find(|block| block.block_id == block_id)
    }

    pub fn modules(&self) -> impl Iterator<Item = (&BlockSchema, &DeviceModule)> {
        self.blocks
            .iter()
            .flat_map(|block| block.modules.iter().map(move |module| (block, module)))
    }
}

/// 校验并补全 schema（空字段表使用默认布局）。
pub fn validate_schema(schema: DeviceSchema) -> Result<ValidatedSchema, DecodeConfigError> {
    let mut block_ids = HashSet::new();
    let mut blocks = Vec::with_capacity(schema.blocks.len());
    for mut block in schema.blocks {
        if block.size == 0 {
            return Err(DecodeConfigError::EmptyBlock(block.block_id));
        }
        if !block_ids.insert(block.block_id) {
            return Err(DecodeConfigError::DuplicateBlock(block.block_id));
        }
        let mut module_ids = HashSet::new();
        for module in &mut block.modules {
            if !module_ids.insert(module.module_id.clone()) {
                return Err(DecodeConfigError::DuplicateModule {
                    block_id: block.block_id,
                    module_id: module.module_id.clone(),
                });
            }
            fill_defaults(module);
            validate_module(block.block_id, block.size, module)?;
        }
        blocks.push(block);
    }
    Ok(ValidatedSchema { blocks })
}

fn fill_defaults(module: &mut DeviceModule) {
    if !module.fields.is_empty() {
        return;
    }
    let (length, fields) = default_layout(module.kind);
    module.fields = fields;
    if module.byte_length == 0 {
        module.byte_length = length;
    }
}

fn validate_module(
    block_id: u16,
    block_size: usize,
    module: &DeviceModule,
) -> Result<(), DecodeConfigError> {
    if module.byte_length == 0 {
        return Err(DecodeConfigError::EmptyModule {
            block_id,
            module_id: module.module_id.clone(),
        });
    }
    let end = module.byte_offset.checked_add(module.byte_length);
    if end.is_none_or(|end| end > block_size) {
        return Err(DecodeConfigError::ModuleOutOfBlock {
            block_id,
            module_id: module.module_id.clone(),
            offset: module.byte_offset,
            length: module.byte_length,
            size: block_size,
        });
    }
    for field in &module.fields {
        let width = field.field_type.width();
        if field
            .offset
            .checked_add(width)
            .is_none_or(|end| end > module.byte_length)
        {
            return Err(DecodeConfigError::FieldOutOfModule {
                block_id,
                module_id: module.module_id.clone(),
                field: field.name.clone(),
                offset: field.offset,
                width,
                length: module.byte_length,
            });
        }
        if let FieldType::Bool { bit } = field.field_type {
            if bit > 7 {
                return Err(DecodeConfigError::InvalidBit {
                    block_id,
                    module_id: module.module_id.clone(),
                    field: field.name.clone(),
                    bit,
                });
            }
        }
    }
    for required in required_fields(module.kind) {
        if !module.fields.iter().any(|field| field.name == *required) {
            return Err(DecodeConfigError::MissingField {
                block_id,
                module_id: module.module_id.clone(),
                field: required,
                kind: module.kind,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::{FieldSpec, ModuleKind};

    fn module(kind: ModuleKind, offset: usize, length: usize) -> DeviceModule {
        DeviceModule {
            module_id: "m1".to_string(),
            device_id: "dev_1".to_string(),
            device_type: "test".to_string(),
            kind,
            byte_offset: offset,
            byte_length: length,
            fields: Vec::new(),
            ct_ratio: None,
        }
    }

    fn schema_with(size: usize, modules: Vec<DeviceModule>) -> DeviceSchema {
        DeviceSchema {
            blocks: vec![BlockSchema {
                block_id: 8,
                name: "test".to_string(),
                size,
                start_offset: 0,
                modules,
            }],
        }
    }

    #[test]
    fn empty_fields_take_default_layout() {
        let schema = validate_schema(schema_with(14, vec![module(ModuleKind::Weight, 0, 0)]))
            .expect("valid");
        let (_, module) = schema.modules().next().expect("module");
        assert_eq!(module.byte_length, 14);
        assert_eq!(module.fields.len(), 5);
    }

    #[test]
    fn module_beyond_block_is_rejected() {
        let err = validate_schema(schema_with(10, vec![module(ModuleKind::Weight, 0, 14)]))
            .expect_err("out of block");
        assert!(matches!(err, DecodeConfigError::ModuleOutOfBlock { .. }));
    }

    #[test]
    fn field_beyond_module_is_rejected() {
        let mut m = module(ModuleKind::Temperature, 0, 2);
        m.fields = vec![FieldSpec::new("Temperature", 1, FieldType::Int16)];
        let err = validate_schema(schema_with(4, vec![m])).expect_err("out of module");
        assert!(matches!(err, DecodeConfigError::FieldOutOfModule { .. }));
    }

    #[test]
    fn bad_bit_index_is_rejected() {
        let mut m = module(ModuleKind::DigitalStatus, 0, 4);
        m.fields = vec![
            FieldSpec::new("done", 0, FieldType::Bool { bit: 0 }),
            FieldSpec::new("error", 0, FieldType::Bool { bit: 8 }),
            FieldSpec::new("status_code", 2, FieldType::UInt16),
        ];
        let err = validate_schema(schema_with(4, vec![m])).expect_err("bad bit");
        assert!(matches!(err, DecodeConfigError::InvalidBit { bit: 8, .. }));
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let mut m = module(ModuleKind::Flow, 0, 10);
        m.fields = vec![FieldSpec::new("RtFlow", 0, FieldType::UInt32)];
        let err = validate_schema(schema_with(10, vec![m])).expect_err("missing");
        assert!(matches!(
            err,
            DecodeConfigError::MissingField {
                field: "TotalFlow",
                ..
            }
        ));
    }

    #[test]
    fn duplicate_module_is_rejected() {
        let err = validate_schema(schema_with(
            8,
            vec![
                module(ModuleKind::Temperature, 0, 2),
                module(ModuleKind::Temperature, 2, 2),
            ],
        ))
        .expect_err("duplicate");
        assert!(matches!(err, DecodeConfigError::DuplicateModule { .. }));
    }
}
