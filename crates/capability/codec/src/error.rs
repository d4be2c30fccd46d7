//! schema 校验错误（仅在加载时出现，运行期解码不会失败）。

use domain::ModuleKind;

#[derive(Debug, thiserror::Error)]
pub enum DecodeConfigError {
    #[error("block {0}: size must be positive")]
    EmptyBlock(u16),

    #[error("duplicate block id {0}")]
    DuplicateBlock(u16),

    #[error("block {block_id}: duplicate module {module_id}")]
    DuplicateModule { block_id: u16, module_id: String },

    #[error("block {block_id} module {module_id}: zero-length module")]
    EmptyModule { block_id: u16, module_id: String },

    #[error(
        "block {block_id} module {module_id}: region {offset}+{length} exceeds block size {size}"
    )]
    ModuleOutOfBlock {
        block_id: u16,
        module_id: String,
        offset: usize,
        length: usize,
        size: usize,
    },

    #[error(
        "block {block_id} module {module_id}: field {field} at {offset}+{width} exceeds module length {length}"
    )]
    FieldOutOfModule {
        block_id: u16,
        module_id: String,
        field: String,
        offset: usize,
        width: usize,
        length: usize,
    },

    #[error("block {block_id} module {module_id}: field {field} bit index {bit} out of range")]
    InvalidBit {
        block_id: u16,
        module_id: String,
        field: String,
        bit: u8,
    },

    #[error("block {block_id} module {module_id}: missing required field {field} for {kind}")]
    MissingField {
        block_id: u16,
        module_id: String,
        field: &'static str,
        kind: ModuleKind,
    },
}
