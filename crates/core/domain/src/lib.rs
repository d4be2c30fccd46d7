pub mod data;
pub mod schema;

pub use data::{Channel, ModuleKey, PhysicalSample, RawSample};
pub use schema::{BlockSchema, DeviceModule, DeviceSchema, FieldSpec, FieldType, ModuleKind};

/// 当前 Unix 毫秒时间戳。
pub fn now_epoch_ms() -> i64 {
    let now = std::time::SystemTime::now();
    let duration = now
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    duration.as_millis() as i64
}
