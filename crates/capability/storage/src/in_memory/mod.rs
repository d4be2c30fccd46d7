//! 内存存储实现模块
//!
//! 仅用于测试和未配置外部存储时的占位。
//!
//! 包含以下实现：
//! - HistoricalStore: InMemoryHistoricalStore
//! - FallbackLog: InMemoryFallbackLog

pub mod fallback;
pub mod historical;

pub use fallback::*;
pub use historical::*;
