//! SQLite 存储实现模块（本地兜底日志）

pub mod fallback;

pub use fallback::*;
