//! PostgreSQL 存储实现模块

pub mod historical;

pub use historical::*;
