//! Handlers 模块

pub mod health;
pub mod ws;

pub use health::*;
pub use ws::*;
