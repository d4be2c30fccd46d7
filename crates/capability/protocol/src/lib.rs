//! # 现场链路能力模块
//!
//! 提供对现场控制器的块读取能力：
//! - **ConnectionManager**：独占唯一物理链路，串行读块，断链自动重连（有界指数退避）
//! - **TcpBlockTransport**：会话式 TCP 块协议（见 [`frame`]）
//! - **SimulatedTransport**：模拟模式，按模块类型生成数据并可注入故障
//!
//! ## 架构设计
//!
//! ```text
//! PollOrchestrator
//!       │  read_block(block_id, start, length)
//!       ▼
//! ConnectionManager  ── 超时 / 重连 / 状态统计
//!       │
//!       ├── TcpBlockTransport
//!       └── SimulatedTransport
//! ```

mod error;
pub mod frame;
mod manager;
mod simulated;
mod tcp_link;
mod types;

pub use error::LinkError;
pub use manager::ConnectionManager;
pub use simulated::{SimulatedConfig, SimulatedTransport};
pub use tcp_link::{TcpBlockTransport, TcpLinkConfig};
pub use types::{BlockTransport, LinkConfig, LinkStatus};
