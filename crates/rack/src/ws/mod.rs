/// WebSocket 客户端模块
///
/// 机架控制器通过 WebSocket 连接到每个区域控制器

pub mod client;
pub mod handler;
pub mod pool;
pub mod relay;

pub use client::RegionClient;
pub use handler::RackHandlers;
pub use pool::RegionPool;
pub use relay::{RegionMachineDirectory, RegionRelay};
