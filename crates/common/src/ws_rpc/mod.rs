/// WebSocket RPC 模块
///
/// 区域控制器与机架控制器之间基于 WebSocket 的双向 RPC

pub mod client;
pub mod error;
pub mod message;
pub mod server;
pub mod types;

pub use client::WsRpcConnection;
pub use error::{RpcError, RpcErrorCode};
pub use message::{MessageType, RpcMessage};
pub use server::RpcRouter;
pub use types::*;
