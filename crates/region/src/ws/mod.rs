/// 机架控制器 WebSocket 模块

pub mod handler;
pub mod rack_manager;

pub use handler::handle_rack_websocket;
pub use rack_manager::RackConnectionManager;
