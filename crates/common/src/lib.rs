/// Easy Metal - 公共库
///
/// 提供区域控制器与机架控制器共享的数据模型、拓扑注册表、集群配置、错误处理和 RPC 框架

pub mod errors;
pub mod models;
pub mod settings;
pub mod topology;
pub mod utils;
pub mod ws_rpc;

pub use errors::{Error, Result};
pub use settings::{ClusterSettings, SettingKey};
pub use topology::SubnetRegistry;
pub use ws_rpc::{MessageType, RpcError, RpcErrorCode, RpcMessage};
