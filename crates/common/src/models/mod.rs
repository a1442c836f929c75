/// 共享数据模型
///
/// 定义区域控制器与机架控制器共享的数据结构

pub mod controller;
pub mod lease;
pub mod network;
pub mod power;

pub use controller::*;
pub use lease::*;
pub use network::*;
pub use power::*;

/// 常量定义
pub mod constants {
    /// 默认区域控制器 RPC 端口（5250-5270）
    pub const DEFAULT_REGION_PORT: u16 = 5250;

    /// 区域控制器 RPC 端口上限
    pub const MAX_REGION_PORT: u16 = 5270;

    /// DHCP 服务端口
    pub const DHCP_SERVER_PORT: u16 = 67;

    /// DHCP 客户端端口
    pub const DHCP_CLIENT_PORT: u16 = 68;

    /// 默认心跳间隔（秒）
    pub const DEFAULT_HEARTBEAT_INTERVAL: u64 = 30;

    /// 默认心跳丢失次数阈值
    pub const DEFAULT_HEARTBEAT_MISS_THRESHOLD: u32 = 3;

    /// 默认租约时长（秒）
    pub const DEFAULT_LEASE_TIME: u64 = 600;

    /// 默认 OFFER 保留时长（秒）
    pub const DEFAULT_OFFER_TIMEOUT: u64 = 60;

    /// 冲突地址隔离时长（秒）
    pub const CONFLICT_QUARANTINE: u64 = 3600;

    /// 默认主备 split：主控应答全部请求
    pub const DEFAULT_FAILOVER_SPLIT: u8 = 255;

    /// 默认 max-response-delay（秒）
    pub const DEFAULT_MAX_RESPONSE_DELAY: u64 = 60;

    /// 默认 max-unacked-updates
    pub const DEFAULT_MAX_UNACKED_UPDATES: usize = 10;

    /// 默认 load-balance-max-seconds
    pub const DEFAULT_LOAD_BALANCE_MAX_SECONDS: u16 = 3;

    /// 电源操作硬超时（秒）
    pub const DEFAULT_POWER_TIMEOUT: u64 = 60;

    /// 查询等待进行中的电源变更的时长（秒）
    pub const DEFAULT_POWER_QUERY_WAIT: u64 = 30;
}
