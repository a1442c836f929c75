use thiserror::Error;

/// 统一错误类型
#[derive(Error, Debug)]
pub enum Error {
    #[error("数据库错误: {0}")]
    Database(String),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("配置错误: {0}")]
    Config(String),

    #[error("资源未找到: {0}")]
    NotFound(String),

    #[error("资源已存在: {0}")]
    AlreadyExists(String),

    #[error("无效参数: {0}")]
    InvalidArgument(String),

    // ------------------------------------------------------------------
    // 租约 / DHCP
    // ------------------------------------------------------------------
    /// 动态地址段已耗尽，需要扩容地址段或等待租约释放
    #[error("子网 {subnet_id} 没有可分配的地址")]
    NoAddressAvailable { subnet_id: i64 },

    #[error("租约不存在: {0}")]
    LeaseNotFound(String),

    /// 复制序号出现缺口，需要全量重同步
    #[error("VLAN {vlan_id} 复制状态分叉: 期望序号 {expected}, 收到 {received}")]
    PeerDiverged {
        vlan_id: i64,
        expected: u64,
        received: u64,
    },

    // ------------------------------------------------------------------
    // 拓扑
    // ------------------------------------------------------------------
    #[error("地址段重叠: {0}")]
    OverlappingRange(String),

    #[error("版本冲突: {entity} 期望版本 {expected}, 当前版本 {actual}")]
    VersionConflict {
        entity: String,
        expected: u64,
        actual: u64,
    },

    #[error("未知的配置项: {0}")]
    UnknownSetting(String),

    // ------------------------------------------------------------------
    // 控制器成员
    // ------------------------------------------------------------------
    /// 节点是某个 VLAN 唯一的 DHCP 主控，且没有可接替的备控
    #[error("机架控制器 {system_id} 是 VLAN {vlans:?} 的 DHCP 主控，无法注销")]
    IsPrimaryRack { system_id: String, vlans: Vec<i64> },

    // ------------------------------------------------------------------
    // 电源控制
    // ------------------------------------------------------------------
    #[error("机器 {0} 已有电源操作正在进行")]
    OperationInProgress(String),

    #[error("BMC 无响应: {0}")]
    PowerTimeout(String),

    #[error("电源操作失败: {0}")]
    PowerFailed(String),

    #[error("网络错误: {0}")]
    Network(String),

    #[error("内部错误: {0}")]
    Internal(String),

    #[error("其他错误: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// 错误码，用于 RPC 与 HTTP 响应
    pub fn code(&self) -> &'static str {
        match self {
            Error::Database(_) => "DATABASE_ERROR",
            Error::Serialization(_) => "SERIALIZATION_ERROR",
            Error::Config(_) => "CONFIG_ERROR",
            Error::NotFound(_) => "NOT_FOUND",
            Error::AlreadyExists(_) => "ALREADY_EXISTS",
            Error::InvalidArgument(_) => "INVALID_ARGUMENT",
            Error::NoAddressAvailable { .. } => "NO_ADDRESS_AVAILABLE",
            Error::LeaseNotFound(_) => "LEASE_NOT_FOUND",
            Error::PeerDiverged { .. } => "PEER_DIVERGED",
            Error::OverlappingRange(_) => "OVERLAPPING_RANGE",
            Error::VersionConflict { .. } => "VERSION_CONFLICT",
            Error::UnknownSetting(_) => "UNKNOWN_SETTING",
            Error::IsPrimaryRack { .. } => "IS_PRIMARY_RACK",
            Error::OperationInProgress(_) => "OPERATION_IN_PROGRESS",
            Error::PowerTimeout(_) => "POWER_TIMEOUT",
            Error::PowerFailed(_) => "POWER_FAILED",
            Error::Network(_) => "NETWORK_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
            Error::Other(_) => "INTERNAL_ERROR",
        }
    }
}

/// 统一结果类型
pub type Result<T> = std::result::Result<T, Error>;
