/// 区域控制器与机架控制器之间的 RPC 消息类型

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::models::{
    ControllerRole, ControllerService, DhcpRole, Machine, MacAddress, PowerAction,
    PowerParameters, PowerState, PowerType, SubnetId, TopologySnapshot, VlanId,
};
use crate::settings::ClusterSettings;

/// RPC 方法名
pub mod methods {
    // 机架 -> 区域
    pub const REGISTER: &str = "register";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const RELAY_LEASE_UPDATE: &str = "relay_lease_update";
    pub const RELAY_FULL_SYNC: &str = "relay_full_sync";
    pub const RELAY_PEER_PING: &str = "relay_peer_ping";
    pub const GET_BOOT_MACHINE: &str = "get_boot_machine";

    // 区域 -> 机架
    pub const CONFIGURE_DHCP: &str = "configure_dhcp";
    pub const POWER_ACTION: &str = "power_action";
    pub const APPLY_LEASE_UPDATE: &str = "apply_lease_update";
    pub const APPLY_FULL_SYNC: &str = "apply_full_sync";
    pub const PEER_PING: &str = "peer_ping";
    pub const RPC_PLAN: &str = "rpc_plan";
}

// ============================================================================
// 注册与心跳
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub system_id: String,
    pub hostname: String,
    pub role: ControllerRole,
    #[serde(default)]
    pub services: BTreeSet<ControllerService>,
    /// 机架接入的 VLAN
    #[serde(default)]
    pub vlans: BTreeSet<VlanId>,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub accepted: bool,
    /// 应答的区域控制器
    pub region_id: String,
    pub heartbeat_interval: u64,
    pub topology: TopologySnapshot,
    pub settings: ClusterSettings,
    #[serde(default)]
    pub dhcp: Vec<VlanDhcpConfig>,
    /// 按优先级排序的区域控制器 RPC 端点
    #[serde(default)]
    pub rpc_plan: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatNotification {
    pub system_id: String,
    pub timestamp: i64,
    #[serde(default)]
    pub vlans: BTreeSet<VlanId>,
}

/// 区域控制器推送给机架的 RPC 计划
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcPlanNotification {
    pub regions: Vec<String>,
}

// ============================================================================
// DHCP 配置
// ============================================================================

/// 某个 VLAN 上本机架的 DHCP 配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VlanDhcpConfig {
    pub vlan_id: VlanId,
    pub enabled: bool,
    pub role: DhcpRole,
    /// 对端机架，None 表示单机模式
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partner: Option<String>,
    pub split: u8,
    #[serde(default)]
    pub subnets: Vec<SubnetId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigureDhcpRequest {
    pub topology: TopologySnapshot,
    pub settings: ClusterSettings,
    pub vlans: Vec<VlanDhcpConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigureDhcpResponse {
    pub configured: Vec<VlanId>,
}

// ============================================================================
// 租约复制（经区域控制器中转）
// ============================================================================

/// 机架之间经区域控制器中转的消息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerEnvelope<T> {
    pub from: String,
    pub to: String,
    pub body: T,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerPing {
    pub vlan_id: VlanId,
    /// 发送方最新的复制序号
    pub seq: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerPong {
    pub vlan_id: VlanId,
    pub state: String,
    pub applied_seq: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FullSyncAck {
    pub vlan_id: VlanId,
    pub merged: usize,
    pub applied_seq: u64,
}

// ============================================================================
// 电源控制
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerActionRequest {
    pub machine_id: String,
    pub action: PowerAction,
    pub power_type: PowerType,
    #[serde(default)]
    pub parameters: PowerParameters,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerActionResponse {
    pub machine_id: String,
    pub power_state: PowerState,
}

// ============================================================================
// 引导
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetBootMachineRequest {
    pub mac_address: MacAddress,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetBootMachineResponse {
    #[serde(default)]
    pub machine: Option<Machine>,
}
