/// 控制器节点与 DHCP 主备对模型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::network::VlanId;

/// 控制器角色
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ControllerRole {
    Rack,
    Region,
    #[serde(rename = "rack+region")]
    RackAndRegion,
}

impl ControllerRole {
    pub fn is_rack(&self) -> bool {
        matches!(self, ControllerRole::Rack | ControllerRole::RackAndRegion)
    }

    pub fn is_region(&self) -> bool {
        matches!(self, ControllerRole::Region | ControllerRole::RackAndRegion)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ControllerRole::Rack => "rack",
            ControllerRole::Region => "region",
            ControllerRole::RackAndRegion => "rack+region",
        }
    }
}

/// 控制器上运行的服务
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ControllerService {
    Dhcp,
    Dns,
    Ntp,
    Proxy,
    PowerControlAgent,
}

/// 控制器节点
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControllerNode {
    pub system_id: String,
    pub hostname: String,
    pub role: ControllerRole,
    /// RPC 端点（区域控制器填写，例如 ws://10.0.0.2:5250/ws/rack）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpc_endpoint: Option<String>,
    #[serde(default)]
    pub services: BTreeSet<ControllerService>,
    /// 该节点接入的 VLAN
    #[serde(default)]
    pub vlans: BTreeSet<VlanId>,
    pub last_heartbeat: DateTime<Utc>,
    pub online: bool,
}

/// 主备复制状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ReplicationState {
    InSync,
    Diverged,
}

/// VLAN 的 DHCP 主备对
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailoverPeering {
    pub vlan_id: VlanId,
    pub primary: String,
    pub secondary: String,
    /// 主控负责的哈希桶比例，255 表示主控应答全部请求
    pub split: u8,
    pub replication: ReplicationState,
}

/// 机架在某个 VLAN 上的 DHCP 角色
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DhcpRole {
    Primary,
    Secondary,
}
