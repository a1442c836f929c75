/// DHCP 租约模型与复制消息

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

use super::network::{MacAddress, SubnetId, VlanId};

/// 租约状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum LeaseState {
    Offered,
    Acked,
    Expired,
    Released,
}

impl LeaseState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeaseState::Offered => "OFFERED",
            LeaseState::Acked => "ACKED",
            LeaseState::Expired => "EXPIRED",
            LeaseState::Released => "RELEASED",
        }
    }

    /// 是否占用地址
    pub fn is_active(&self) -> bool {
        matches!(self, LeaseState::Offered | LeaseState::Acked)
    }
}

/// 租约
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Lease {
    /// 冲突标记（DHCPDECLINE）没有 MAC
    pub mac_address: Option<MacAddress>,
    pub ip: Ipv4Addr,
    pub subnet_id: SubnetId,
    pub vlan_id: VlanId,
    pub state: LeaseState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    /// 在给定时刻是否仍占用地址
    pub fn holds_address(&self, now: DateTime<Utc>) -> bool {
        self.state.is_active() && self.expires_at > now
    }

    pub fn is_conflict_marker(&self) -> bool {
        self.mac_address.is_none()
    }
}

/// 租约复制更新（按 VLAN 递增序号）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LeaseUpdate {
    pub vlan_id: VlanId,
    pub seq: u64,
    pub lease: Lease,
}

/// 复制确认
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseUpdateAck {
    pub vlan_id: VlanId,
    /// 接收方已应用的最大连续序号
    pub applied_seq: u64,
}

/// 全量租约表同步
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FullLeaseSync {
    pub vlan_id: VlanId,
    /// 发送方当前序号，接收方以此作为新的复制起点
    pub seq: u64,
    pub leases: Vec<Lease>,
}
