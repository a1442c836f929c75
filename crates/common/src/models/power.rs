/// 机器与电源操作模型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use super::network::{MacAddress, VlanId};
use crate::errors::Error;

/// 电源驱动类型（由 `power_type` 字段选择实现）
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PowerType {
    Ipmi,
    Redfish,
    Virsh,
    Manual,
}

impl PowerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PowerType::Ipmi => "ipmi",
            PowerType::Redfish => "redfish",
            PowerType::Virsh => "virsh",
            PowerType::Manual => "manual",
        }
    }
}

/// 请求的电源动作
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PowerAction {
    On,
    Off,
    Cycle,
    Query,
}

impl PowerAction {
    /// 是否改变电源状态
    pub fn is_change(&self) -> bool {
        !matches!(self, PowerAction::Query)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PowerAction::On => "on",
            PowerAction::Off => "off",
            PowerAction::Cycle => "cycle",
            PowerAction::Query => "query",
        }
    }
}

impl fmt::Display for PowerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PowerAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "on" => Ok(PowerAction::On),
            "off" => Ok(PowerAction::Off),
            "cycle" => Ok(PowerAction::Cycle),
            "query" => Ok(PowerAction::Query),
            other => Err(Error::InvalidArgument(format!("未知的电源动作: {}", other))),
        }
    }
}

/// BMC 报告的电源状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    On,
    Off,
    Unknown,
    Error,
}

/// 电源操作状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum PowerOperationStatus {
    Pending,
    InFlight,
    Succeeded,
    Failed,
    TimedOut,
}

impl PowerOperationStatus {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            PowerOperationStatus::Succeeded
                | PowerOperationStatus::Failed
                | PowerOperationStatus::TimedOut
        )
    }
}

/// 电源操作记录
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PowerOperation {
    pub id: String,
    pub machine_id: String,
    pub action: PowerAction,
    /// 执行该操作的机架控制器
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rack_id: Option<String>,
    pub status: PowerOperationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power_state: Option<PowerState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// 机器生命周期状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MachineStatus {
    New,
    Commissioning,
    Testing,
    Ready,
    Allocated,
    Deploying,
    Deployed,
    Rescue,
    Broken,
}

impl MachineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MachineStatus::New => "new",
            MachineStatus::Commissioning => "commissioning",
            MachineStatus::Testing => "testing",
            MachineStatus::Ready => "ready",
            MachineStatus::Allocated => "allocated",
            MachineStatus::Deploying => "deploying",
            MachineStatus::Deployed => "deployed",
            MachineStatus::Rescue => "rescue",
            MachineStatus::Broken => "broken",
        }
    }
}

impl FromStr for MachineStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let status = match s {
            "new" => MachineStatus::New,
            "commissioning" => MachineStatus::Commissioning,
            "testing" => MachineStatus::Testing,
            "ready" => MachineStatus::Ready,
            "allocated" => MachineStatus::Allocated,
            "deploying" => MachineStatus::Deploying,
            "deployed" => MachineStatus::Deployed,
            "rescue" => MachineStatus::Rescue,
            "broken" => MachineStatus::Broken,
            other => return Err(Error::InvalidArgument(format!("未知的机器状态: {}", other))),
        };
        Ok(status)
    }
}

/// 驱动参数，例如 `power_address`、`power_user`、`power_pass`
pub type PowerParameters = HashMap<String, String>;

/// 受管机器
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Machine {
    pub system_id: String,
    pub hostname: String,
    /// 例如 `amd64/generic`
    pub architecture: String,
    pub status: MachineStatus,
    #[serde(default)]
    pub boot_macs: Vec<MacAddress>,
    pub power_type: PowerType,
    #[serde(default)]
    pub power_parameters: PowerParameters,
    /// BMC 所在 VLAN，决定哪些机架可以接管电源控制
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bmc_vlan_id: Option<VlanId>,
}
