/// 机器表

use common::models::{Machine, MacAddress, PowerParameters, PowerType};
use common::Error;
use sea_orm::entity::prelude::*;
use sea_orm::Set;
use serde::{Deserialize, Serialize};
use validator::Validate;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "machines")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub system_id: String,
    pub hostname: String,
    pub architecture: String,
    pub status: String,
    /// MAC 字符串数组
    pub boot_macs: Json,
    pub power_type: String,
    pub power_parameters: Json,
    pub bmc_vlan_id: Option<i64>,
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl TryFrom<Model> for Machine {
    type Error = Error;

    fn try_from(model: Model) -> Result<Self, Self::Error> {
        let boot_macs: Vec<MacAddress> = serde_json::from_value(model.boot_macs)?;
        let power_type: PowerType =
            serde_json::from_value(serde_json::Value::String(model.power_type.clone()))
                .map_err(|_| Error::Database(format!("未知的电源类型: {}", model.power_type)))?;
        let power_parameters: PowerParameters = serde_json::from_value(model.power_parameters)?;

        Ok(Self {
            system_id: model.system_id,
            hostname: model.hostname,
            architecture: model.architecture,
            status: model.status.parse()?,
            boot_macs,
            power_type,
            power_parameters,
            bmc_vlan_id: model.bmc_vlan_id,
        })
    }
}

impl ActiveModel {
    pub fn from_domain(machine: &Machine) -> Self {
        let now = chrono::Utc::now();
        Self {
            system_id: Set(machine.system_id.clone()),
            hostname: Set(machine.hostname.clone()),
            architecture: Set(machine.architecture.clone()),
            status: Set(machine.status.as_str().to_string()),
            boot_macs: Set(serde_json::json!(machine.boot_macs)),
            power_type: Set(machine.power_type.as_str().to_string()),
            power_parameters: Set(serde_json::json!(machine.power_parameters)),
            bmc_vlan_id: Set(machine.bmc_vlan_id),
            created_at: Set(now.into()),
            updated_at: Set(now.into()),
        }
    }
}

/// 创建机器 DTO
#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct CreateMachineDto {
    #[validate(length(min = 1, max = 255))]
    pub hostname: String,

    #[validate(length(min = 1, max = 64))]
    pub architecture: String,

    #[validate(length(min = 1))]
    pub boot_macs: Vec<MacAddress>,

    pub power_type: PowerType,
    #[serde(default)]
    pub power_parameters: PowerParameters,
    pub bmc_vlan_id: Option<i64>,
}

/// 电源操作请求 DTO
#[derive(Debug, Serialize, Deserialize)]
pub struct PowerRequestDto {
    pub action: common::models::PowerAction,
}
