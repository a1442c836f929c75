/// 控制器表

use chrono::Utc;
use common::models::{ControllerNode, ControllerRole};
use common::Error;
use sea_orm::entity::prelude::*;
use sea_orm::Set;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "controllers")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub system_id: String,
    pub hostname: String,
    /// rack / region / rack+region
    pub role: String,
    pub rpc_endpoint: Option<String>,
    pub services: Json,
    pub vlans: Json,
    pub online: bool,
    pub last_heartbeat: DateTimeWithTimeZone,
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

fn parse_role(value: &str) -> Result<ControllerRole, Error> {
    serde_json::from_value(serde_json::Value::String(value.to_string()))
        .map_err(|_| Error::Database(format!("未知的控制器角色: {}", value)))
}

impl TryFrom<Model> for ControllerNode {
    type Error = Error;

    fn try_from(model: Model) -> Result<Self, Self::Error> {
        Ok(Self {
            role: parse_role(&model.role)?,
            services: serde_json::from_value(model.services)?,
            vlans: serde_json::from_value(model.vlans)?,
            system_id: model.system_id,
            hostname: model.hostname,
            rpc_endpoint: model.rpc_endpoint,
            last_heartbeat: model.last_heartbeat.with_timezone(&Utc),
            online: model.online,
        })
    }
}

impl ActiveModel {
    pub fn from_domain(node: &ControllerNode) -> Self {
        let now = Utc::now();
        Self {
            system_id: Set(node.system_id.clone()),
            hostname: Set(node.hostname.clone()),
            role: Set(node.role.as_str().to_string()),
            rpc_endpoint: Set(node.rpc_endpoint.clone()),
            services: Set(serde_json::json!(node.services)),
            vlans: Set(serde_json::json!(node.vlans)),
            online: Set(node.online),
            last_heartbeat: Set(node.last_heartbeat.into()),
            created_at: Set(now.into()),
            updated_at: Set(now.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::models::ControllerService;

    #[test]
    fn test_controller_row_round_trip() {
        let node = ControllerNode {
            system_id: "abc123".to_string(),
            hostname: "rack-1".to_string(),
            role: ControllerRole::RackAndRegion,
            rpc_endpoint: None,
            services: [ControllerService::Dhcp].into_iter().collect(),
            vlans: [5, 6].into_iter().collect(),
            last_heartbeat: Utc::now(),
            online: true,
        };
        let active = ActiveModel::from_domain(&node);
        assert_eq!(active.role.clone().unwrap(), "rack+region");

        let model = Model {
            system_id: active.system_id.unwrap(),
            hostname: active.hostname.unwrap(),
            role: active.role.unwrap(),
            rpc_endpoint: active.rpc_endpoint.unwrap(),
            services: active.services.unwrap(),
            vlans: active.vlans.unwrap(),
            online: active.online.unwrap(),
            last_heartbeat: active.last_heartbeat.unwrap(),
            created_at: active.created_at.unwrap(),
            updated_at: active.updated_at.unwrap(),
        };
        let restored = ControllerNode::try_from(model).unwrap();
        assert_eq!(restored.role, ControllerRole::RackAndRegion);
        assert_eq!(restored.vlans, node.vlans);
        assert_eq!(restored.services, node.services);
    }
}
