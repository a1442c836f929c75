/// 子网表
///
/// `version` 是乐观并发版本，更新时带上期望版本做条件写入

use common::models::Subnet;
use common::Error;
use ipnetwork::Ipv4Network;
use sea_orm::entity::prelude::*;
use sea_orm::Set;
use serde::{Deserialize, Serialize};

use super::{parse_ip, to_i64, to_u64};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "subnets")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: i64,
    #[sea_orm(unique)]
    pub cidr: String,
    pub vlan_id: i64,
    pub managed: bool,
    pub gateway_ip: Option<String>,
    /// 字符串数组
    pub dns_servers: Json,
    pub disabled_boot_architectures: Json,
    pub version: i64,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::vlan::Entity",
        from = "Column::VlanId",
        to = "super::vlan::Column::Id"
    )]
    Vlan,
    #[sea_orm(has_many = "super::ip_range::Entity")]
    IpRanges,
}

impl Related<super::vlan::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Vlan.def()
    }
}

impl Related<super::ip_range::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::IpRanges.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

fn string_list(value: &Json) -> Vec<String> {
    serde_json::from_value(value.clone()).unwrap_or_default()
}

impl TryFrom<Model> for Subnet {
    type Error = Error;

    fn try_from(model: Model) -> Result<Self, Self::Error> {
        let cidr: Ipv4Network = model
            .cidr
            .parse()
            .map_err(|_| Error::Database(format!("子网 {} 的 CIDR 无效: {}", model.id, model.cidr)))?;
        let gateway_ip = model
            .gateway_ip
            .as_deref()
            .map(|gw| parse_ip("subnets", gw))
            .transpose()?;
        let dns_servers = string_list(&model.dns_servers)
            .iter()
            .map(|ip| parse_ip("subnets", ip))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            id: model.id,
            cidr,
            vlan_id: model.vlan_id,
            managed: model.managed,
            gateway_ip,
            dns_servers,
            disabled_boot_architectures: string_list(&model.disabled_boot_architectures),
            version: to_u64(model.version),
        })
    }
}

impl ActiveModel {
    pub fn from_domain(subnet: &Subnet) -> Self {
        let dns: Vec<String> = subnet.dns_servers.iter().map(|ip| ip.to_string()).collect();
        Self {
            id: Set(subnet.id),
            cidr: Set(subnet.cidr.to_string()),
            vlan_id: Set(subnet.vlan_id),
            managed: Set(subnet.managed),
            gateway_ip: Set(subnet.gateway_ip.map(|ip| ip.to_string())),
            dns_servers: Set(serde_json::json!(dns)),
            disabled_boot_architectures: Set(serde_json::json!(subnet.disabled_boot_architectures)),
            version: Set(to_i64(subnet.version)),
            updated_at: Set(chrono::Utc::now().into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_subnet_row_conversion() {
        let subnet = Subnet {
            id: 7,
            cidr: "10.0.0.0/24".parse().unwrap(),
            vlan_id: 2,
            managed: true,
            gateway_ip: Some(Ipv4Addr::new(10, 0, 0, 1)),
            dns_servers: vec![Ipv4Addr::new(10, 0, 0, 2)],
            disabled_boot_architectures: vec!["pxe".to_string()],
            version: 3,
        };

        let active = ActiveModel::from_domain(&subnet);
        let model = Model {
            id: active.id.unwrap(),
            cidr: active.cidr.unwrap(),
            vlan_id: active.vlan_id.unwrap(),
            managed: active.managed.unwrap(),
            gateway_ip: active.gateway_ip.unwrap(),
            dns_servers: active.dns_servers.unwrap(),
            disabled_boot_architectures: active.disabled_boot_architectures.unwrap(),
            version: active.version.unwrap(),
            updated_at: active.updated_at.unwrap(),
        };
        assert_eq!(Subnet::try_from(model).unwrap(), subnet);
    }

    #[test]
    fn test_corrupt_cidr_is_database_error() {
        let model = Model {
            id: 1,
            cidr: "not-a-cidr".to_string(),
            vlan_id: 1,
            managed: true,
            gateway_ip: None,
            dns_servers: serde_json::json!([]),
            disabled_boot_architectures: serde_json::json!([]),
            version: 1,
            updated_at: chrono::Utc::now().into(),
        };
        assert!(matches!(Subnet::try_from(model), Err(Error::Database(_))));
    }
}
