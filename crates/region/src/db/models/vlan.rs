/// VLAN 表
///
/// `primary_rack` / `secondary_rack` 即该 VLAN 的 DHCP 主备分配

use common::models::Vlan;
use common::Error;
use sea_orm::entity::prelude::*;
use sea_orm::Set;
use serde::{Deserialize, Serialize};

use super::{to_i64, to_u64};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "vlans")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: i64,
    pub fabric_id: i64,
    pub vid: i32,
    pub name: String,
    pub mtu: i32,
    pub space: Option<String>,
    pub dhcp_on: bool,
    pub primary_rack: Option<String>,
    pub secondary_rack: Option<String>,
    pub version: i64,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::fabric::Entity",
        from = "Column::FabricId",
        to = "super::fabric::Column::Id",
        on_delete = "Cascade"
    )]
    Fabric,
}

impl Related<super::fabric::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Fabric.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl TryFrom<Model> for Vlan {
    type Error = Error;

    fn try_from(model: Model) -> Result<Self, Self::Error> {
        let vid = u16::try_from(model.vid)
            .map_err(|_| Error::Database(format!("VLAN {} 的 VID 无效: {}", model.id, model.vid)))?;
        Ok(Self {
            id: model.id,
            fabric_id: model.fabric_id,
            vid,
            name: model.name,
            mtu: u32::try_from(model.mtu).unwrap_or(1500),
            space: model.space,
            dhcp_on: model.dhcp_on,
            primary_rack: model.primary_rack,
            secondary_rack: model.secondary_rack,
            version: to_u64(model.version),
        })
    }
}

impl ActiveModel {
    pub fn from_domain(vlan: &Vlan) -> Self {
        Self {
            id: Set(vlan.id),
            fabric_id: Set(vlan.fabric_id),
            vid: Set(i32::from(vlan.vid)),
            name: Set(vlan.name.clone()),
            mtu: Set(i32::try_from(vlan.mtu).unwrap_or(i32::MAX)),
            space: Set(vlan.space.clone()),
            dhcp_on: Set(vlan.dhcp_on),
            primary_rack: Set(vlan.primary_rack.clone()),
            secondary_rack: Set(vlan.secondary_rack.clone()),
            version: Set(to_i64(vlan.version)),
            updated_at: Set(chrono::Utc::now().into()),
        }
    }
}
