/// Fabric 表

use common::models::Fabric;
use sea_orm::entity::prelude::*;
use sea_orm::Set;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "fabrics")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: i64,
    #[sea_orm(unique)]
    pub name: String,
    pub default_vlan_id: i64,
    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::vlan::Entity")]
    Vlans,
}

impl Related<super::vlan::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Vlans.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl From<Model> for Fabric {
    fn from(model: Model) -> Self {
        Self {
            id: model.id,
            name: model.name,
            default_vlan_id: model.default_vlan_id,
        }
    }
}

impl ActiveModel {
    pub fn from_domain(fabric: &Fabric) -> Self {
        Self {
            id: Set(fabric.id),
            name: Set(fabric.name.clone()),
            default_vlan_id: Set(fabric.default_vlan_id),
            created_at: Set(chrono::Utc::now().into()),
        }
    }
}
