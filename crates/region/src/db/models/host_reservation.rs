/// 主机保留表

use common::models::HostReservation;
use common::Error;
use sea_orm::entity::prelude::*;
use sea_orm::Set;
use serde::{Deserialize, Serialize};

use super::parse_ip;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "host_reservations")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub subnet_id: i64,
    #[sea_orm(unique)]
    pub mac_address: String,
    #[sea_orm(unique)]
    pub ip: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::subnet::Entity",
        from = "Column::SubnetId",
        to = "super::subnet::Column::Id",
        on_delete = "Cascade"
    )]
    Subnet,
}

impl Related<super::subnet::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Subnet.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl TryFrom<Model> for HostReservation {
    type Error = Error;

    fn try_from(model: Model) -> Result<Self, Self::Error> {
        Ok(Self {
            subnet_id: model.subnet_id,
            mac_address: model.mac_address.parse()?,
            ip: parse_ip("host_reservations", &model.ip)?,
        })
    }
}

impl ActiveModel {
    /// 主键由数据库生成
    pub fn from_domain(reservation: &HostReservation) -> Self {
        Self {
            subnet_id: Set(reservation.subnet_id),
            mac_address: Set(reservation.mac_address.to_string()),
            ip: Set(reservation.ip.to_string()),
            ..Default::default()
        }
    }
}
