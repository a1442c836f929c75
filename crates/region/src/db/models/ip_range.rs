/// IP 地址段表

use common::models::IpRange;
use common::Error;
use sea_orm::entity::prelude::*;
use sea_orm::Set;
use serde::{Deserialize, Serialize};

use super::parse_ip;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "ip_ranges")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: i64,
    pub subnet_id: i64,
    /// dynamic / reserved
    #[sea_orm(column_name = "type")]
    pub range_type: String,
    pub start_ip: String,
    pub end_ip: String,
    pub comment: String,
    pub created_at: DateTimeWithTimeZone,
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

impl TryFrom<Model> for IpRange {
    type Error = Error;

    fn try_from(model: Model) -> Result<Self, Self::Error> {
        Ok(Self {
            id: model.id,
            subnet_id: model.subnet_id,
            range_type: model.range_type.parse()?,
            start_ip: parse_ip("ip_ranges", &model.start_ip)?,
            end_ip: parse_ip("ip_ranges", &model.end_ip)?,
            comment: model.comment,
        })
    }
}

impl ActiveModel {
    pub fn from_domain(range: &IpRange) -> Self {
        Self {
            id: Set(range.id),
            subnet_id: Set(range.subnet_id),
            range_type: Set(range.range_type.as_str().to_string()),
            start_ip: Set(range.start_ip.to_string()),
            end_ip: Set(range.end_ip.to_string()),
            comment: Set(range.comment.clone()),
            created_at: Set(chrono::Utc::now().into()),
        }
    }
}
