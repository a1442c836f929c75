/// 拓扑服务
///
/// 拓扑校验由内存中的 `SubnetRegistry` 负责，本服务在校验通过后写库。
/// 子网更新带期望版本做条件写入；数据库拒绝时从库里重新载入拓扑。

use common::models::{
    Fabric, FabricId, HostReservation, IpRange, IpRangeType, MacAddress, RangeId, Subnet,
    SubnetId, TopologySnapshot, Vlan, VlanId,
};
use common::topology::{NewSubnet, SubnetUpdate};
use common::{Error, Result};
use ipnetwork::Ipv4Network;
use sea_orm::sea_query::OnConflict;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use tracing::{info, warn};
use validator::Validate;

use crate::app_state::AppState;
use crate::db::db_err;
use crate::db::models::{fabric, host_reservation, ip_range, subnet, to_i64, vlan};

// ============================================================================
// DTO
// ============================================================================

#[derive(Debug, Deserialize, Validate)]
pub struct CreateFabricDto {
    #[validate(length(min = 1, max = 64))]
    pub name: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateVlanDto {
    pub fabric_id: FabricId,
    #[validate(range(min = 1, max = 4094))]
    pub vid: u16,
    #[validate(length(max = 64))]
    #[serde(default)]
    pub name: String,
    pub space: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateSubnetDto {
    pub vlan_id: VlanId,
    pub cidr: Ipv4Network,
    #[serde(default = "default_managed")]
    pub managed: bool,
    pub gateway_ip: Option<Ipv4Addr>,
    #[serde(default)]
    pub dns_servers: Vec<Ipv4Addr>,
}

fn default_managed() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct UpdateSubnetDto {
    /// 调用方读到的版本
    pub version: u64,
    pub managed: Option<bool>,
    #[serde(default, with = "double_option")]
    pub gateway_ip: Option<Option<Ipv4Addr>>,
    pub dns_servers: Option<Vec<Ipv4Addr>>,
    pub disabled_boot_architectures: Option<Vec<String>>,
}

/// 区分“未提供”与“显式置空”
mod double_option {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
    where
        T: Deserialize<'de>,
        D: Deserializer<'de>,
    {
        Option::<T>::deserialize(deserializer).map(Some)
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateRangeDto {
    #[serde(rename = "type")]
    pub range_type: IpRangeType,
    pub start_ip: Ipv4Addr,
    pub end_ip: Ipv4Addr,
    #[validate(length(max = 255))]
    #[serde(default)]
    pub comment: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateReservationDto {
    pub mac_address: MacAddress,
    pub ip: Ipv4Addr,
}

#[derive(Debug, Serialize)]
pub struct FabricResponse {
    pub fabric: Fabric,
    pub default_vlan: Vlan,
}

// ============================================================================
// 服务
// ============================================================================

pub struct TopologyService {
    state: AppState,
}

impl TopologyService {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    fn db(&self) -> &DatabaseConnection {
        &*self.state.sea_db
    }

    /// 从数据库载入完整拓扑
    pub async fn load_snapshot(db: &DatabaseConnection) -> Result<TopologySnapshot> {
        let fabrics: Vec<Fabric> = fabric::Entity::find()
            .all(db)
            .await
            .map_err(db_err)?
            .into_iter()
            .map(Fabric::from)
            .collect();
        let vlans = vlan::Entity::find()
            .all(db)
            .await
            .map_err(db_err)?
            .into_iter()
            .map(Vlan::try_from)
            .collect::<Result<Vec<_>>>()?;
        let subnets = subnet::Entity::find()
            .all(db)
            .await
            .map_err(db_err)?
            .into_iter()
            .map(Subnet::try_from)
            .collect::<Result<Vec<_>>>()?;
        let ranges = ip_range::Entity::find()
            .all(db)
            .await
            .map_err(db_err)?
            .into_iter()
            .map(IpRange::try_from)
            .collect::<Result<Vec<_>>>()?;
        let host_reservations = host_reservation::Entity::find()
            .all(db)
            .await
            .map_err(db_err)?
            .into_iter()
            .map(HostReservation::try_from)
            .collect::<Result<Vec<_>>>()?;

        info!(
            "载入拓扑: fabrics={}, vlans={}, subnets={}, ranges={}, reservations={}",
            fabrics.len(),
            vlans.len(),
            subnets.len(),
            ranges.len(),
            host_reservations.len()
        );
        Ok(TopologySnapshot {
            version: 1,
            fabrics,
            vlans,
            subnets,
            ranges,
            host_reservations,
        })
    }

    /// 用数据库内容覆盖内存拓扑
    pub async fn reload(&self) -> Result<()> {
        let snapshot = Self::load_snapshot(self.db()).await?;
        self.state.registry.restore(snapshot).await
    }

    pub async fn snapshot(&self) -> TopologySnapshot {
        self.state.registry.snapshot().await
    }

    pub async fn create_fabric(&self, dto: CreateFabricDto) -> Result<FabricResponse> {
        let (fabric, default_vlan) = self.state.registry.create_fabric(&dto.name).await?;

        fabric::Entity::insert(fabric::ActiveModel::from_domain(&fabric))
            .exec(self.db())
            .await
            .map_err(db_err)?;
        self.persist_vlan(&default_vlan).await?;

        Ok(FabricResponse {
            fabric,
            default_vlan,
        })
    }

    pub async fn create_vlan(&self, dto: CreateVlanDto) -> Result<Vlan> {
        let vlan = self
            .state
            .registry
            .create_vlan(dto.fabric_id, dto.vid, &dto.name, dto.space)
            .await?;
        self.persist_vlan(&vlan).await?;
        Ok(vlan)
    }

    pub async fn delete_vlan(&self, vlan_id: VlanId) -> Result<()> {
        self.state.registry.delete_vlan(vlan_id).await?;
        vlan::Entity::delete_by_id(vlan_id)
            .exec(self.db())
            .await
            .map_err(db_err)?;
        info!("VLAN 已删除: {}", vlan_id);
        Ok(())
    }

    /// 写入 VLAN（存在则覆盖）
    pub async fn persist_vlan(&self, vlan: &Vlan) -> Result<()> {
        persist_vlan(self.db(), vlan).await
    }

    pub async fn create_subnet(&self, dto: CreateSubnetDto) -> Result<Subnet> {
        let subnet = self
            .state
            .registry
            .create_subnet(NewSubnet {
                vlan_id: dto.vlan_id,
                cidr: dto.cidr,
                managed: dto.managed,
                gateway_ip: dto.gateway_ip,
                dns_servers: dto.dns_servers,
            })
            .await?;

        subnet::Entity::insert(subnet::ActiveModel::from_domain(&subnet))
            .exec(self.db())
            .await
            .map_err(db_err)?;
        Ok(subnet)
    }

    /// 乐观并发更新
    pub async fn update_subnet(&self, subnet_id: SubnetId, dto: UpdateSubnetDto) -> Result<Subnet> {
        let expected = dto.version;
        let subnet = self
            .state
            .registry
            .update_subnet(
                subnet_id,
                expected,
                SubnetUpdate {
                    managed: dto.managed,
                    gateway_ip: dto.gateway_ip,
                    dns_servers: dto.dns_servers,
                    disabled_boot_architectures: dto.disabled_boot_architectures,
                },
            )
            .await?;

        let result = subnet::Entity::update_many()
            .set(subnet::ActiveModel::from_domain(&subnet))
            .filter(subnet::Column::Id.eq(subnet_id))
            .filter(subnet::Column::Version.eq(to_i64(expected)))
            .exec(self.db())
            .await
            .map_err(db_err)?;

        if result.rows_affected == 0 {
            // 其他区域控制器先一步写入
            warn!("子网 {} 数据库版本已变化，重新载入拓扑", subnet_id);
            self.reload().await?;
            let actual = self
                .state
                .registry
                .get_subnet(subnet_id)
                .await
                .map(|s| s.version)
                .unwrap_or_default();
            return Err(Error::VersionConflict {
                entity: format!("subnet:{}", subnet_id),
                expected,
                actual,
            });
        }
        Ok(subnet)
    }

    pub async fn add_range(&self, subnet_id: SubnetId, dto: CreateRangeDto) -> Result<IpRange> {
        let range = self
            .state
            .registry
            .add_range(subnet_id, dto.range_type, dto.start_ip, dto.end_ip, &dto.comment)
            .await?;

        ip_range::Entity::insert(ip_range::ActiveModel::from_domain(&range))
            .exec(self.db())
            .await
            .map_err(db_err)?;
        self.persist_subnet_version(subnet_id).await?;
        Ok(range)
    }

    pub async fn remove_range(&self, range_id: RangeId) -> Result<IpRange> {
        let range = self.state.registry.remove_range(range_id).await?;
        ip_range::Entity::delete_by_id(range_id)
            .exec(self.db())
            .await
            .map_err(db_err)?;
        self.persist_subnet_version(range.subnet_id).await?;
        Ok(range)
    }

    pub async fn add_host_reservation(
        &self,
        subnet_id: SubnetId,
        dto: CreateReservationDto,
    ) -> Result<HostReservation> {
        let reservation = self
            .state
            .registry
            .add_host_reservation(subnet_id, dto.mac_address, dto.ip)
            .await?;

        host_reservation::Entity::delete_many()
            .filter(host_reservation::Column::SubnetId.eq(subnet_id))
            .filter(host_reservation::Column::MacAddress.eq(reservation.mac_address.to_string()))
            .exec(self.db())
            .await
            .map_err(db_err)?;
        host_reservation::Entity::insert(host_reservation::ActiveModel::from_domain(&reservation))
            .exec(self.db())
            .await
            .map_err(db_err)?;
        self.persist_subnet_version(subnet_id).await?;
        Ok(reservation)
    }

    /// 地址段与主机保留的变化同样推进子网版本
    async fn persist_subnet_version(&self, subnet_id: SubnetId) -> Result<()> {
        let subnet = self.state.registry.get_subnet(subnet_id).await?;
        subnet::Entity::update(subnet::ActiveModel::from_domain(&subnet))
            .exec(self.db())
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

/// 写入 VLAN（存在则覆盖），成员变化监听器也用它持久化主备分配
pub async fn persist_vlan(db: &DatabaseConnection, vlan: &Vlan) -> Result<()> {
    vlan::Entity::insert(vlan::ActiveModel::from_domain(vlan))
        .on_conflict(
            OnConflict::column(vlan::Column::Id)
                .update_columns([
                    vlan::Column::Name,
                    vlan::Column::Mtu,
                    vlan::Column::Space,
                    vlan::Column::DhcpOn,
                    vlan::Column::PrimaryRack,
                    vlan::Column::SecondaryRack,
                    vlan::Column::Version,
                    vlan::Column::UpdatedAt,
                ])
                .to_owned(),
        )
        .exec(db)
        .await
        .map_err(db_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_dto_distinguishes_null_gateway() {
        let dto: UpdateSubnetDto = serde_json::from_str(r#"{"version": 3, "gateway_ip": null}"#).unwrap();
        assert_eq!(dto.gateway_ip, Some(None));

        let dto: UpdateSubnetDto = serde_json::from_str(r#"{"version": 3}"#).unwrap();
        assert_eq!(dto.gateway_ip, None);

        let dto: UpdateSubnetDto =
            serde_json::from_str(r#"{"version": 3, "gateway_ip": "10.0.0.1"}"#).unwrap();
        assert_eq!(dto.gateway_ip, Some(Some(Ipv4Addr::new(10, 0, 0, 1))));
    }

    #[test]
    fn test_vlan_dto_validation() {
        let dto: CreateVlanDto = serde_json::from_str(r#"{"fabric_id": 1, "vid": 0}"#).unwrap();
        assert!(dto.validate().is_err());

        let dto: CreateVlanDto = serde_json::from_str(r#"{"fabric_id": 1, "vid": 100, "name": "pxe"}"#).unwrap();
        assert!(dto.validate().is_ok());
    }

    #[test]
    fn test_range_dto_uses_type_field() {
        let dto: CreateRangeDto = serde_json::from_str(
            r#"{"type": "dynamic", "start_ip": "10.0.0.100", "end_ip": "10.0.0.200"}"#,
        )
        .unwrap();
        assert_eq!(dto.range_type, IpRangeType::Dynamic);
        assert!(dto.comment.is_empty());
    }
}
