/// 机器服务
///
/// 机器记录写库，同时保存在内存缓存中供引导查询按 MAC 查找

use common::models::{MacAddress, Machine, MachineStatus, PowerAction, PowerOperation};
use common::{Error, Result};
use sea_orm::{DatabaseConnection, EntityTrait};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::info;

use crate::app_state::AppState;
use crate::db::db_err;
use crate::db::models::machine::{self, CreateMachineDto};

/// 机器缓存
#[derive(Default)]
pub struct MachineCache {
    machines: RwLock<HashMap<String, Machine>>,
}

impl MachineCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, system_id: &str) -> Option<Machine> {
        self.machines.read().await.get(system_id).cloned()
    }

    pub async fn list(&self) -> Vec<Machine> {
        let mut machines: Vec<Machine> = self.machines.read().await.values().cloned().collect();
        machines.sort_by(|a, b| a.system_id.cmp(&b.system_id));
        machines
    }

    pub async fn insert(&self, machine: Machine) {
        self.machines
            .write()
            .await
            .insert(machine.system_id.clone(), machine);
    }

    pub async fn remove(&self, system_id: &str) -> Option<Machine> {
        self.machines.write().await.remove(system_id)
    }

    /// 按引导网卡 MAC 查找
    pub async fn find_by_mac(&self, mac: &MacAddress) -> Option<Machine> {
        self.machines
            .read()
            .await
            .values()
            .find(|m| m.boot_macs.contains(mac))
            .cloned()
    }
}

pub struct MachineService {
    state: AppState,
}

impl MachineService {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// 启动时载入全部机器
    pub async fn load_all(db: &DatabaseConnection) -> Result<Vec<Machine>> {
        machine::Entity::find()
            .all(db)
            .await
            .map_err(db_err)?
            .into_iter()
            .map(Machine::try_from)
            .collect()
    }

    pub async fn create_machine(&self, dto: CreateMachineDto) -> Result<Machine> {
        for mac in &dto.boot_macs {
            if let Some(existing) = self.state.machines.find_by_mac(mac).await {
                return Err(Error::AlreadyExists(format!(
                    "MAC {} 已属于机器 {}",
                    mac, existing.system_id
                )));
            }
        }
        if let Some(vlan_id) = dto.bmc_vlan_id {
            self.state.registry.get_vlan(vlan_id).await?;
        }

        let machine = Machine {
            system_id: common::utils::generate_system_id(),
            hostname: dto.hostname,
            architecture: dto.architecture,
            status: MachineStatus::New,
            boot_macs: dto.boot_macs,
            power_type: dto.power_type,
            power_parameters: dto.power_parameters,
            bmc_vlan_id: dto.bmc_vlan_id,
        };

        machine::Entity::insert(machine::ActiveModel::from_domain(&machine))
            .exec(&*self.state.sea_db)
            .await
            .map_err(db_err)?;
        self.state.machines.insert(machine.clone()).await;
        let owner = self
            .state
            .membership
            .register_machine(&machine.system_id, machine.bmc_vlan_id)
            .await?;

        info!(
            "✅ 机器已创建: system_id={}, hostname={}, power_owner={:?}",
            machine.system_id, machine.hostname, owner
        );
        Ok(machine)
    }

    pub async fn get_machine(&self, system_id: &str) -> Result<Machine> {
        self.state
            .machines
            .get(system_id)
            .await
            .ok_or_else(|| Error::NotFound(format!("机器 {}", system_id)))
    }

    pub async fn list_machines(&self) -> Vec<Machine> {
        self.state.machines.list().await
    }

    pub async fn delete_machine(&self, system_id: &str) -> Result<()> {
        self.get_machine(system_id).await?;
        machine::Entity::delete_by_id(system_id.to_string())
            .exec(&*self.state.sea_db)
            .await
            .map_err(db_err)?;
        self.state.machines.remove(system_id).await;
        self.state.membership.unregister_machine(system_id).await;
        info!("机器已删除: {}", system_id);
        Ok(())
    }

    pub async fn power(&self, system_id: &str, action: PowerAction) -> Result<PowerOperation> {
        let machine = self.get_machine(system_id).await?;
        self.state.power.request_power(&machine, action).await
    }

    pub async fn power_history(&self, system_id: &str) -> Result<Vec<PowerOperation>> {
        self.get_machine(system_id).await?;
        Ok(self.state.power.history(system_id).await)
    }
}
