/// 应用全局状态

use common::SubnetRegistry;
use sea_orm::DatabaseConnection;
use std::sync::Arc;

use crate::services::{ControllerMembership, MachineCache, PowerCoordinator};
use crate::ws::RackConnectionManager;

/// 应用状态
#[derive(Clone)]
pub struct AppState {
    /// SeaORM 数据库连接
    pub sea_db: Arc<DatabaseConnection>,
    /// 本区域控制器 ID
    pub region_id: String,
    pub registry: Arc<SubnetRegistry>,
    pub membership: Arc<ControllerMembership>,
    pub machines: Arc<MachineCache>,
    pub power: Arc<PowerCoordinator>,
    /// 机架 WebSocket 连接管理器
    pub rack_manager: RackConnectionManager,
}

impl AppState {
    pub fn new(
        sea_db: DatabaseConnection,
        region_id: String,
        membership: Arc<ControllerMembership>,
        machines: Arc<MachineCache>,
        rack_manager: RackConnectionManager,
    ) -> Self {
        let power = Arc::new(PowerCoordinator::new(
            membership.clone(),
            Arc::new(rack_manager.clone()),
        ));
        Self {
            sea_db: Arc::new(sea_db),
            region_id,
            registry: membership.registry().clone(),
            membership,
            machines,
            power,
            rack_manager,
        }
    }
}

#[cfg(test)]
impl AppState {
    /// 使用 Mock 数据库的状态，只适合不访问数据库的测试
    pub fn for_tests() -> Self {
        use common::settings::ClusterSettings;
        use sea_orm::{DatabaseBackend, MockDatabase};

        let registry = Arc::new(SubnetRegistry::new());
        let membership = Arc::new(ControllerMembership::new(registry, ClusterSettings::default()));
        Self::new(
            MockDatabase::new(DatabaseBackend::Postgres).into_connection(),
            "region-test".to_string(),
            membership,
            Arc::new(MachineCache::new()),
            RackConnectionManager::new(std::time::Duration::from_secs(5)),
        )
    }
}
