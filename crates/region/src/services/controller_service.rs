/// 控制器服务
///
/// 处理机架注册、心跳与注销，并把成员变化同步到数据库与已连接的机架

use chrono::{DateTime, TimeZone, Utc};
use common::models::{ControllerNode, FailoverPeering, VlanId};
use common::ws_rpc::{HeartbeatNotification, RegisterRequest, RegisterResponse};
use common::{Error, Result};
use sea_orm::prelude::DateTimeWithTimeZone;
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

use super::membership::{MembershipChange, MembershipEvent};
use super::topology_service::persist_vlan;
use crate::app_state::AppState;
use crate::db::db_err;
use crate::db::models::controller;

/// 拓扑连续变化时合并下发的等待时间
const PUSH_DEBOUNCE: Duration = Duration::from_millis(200);

#[derive(Debug, Deserialize)]
pub struct VlanDhcpDto {
    pub dhcp_on: bool,
    pub primary_rack: Option<String>,
    pub secondary_rack: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DeleteControllerQuery {
    #[serde(default)]
    pub force: bool,
}

pub struct ControllerService {
    state: AppState,
}

impl ControllerService {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    pub async fn load_all(db: &DatabaseConnection) -> Result<Vec<ControllerNode>> {
        controller::Entity::find()
            .all(db)
            .await
            .map_err(db_err)?
            .into_iter()
            .map(ControllerNode::try_from)
            .collect()
    }

    pub async fn list_controllers(&self) -> Vec<ControllerNode> {
        self.state.membership.list().await
    }

    pub async fn get_controller(&self, system_id: &str) -> Result<ControllerNode> {
        self.state
            .membership
            .get(system_id)
            .await
            .ok_or_else(|| Error::NotFound(format!("控制器 {}", system_id)))
    }

    /// 机架注册，返回完整的初始配置
    pub async fn register_rack(&self, request: RegisterRequest) -> Result<RegisterResponse> {
        if !request.role.is_rack() {
            return Err(Error::InvalidArgument(format!(
                "{} 不是机架控制器: {}",
                request.system_id,
                request.role.as_str()
            )));
        }

        let node = ControllerNode {
            system_id: request.system_id.clone(),
            hostname: request.hostname.clone(),
            role: request.role,
            rpc_endpoint: None,
            services: request.services,
            vlans: request.vlans,
            last_heartbeat: Utc::now(),
            online: true,
        };
        let node = self.state.membership.register(node).await?;
        persist_controller(&*self.state.sea_db, &node).await?;

        let membership = &self.state.membership;
        let settings = membership.settings().await;
        info!(
            "机架注册完成: system_id={}, version={}",
            node.system_id, request.version
        );
        Ok(RegisterResponse {
            accepted: true,
            region_id: self.state.region_id.clone(),
            heartbeat_interval: settings.heartbeat_interval,
            topology: membership.registry().snapshot().await,
            dhcp: membership.dhcp_configs_for(&node.system_id).await,
            rpc_plan: membership.rpc_plan(&node.system_id).await,
            settings,
        })
    }

    pub async fn heartbeat(&self, notification: HeartbeatNotification) -> Result<()> {
        let now = Utc
            .timestamp_opt(notification.timestamp, 0)
            .single()
            .filter(|ts| *ts <= Utc::now())
            .unwrap_or_else(Utc::now);
        self.state
            .membership
            .heartbeat(&notification.system_id, Some(notification.vlans), now)
            .await?;

        let heartbeat_at: DateTimeWithTimeZone = now.into();
        controller::Entity::update_many()
            .col_expr(controller::Column::Online, Expr::value(true))
            .col_expr(controller::Column::LastHeartbeat, Expr::value(heartbeat_at))
            .filter(controller::Column::SystemId.eq(notification.system_id.as_str()))
            .exec(&*self.state.sea_db)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// 本区域控制器的心跳写库，并读入其他区域控制器写入的心跳
    pub async fn sync_heartbeats(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let membership = &self.state.membership;
        let region_id = self.state.region_id.as_str();
        membership.heartbeat(region_id, None, now).await?;

        let heartbeat_at: DateTimeWithTimeZone = now.into();
        controller::Entity::update_many()
            .col_expr(controller::Column::Online, Expr::value(true))
            .col_expr(controller::Column::LastHeartbeat, Expr::value(heartbeat_at))
            .filter(controller::Column::SystemId.eq(region_id))
            .exec(&*self.state.sea_db)
            .await
            .map_err(db_err)?;

        let timeout = membership.settings().await.heartbeat_timeout();
        let persisted = Self::load_all(&*self.state.sea_db).await?;
        membership
            .absorb_heartbeats(region_id, persisted, now, timeout)
            .await
    }

    /// 注销控制器
    pub async fn delete_controller(&self, system_id: &str, force: bool) -> Result<()> {
        self.state.membership.deregister(system_id, force).await?;
        controller::Entity::delete_by_id(system_id.to_string())
            .exec(&*self.state.sea_db)
            .await
            .map_err(db_err)?;
        info!("控制器已注销: {} (force={})", system_id, force);
        Ok(())
    }

    /// 设置 VLAN 的 DHCP 主备
    pub async fn configure_vlan_dhcp(
        &self,
        vlan_id: VlanId,
        dto: VlanDhcpDto,
    ) -> Result<Option<FailoverPeering>> {
        self.state
            .membership
            .reconfigure_dhcp(vlan_id, dto.dhcp_on, dto.primary_rack, dto.secondary_rack)
            .await
    }

    pub async fn peerings(&self) -> Vec<FailoverPeering> {
        self.state.membership.peerings().await
    }
}

/// 写入控制器（存在则覆盖，保留创建时间）
pub async fn persist_controller(db: &DatabaseConnection, node: &ControllerNode) -> Result<()> {
    controller::Entity::insert(controller::ActiveModel::from_domain(node))
        .on_conflict(
            OnConflict::column(controller::Column::SystemId)
                .update_columns([
                    controller::Column::Hostname,
                    controller::Column::Role,
                    controller::Column::RpcEndpoint,
                    controller::Column::Services,
                    controller::Column::Vlans,
                    controller::Column::Online,
                    controller::Column::LastHeartbeat,
                    controller::Column::UpdatedAt,
                ])
                .to_owned(),
        )
        .exec(db)
        .await
        .map_err(db_err)?;
    Ok(())
}

// ============================================================================
// 后台同步
// ============================================================================

/// 启动成员变化与拓扑变化的同步任务
pub fn start_cluster_sync(state: AppState) {
    let events = state.membership.subscribe();
    tokio::spawn(membership_sync(state.clone(), events));
    tokio::spawn(topology_push(state));
}

async fn membership_sync(
    state: AppState,
    mut events: tokio::sync::broadcast::Receiver<MembershipChange>,
) {
    loop {
        match events.recv().await {
            Ok(change) => {
                if let Err(e) = apply_change(&state, change.event).await {
                    error!("同步成员变化失败: {}", e);
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!("成员事件积压，跳过 {} 条，执行全量同步", skipped);
                resync(&state).await;
            }
            Err(RecvError::Closed) => break,
        }
    }
    debug!("成员同步任务结束");
}

async fn apply_change(state: &AppState, event: MembershipEvent) -> Result<()> {
    match event {
        MembershipEvent::Registered { system_id }
        | MembershipEvent::CameOnline { system_id }
        | MembershipEvent::WentOffline { system_id } => {
            if let Some(node) = state.membership.get(&system_id).await {
                persist_controller(&*state.sea_db, &node).await?;
            }
        }
        MembershipEvent::Deregistered { system_id } => {
            debug!("控制器已移除: {}", system_id);
        }
        MembershipEvent::PeeringChanged { vlan } => {
            // 下发由拓扑版本变化触发
            persist_vlan(&*state.sea_db, &vlan).await?;
        }
        MembershipEvent::RpcPlanChanged { rack_id, plan } => {
            if state.rack_manager.is_connected(&rack_id).await {
                state.rack_manager.push_rpc_plan(&rack_id, plan).await?;
            }
        }
        MembershipEvent::PowerOwnerChanged { machine_id, rack_id } => {
            debug!("电源归属: machine={}, rack={:?}", machine_id, rack_id);
        }
    }
    Ok(())
}

/// 事件丢失后按当前内存状态重新写库并下发
async fn resync(state: &AppState) {
    for node in state.membership.list().await {
        if let Err(e) = persist_controller(&*state.sea_db, &node).await {
            error!("写入控制器 {} 失败: {}", node.system_id, e);
        }
    }
    for vlan in state.registry.list_vlans().await {
        if let Err(e) = persist_vlan(&*state.sea_db, &vlan).await {
            error!("写入 VLAN {} 失败: {}", vlan.id, e);
        }
    }
    for rack_id in state.rack_manager.list_racks().await {
        let plan = state.membership.rpc_plan(&rack_id).await;
        if let Err(e) = state.rack_manager.push_rpc_plan(&rack_id, plan).await {
            warn!("向机架 {} 下发 RPC 计划失败: {}", rack_id, e);
        }
    }
    state.rack_manager.push_configuration_all(&state.membership).await;
}

/// 启动心跳检查任务：同步区域控制器之间的心跳，再标记超时节点
pub fn start_liveness_monitor(state: AppState, check_interval: Duration) {
    tokio::spawn(async move {
        let service = ControllerService::new(state.clone());
        let mut interval = tokio::time::interval(check_interval);
        loop {
            interval.tick().await;

            if let Err(e) = service.sync_heartbeats(Utc::now()).await {
                warn!("同步控制器心跳失败: {}", e);
            }
            let timeout = state.membership.settings().await.heartbeat_timeout();
            match state.membership.mark_stale(Utc::now(), timeout).await {
                Ok(stale) if !stale.is_empty() => {
                    warn!("心跳监控: {} 个控制器超时离线: {:?}", stale.len(), stale);
                }
                Ok(_) => {}
                Err(e) => warn!("心跳监控: 重新平衡失败: {}", e),
            }
        }
    });
}

/// 拓扑版本变化后向所有机架下发配置
async fn topology_push(state: AppState) {
    let mut versions = state.registry.subscribe();
    while versions.changed().await.is_ok() {
        tokio::time::sleep(PUSH_DEBOUNCE).await;
        let version = *versions.borrow_and_update();
        let pushed = state.rack_manager.push_configuration_all(&state.membership).await;
        debug!("拓扑 version={} 已下发到 {} 个机架", version, pushed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::models::ControllerRole;
    use sea_orm::{DatabaseBackend, MockDatabase, MockExecResult};

    #[test]
    fn test_delete_query_defaults_to_not_forced() {
        let query: DeleteControllerQuery = serde_json::from_str("{}").unwrap();
        assert!(!query.force);
    }

    #[test]
    fn test_vlan_dhcp_dto() {
        let dto: VlanDhcpDto =
            serde_json::from_str(r#"{"dhcp_on": true, "primary_rack": "rack-1"}"#).unwrap();
        assert!(dto.dhcp_on);
        assert_eq!(dto.primary_rack.as_deref(), Some("rack-1"));
        assert!(dto.secondary_rack.is_none());
    }

    fn region_row(system_id: &str, heartbeat: DateTime<Utc>) -> controller::Model {
        let at: DateTimeWithTimeZone = heartbeat.into();
        controller::Model {
            system_id: system_id.to_string(),
            hostname: system_id.to_string(),
            role: "region".to_string(),
            rpc_endpoint: Some(format!("ws://{}:5250/ws/rack", system_id)),
            services: serde_json::json!([]),
            vlans: serde_json::json!([]),
            online: true,
            last_heartbeat: at,
            created_at: at,
            updated_at: at,
        }
    }

    fn region_node(system_id: &str, heartbeat: DateTime<Utc>) -> ControllerNode {
        ControllerNode::try_from(region_row(system_id, heartbeat)).unwrap()
    }

    #[tokio::test]
    async fn test_two_regions_share_rack_rpc_plan() {
        let now = Utc::now();
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_exec_results([MockExecResult {
                last_insert_id: 0,
                rows_affected: 1,
            }])
            .append_query_results([vec![
                region_row("region-test", now),
                region_row("region-peer", now),
            ]])
            .into_connection();
        let mut state = AppState::for_tests();
        state.sea_db = std::sync::Arc::new(db);

        let started = now - chrono::Duration::seconds(30);
        let mut rack = region_node("rack-1", started);
        rack.role = ControllerRole::Rack;
        state
            .membership
            .restore(vec![
                region_node("region-test", started),
                region_node("region-peer", started),
                rack.clone(),
            ])
            .await;
        state.membership.register(rack).await.unwrap();
        state
            .membership
            .heartbeat("region-test", None, started)
            .await
            .unwrap();
        assert_eq!(state.membership.rpc_plan("rack-1").await.len(), 1);

        let revived = ControllerService::new(state.clone())
            .sync_heartbeats(now)
            .await
            .unwrap();
        assert_eq!(revived, vec!["region-peer".to_string()]);

        let plan = state.membership.rpc_plan("rack-1").await;
        assert_eq!(plan.len(), 2);
        assert!(plan.contains(&"ws://region-peer:5250/ws/rack".to_string()));
    }
}
