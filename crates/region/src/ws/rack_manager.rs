/// 机架连接管理器
///
/// 负责管理所有机架控制器的 WebSocket 连接，并向机架下发 RPC

use async_trait::async_trait;
use chrono::Utc;
use common::models::PowerState;
use common::ws_rpc::{
    methods, ConfigureDhcpRequest, ConfigureDhcpResponse, PowerActionRequest,
    PowerActionResponse, RpcPlanNotification, WsRpcConnection,
};
use common::{Error, Result, RpcError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::services::membership::ControllerMembership;
use crate::services::power_coordinator::PowerDispatcher;

/// 电源操作的 RPC 等待上限；真正的硬超时由电源协调器控制
const POWER_CALL_CEILING: Duration = Duration::from_secs(600);

/// 单个机架连接
#[derive(Clone)]
pub struct RackConnection {
    pub system_id: String,
    pub hostname: String,
    /// 同一机架重连时用来区分新旧连接
    pub connection_id: String,
    pub rpc: WsRpcConnection,
    pub connected_at: chrono::DateTime<Utc>,
}

#[derive(Clone)]
pub struct RackConnectionManager {
    /// system_id -> 连接
    connections: Arc<RwLock<HashMap<String, RackConnection>>>,
    rpc_timeout: Duration,
}

impl RackConnectionManager {
    pub fn new(rpc_timeout: Duration) -> Self {
        Self {
            connections: Arc::new(RwLock::new(HashMap::new())),
            rpc_timeout,
        }
    }

    /// 登记连接；同一机架的旧连接被替换
    pub async fn register(&self, system_id: &str, hostname: &str, rpc: WsRpcConnection) -> String {
        let connection = RackConnection {
            system_id: system_id.to_string(),
            hostname: hostname.to_string(),
            connection_id: Uuid::new_v4().to_string(),
            rpc,
            connected_at: Utc::now(),
        };
        let connection_id = connection.connection_id.clone();

        let previous = self
            .connections
            .write()
            .await
            .insert(system_id.to_string(), connection);
        if let Some(previous) = previous {
            previous.rpc.clear_pending().await;
            info!("机架重连，替换旧连接: {}", system_id);
        } else {
            info!("机架已连接: {} ({})", system_id, hostname);
        }
        connection_id
    }

    /// 注销连接；只有当前连接仍是 `connection_id` 时才移除
    pub async fn unregister(&self, system_id: &str, connection_id: &str) -> bool {
        let mut connections = self.connections.write().await;
        match connections.get(system_id) {
            Some(c) if c.connection_id == connection_id => {
                if let Some(c) = connections.remove(system_id) {
                    c.rpc.clear_pending().await;
                }
                info!("机架连接已断开: {}", system_id);
                true
            }
            _ => false,
        }
    }

    pub async fn get(&self, system_id: &str) -> Option<RackConnection> {
        self.connections.read().await.get(system_id).cloned()
    }

    pub async fn is_connected(&self, system_id: &str) -> bool {
        self.connections
            .read()
            .await
            .get(system_id)
            .map(|c| !c.rpc.is_closed())
            .unwrap_or(false)
    }

    pub async fn list_racks(&self) -> Vec<String> {
        let mut racks: Vec<String> = self.connections.read().await.keys().cloned().collect();
        racks.sort();
        racks
    }

    pub async fn count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// 向指定机架发起请求
    pub async fn call<Req, Resp>(
        &self,
        system_id: &str,
        method: &str,
        request: &Req,
        timeout: Duration,
    ) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let connection = self
            .get(system_id)
            .await
            .ok_or_else(|| Error::from(RpcError::rack_offline(system_id)))?;

        debug!("📤 [Region -> Rack] 发送请求: rack={}, method={}", system_id, method);
        let response = connection
            .rpc
            .call_typed(method, request, timeout)
            .await
            .map_err(Error::from)?;
        Ok(response)
    }

    /// 默认超时的请求
    pub async fn call_default<Req, Resp>(&self, system_id: &str, method: &str, request: &Req) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        self.call(system_id, method, request, self.rpc_timeout).await
    }

    pub async fn notify(&self, system_id: &str, method: &str, payload: serde_json::Value) -> Result<()> {
        let connection = self
            .get(system_id)
            .await
            .ok_or_else(|| Error::from(RpcError::rack_offline(system_id)))?;
        debug!("📤 [Region -> Rack] 发送通知: rack={}, method={}", system_id, method);
        connection.rpc.notify(method, payload).map_err(Error::from)
    }

    // ========================================================================
    // 配置下发
    // ========================================================================

    /// 向机架下发拓扑、集群配置与该机架的 DHCP 主备角色
    pub async fn push_configuration(&self, membership: &ControllerMembership, system_id: &str) -> Result<()> {
        let request = ConfigureDhcpRequest {
            topology: membership.registry().snapshot().await,
            settings: membership.settings().await,
            vlans: membership.dhcp_configs_for(system_id).await,
        };
        let response: ConfigureDhcpResponse = self
            .call_default(system_id, methods::CONFIGURE_DHCP, &request)
            .await?;
        info!(
            "📤 DHCP 配置已下发: rack={}, vlans={:?}",
            system_id, response.configured
        );
        Ok(())
    }

    /// 向所有已连接机架下发配置，返回成功数
    pub async fn push_configuration_all(&self, membership: &ControllerMembership) -> usize {
        let mut pushed = 0;
        for system_id in self.list_racks().await {
            match self.push_configuration(membership, &system_id).await {
                Ok(()) => pushed += 1,
                Err(e) => warn!("向机架 {} 下发配置失败: {}", system_id, e),
            }
        }
        pushed
    }

    pub async fn push_rpc_plan(&self, system_id: &str, plan: Vec<String>) -> Result<()> {
        let payload = serde_json::to_value(RpcPlanNotification { regions: plan })?;
        self.notify(system_id, methods::RPC_PLAN, payload).await
    }
}

#[async_trait]
impl PowerDispatcher for RackConnectionManager {
    async fn dispatch(&self, rack_id: &str, request: PowerActionRequest) -> Result<PowerState> {
        let response: PowerActionResponse = self
            .call(rack_id, methods::POWER_ACTION, &request, POWER_CALL_CEILING)
            .await?;
        Ok(response.power_state)
    }
}
