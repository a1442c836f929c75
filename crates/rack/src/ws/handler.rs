/// RPC 请求处理器
///
/// 区域控制器下发到机架的方法：DHCP 配置、电源操作、对端租约复制、RPC 计划

use common::models::{FullLeaseSync, LeaseUpdate, LeaseUpdateAck, VlanId};
use common::ws_rpc::{
    methods, ConfigureDhcpRequest, ConfigureDhcpResponse, FullSyncAck, PeerEnvelope, PeerPing,
    PeerPong, PowerActionRequest, PowerActionResponse, RegisterResponse, RpcError,
    RpcPlanNotification, RpcRouter,
};
use common::{Error, Result, SubnetRegistry};
use std::sync::Arc;
use tracing::{error, info, warn};

use super::pool::RegionPool;
use crate::dhcp::{DhcpService, FailoverPeer};
use crate::power::PowerManager;

pub struct RackHandlers {
    local_id: String,
    registry: Arc<SubnetRegistry>,
    dhcp: Arc<DhcpService>,
    power: Arc<PowerManager>,
    pool: Arc<RegionPool>,
}

impl RackHandlers {
    pub fn new(
        local_id: impl Into<String>,
        registry: Arc<SubnetRegistry>,
        dhcp: Arc<DhcpService>,
        power: Arc<PowerManager>,
        pool: Arc<RegionPool>,
    ) -> Self {
        Self {
            local_id: local_id.into(),
            registry,
            dhcp,
            power,
            pool,
        }
    }

    /// 注册所有方法
    pub async fn router(self: &Arc<Self>) -> RpcRouter {
        let router = RpcRouter::new();

        let this = self.clone();
        router
            .register_typed(methods::CONFIGURE_DHCP, move |req: ConfigureDhcpRequest| {
                let this = this.clone();
                async move { this.configure_dhcp(req).await.map_err(RpcError::from) }
            })
            .await;

        let this = self.clone();
        router
            .register_typed(methods::POWER_ACTION, move |req: PowerActionRequest| {
                let this = this.clone();
                async move { this.power_action(req).await.map_err(RpcError::from) }
            })
            .await;

        let this = self.clone();
        router
            .register_typed(
                methods::APPLY_LEASE_UPDATE,
                move |req: PeerEnvelope<LeaseUpdate>| {
                    let this = this.clone();
                    async move { this.apply_lease_update(req).await.map_err(RpcError::from) }
                },
            )
            .await;

        let this = self.clone();
        router
            .register_typed(
                methods::APPLY_FULL_SYNC,
                move |req: PeerEnvelope<FullLeaseSync>| {
                    let this = this.clone();
                    async move { this.apply_full_sync(req).await.map_err(RpcError::from) }
                },
            )
            .await;

        let this = self.clone();
        router
            .register_typed(methods::PEER_PING, move |req: PeerEnvelope<PeerPing>| {
                let this = this.clone();
                async move { this.peer_ping(req).await.map_err(RpcError::from) }
            })
            .await;

        let this = self.clone();
        router
            .register_typed(methods::RPC_PLAN, move |req: RpcPlanNotification| {
                let this = this.clone();
                async move {
                    this.pool.set_plan(req.regions).await;
                    Ok(())
                }
            })
            .await;

        router
    }

    /// 注册成功后应用区域控制器下发的拓扑、配置和 RPC 计划
    pub async fn apply_registration(&self, response: RegisterResponse) {
        self.pool.set_plan(response.rpc_plan).await;

        let request = ConfigureDhcpRequest {
            topology: response.topology,
            settings: response.settings,
            vlans: response.dhcp,
        };
        if let Err(e) = self.configure_dhcp(request).await {
            error!("应用注册配置失败: {}", e);
        }
    }

    async fn configure_dhcp(&self, req: ConfigureDhcpRequest) -> Result<ConfigureDhcpResponse> {
        info!(
            "📋 应用 DHCP 配置: topology_version={}, vlans={}",
            req.topology.version,
            req.vlans.len()
        );
        self.registry.restore(req.topology).await?;
        let configured = self.dhcp.configure(&req.vlans, &req.settings).await;
        Ok(ConfigureDhcpResponse { configured })
    }

    async fn power_action(&self, req: PowerActionRequest) -> Result<PowerActionResponse> {
        let power_state = self
            .power
            .execute(&req.machine_id, req.action, req.power_type, &req.parameters)
            .await?;
        Ok(PowerActionResponse {
            machine_id: req.machine_id,
            power_state,
        })
    }

    /// 对端消息必须发给本机
    async fn peer_for(&self, to: &str, vlan_id: VlanId) -> Result<Arc<FailoverPeer>> {
        if to != self.local_id {
            warn!("收到发给其他机架的对端消息: to={}, local={}", to, self.local_id);
            return Err(Error::InvalidArgument(format!("消息目标不是本机: {}", to)));
        }
        self.dhcp
            .peer(vlan_id)
            .await
            .ok_or_else(|| Error::NotFound(format!("VLAN {} 未启用 DHCP", vlan_id)))
    }

    async fn apply_lease_update(&self, req: PeerEnvelope<LeaseUpdate>) -> Result<LeaseUpdateAck> {
        let peer = self.peer_for(&req.to, req.body.vlan_id).await?;
        peer.apply_update(&req.from, req.body).await
    }

    async fn apply_full_sync(&self, req: PeerEnvelope<FullLeaseSync>) -> Result<FullSyncAck> {
        let peer = self.peer_for(&req.to, req.body.vlan_id).await?;
        peer.apply_full_sync(&req.from, req.body).await
    }

    async fn peer_ping(&self, req: PeerEnvelope<PeerPing>) -> Result<PeerPong> {
        let peer = self.peer_for(&req.to, req.body.vlan_id).await?;
        peer.handle_ping(&req.from, req.body).await
    }
}
