/// DHCP 服务
///
/// 每个启用 DHCP 的 VLAN 一个 FailoverPeer，所有 VLAN 共享一个 LeaseStore。

pub mod failover;
pub mod packet;
pub mod server;

use chrono::Utc;
use common::models::VlanId;
use common::settings::ClusterSettings;
use common::ws_rpc::VlanDhcpConfig;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::lease::{LeaseStore, LeaseTimers};

pub use failover::{ClientRequest, FailoverConfig, FailoverPeer, FailoverState, PeerTransport, RequestOutcome};
pub use server::DhcpServer;

pub struct DhcpService {
    local_id: String,
    server_ip: Ipv4Addr,
    store: Arc<LeaseStore>,
    transport: Arc<dyn PeerTransport>,
    peers: RwLock<HashMap<VlanId, Arc<FailoverPeer>>>,
    settings: RwLock<ClusterSettings>,
}

impl DhcpService {
    pub fn new(
        local_id: impl Into<String>,
        server_ip: Ipv4Addr,
        store: Arc<LeaseStore>,
        transport: Arc<dyn PeerTransport>,
    ) -> Self {
        Self {
            local_id: local_id.into(),
            server_ip,
            store,
            transport,
            peers: RwLock::new(HashMap::new()),
            settings: RwLock::new(ClusterSettings::default()),
        }
    }

    pub fn store(&self) -> &Arc<LeaseStore> {
        &self.store
    }

    pub fn server_ip(&self) -> Ipv4Addr {
        self.server_ip
    }

    /// option 51（秒）
    pub async fn lease_time(&self) -> u32 {
        u32::try_from(self.settings.read().await.lease_time).unwrap_or(u32::MAX)
    }

    pub async fn peer(&self, vlan_id: VlanId) -> Option<Arc<FailoverPeer>> {
        self.peers.read().await.get(&vlan_id).cloned()
    }

    pub async fn vlans(&self) -> Vec<VlanId> {
        let mut vlans: Vec<VlanId> = self.peers.read().await.keys().copied().collect();
        vlans.sort_unstable();
        vlans
    }

    /// 应用区域控制器下发的 DHCP 配置，返回已配置的 VLAN
    ///
    /// 新 VLAN 创建实例并启动复制任务，已有 VLAN 原地重新配置，
    /// 不再出现的 VLAN 停止。
    pub async fn configure(&self, vlans: &[VlanDhcpConfig], settings: &ClusterSettings) -> Vec<VlanId> {
        self.store
            .set_timers(LeaseTimers::from_settings(settings))
            .await;
        *self.settings.write().await = settings.clone();

        let mut peers = self.peers.write().await;
        let mut configured = Vec::with_capacity(vlans.len());

        for vlan in vlans {
            let config = FailoverConfig::from_rpc(&self.local_id, self.server_ip, vlan, settings);
            match peers.get(&vlan.vlan_id) {
                Some(peer) => peer.reconfigure(config).await,
                None => {
                    let peer = FailoverPeer::new(config, self.store.clone(), self.transport.clone());
                    peer.start();
                    peers.insert(vlan.vlan_id, peer);
                }
            }
            configured.push(vlan.vlan_id);
        }

        let stale: Vec<VlanId> = peers
            .keys()
            .filter(|id| !configured.contains(id))
            .copied()
            .collect();
        for vlan_id in stale {
            if let Some(peer) = peers.remove(&vlan_id) {
                peer.stop();
                info!("🛑 停止 VLAN {} 的 DHCP", vlan_id);
            }
        }

        info!("✅ DHCP 配置已应用: vlans={:?}", configured);
        configured
    }

    /// 周期维护：过期扫描 + 对端心跳
    pub async fn maintenance_tick(&self) {
        match self.store.expire(Utc::now()).await {
            Ok(expired) if !expired.is_empty() => debug!("过期租约 {} 条", expired.len()),
            Ok(_) => {}
            Err(e) => warn!("过期扫描失败: {}", e),
        }

        let peers: Vec<Arc<FailoverPeer>> = self.peers.read().await.values().cloned().collect();
        for peer in peers {
            peer.heartbeat().await;
        }
    }

    pub async fn run_maintenance(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.maintenance_tick().await,
            }
        }
        debug!("DHCP 维护任务结束");
    }
}
