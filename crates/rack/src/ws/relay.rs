/// 经区域控制器中转的对端通道与机器目录

use async_trait::async_trait;
use common::models::{FullLeaseSync, LeaseUpdate, LeaseUpdateAck, Machine, MacAddress};
use common::ws_rpc::{
    methods, FullSyncAck, GetBootMachineRequest, GetBootMachineResponse, PeerEnvelope, PeerPing,
    PeerPong,
};
use common::Result;
use std::sync::Arc;

use super::pool::RegionPool;
use crate::boot::MachineDirectory;
use crate::dhcp::PeerTransport;

/// 租约复制经区域控制器转发到对端机架
pub struct RegionRelay {
    local_id: String,
    pool: Arc<RegionPool>,
}

impl RegionRelay {
    pub fn new(local_id: impl Into<String>, pool: Arc<RegionPool>) -> Self {
        Self {
            local_id: local_id.into(),
            pool,
        }
    }

    fn envelope<T>(&self, to: &str, body: T) -> PeerEnvelope<T> {
        PeerEnvelope {
            from: self.local_id.clone(),
            to: to.to_string(),
            body,
        }
    }
}

#[async_trait]
impl PeerTransport for RegionRelay {
    async fn send_update(&self, to: &str, update: LeaseUpdate) -> Result<LeaseUpdateAck> {
        self.pool
            .call_typed(methods::RELAY_LEASE_UPDATE, &self.envelope(to, update))
            .await
    }

    async fn send_full_sync(&self, to: &str, sync: FullLeaseSync) -> Result<FullSyncAck> {
        self.pool
            .call_typed(methods::RELAY_FULL_SYNC, &self.envelope(to, sync))
            .await
    }

    async fn ping(&self, to: &str, ping: PeerPing) -> Result<PeerPong> {
        self.pool
            .call_typed(methods::RELAY_PEER_PING, &self.envelope(to, ping))
            .await
    }
}

/// 向区域控制器查询机器
pub struct RegionMachineDirectory {
    pool: Arc<RegionPool>,
}

impl RegionMachineDirectory {
    pub fn new(pool: Arc<RegionPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MachineDirectory for RegionMachineDirectory {
    async fn find_by_mac(&self, mac: MacAddress) -> Result<Option<Machine>> {
        let response: GetBootMachineResponse = self
            .pool
            .call_typed(
                methods::GET_BOOT_MACHINE,
                &GetBootMachineRequest { mac_address: mac },
            )
            .await?;
        Ok(response.machine)
    }
}
