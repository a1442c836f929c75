/// DHCP 主备（failover）状态机
///
/// 每个启用 DHCP 的 VLAN 一个实例。状态：
/// SINGLE / PAIRED_SYNCING / PAIRED_ACTIVE / DEGRADED / DISABLED
///
/// 请求分配按 RFC 3074 的 MAC 哈希桶；成对运行时地址按子网偏移划分归属，
/// 只有地址的归属方可以写入新租约，因此两端同时应答也不会分出重复地址。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::models::{
    DhcpRole, FullLeaseSync, Lease, LeaseUpdate, LeaseUpdateAck, MacAddress, Subnet, SubnetId,
    VlanId,
};
use common::settings::ClusterSettings;
use common::ws_rpc::{FullSyncAck, PeerPing, PeerPong, VlanDhcpConfig};
use common::{Error, Result};
use serde::Serialize;
use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::lease::{EventOrigin, LeaseEvent, LeaseStore};

/// RFC 3074 负载均衡哈希表
const LOADB_MX_TBL: [u8; 256] = [
    251, 175, 119, 215, 81, 14, 79, 191, 103, 49, 181, 143, 186, 157, 0, 232, 31, 32, 55, 60,
    152, 58, 17, 237, 174, 70, 160, 144, 220, 90, 57, 223, 59, 3, 18, 140, 111, 166, 203, 196,
    134, 243, 124, 95, 222, 179, 197, 65, 180, 48, 36, 15, 107, 46, 233, 130, 165, 30, 123, 161,
    209, 23, 97, 16, 40, 91, 219, 61, 100, 10, 210, 109, 250, 127, 22, 138, 29, 108, 244, 67,
    207, 9, 178, 204, 74, 98, 126, 249, 167, 116, 34, 77, 193, 200, 121, 5, 20, 113, 71, 35,
    128, 13, 182, 94, 25, 226, 227, 199, 75, 27, 41, 245, 230, 224, 43, 225, 177, 26, 155, 150,
    212, 142, 218, 115, 241, 73, 88, 105, 39, 114, 62, 255, 192, 201, 145, 214, 168, 158, 221,
    148, 154, 122, 12, 84, 82, 163, 44, 139, 228, 236, 205, 242, 217, 11, 187, 146, 159, 64, 86,
    239, 195, 42, 106, 198, 118, 112, 184, 172, 87, 2, 173, 117, 176, 229, 247, 253, 137, 185,
    99, 164, 102, 147, 45, 66, 231, 52, 141, 211, 194, 206, 246, 238, 56, 110, 78, 248, 63, 240,
    189, 93, 92, 51, 53, 183, 19, 171, 72, 50, 33, 104, 101, 69, 8, 252, 83, 120, 76, 135, 85,
    54, 202, 125, 188, 213, 96, 235, 136, 208, 162, 129, 190, 132, 156, 38, 47, 1, 7, 254, 24, 4,
    216, 131, 89, 21, 28, 133, 37, 153, 149, 80, 170, 68, 6, 169, 234, 151,
];

/// 客户端 MAC 的负载均衡桶（0-255）
pub fn load_balance_bucket(mac: &MacAddress) -> u8 {
    mac.octets()
        .iter()
        .fold(0u8, |hash, byte| LOADB_MX_TBL[(hash ^ byte) as usize])
}

/// 时钟
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailoverState {
    Single,
    PairedSyncing,
    PairedActive,
    Degraded,
    Disabled,
}

impl FailoverState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailoverState::Single => "SINGLE",
            FailoverState::PairedSyncing => "PAIRED_SYNCING",
            FailoverState::PairedActive => "PAIRED_ACTIVE",
            FailoverState::Degraded => "DEGRADED",
            FailoverState::Disabled => "DISABLED",
        }
    }

    pub fn is_paired(&self) -> bool {
        matches!(self, FailoverState::PairedSyncing | FailoverState::PairedActive)
    }
}

/// 单个 VLAN 的主备配置
#[derive(Debug, Clone)]
pub struct FailoverConfig {
    pub vlan_id: VlanId,
    pub local_id: String,
    /// 本机在该 VLAN 上的服务器地址（option 54）
    pub server_ip: Ipv4Addr,
    pub enabled: bool,
    pub role: DhcpRole,
    pub partner: Option<String>,
    pub split: u8,
    pub subnets: Vec<SubnetId>,
    pub max_response_delay: Duration,
    pub max_unacked_updates: usize,
    pub load_balance_max_secs: u16,
}

impl FailoverConfig {
    pub fn from_rpc(
        local_id: &str,
        server_ip: Ipv4Addr,
        vlan: &VlanDhcpConfig,
        settings: &ClusterSettings,
    ) -> Self {
        Self {
            vlan_id: vlan.vlan_id,
            local_id: local_id.to_string(),
            server_ip,
            enabled: vlan.enabled,
            role: vlan.role,
            partner: vlan.partner.clone(),
            split: vlan.split,
            subnets: vlan.subnets.clone(),
            max_response_delay: Duration::from_secs(settings.max_response_delay),
            max_unacked_updates: settings.max_unacked_updates,
            load_balance_max_secs: settings.load_balance_max_seconds,
        }
    }

    fn initial_state(&self) -> FailoverState {
        if !self.enabled {
            FailoverState::Disabled
        } else if self.partner.is_none() {
            FailoverState::Single
        } else {
            FailoverState::PairedSyncing
        }
    }

    /// 该桶是否由主控负责；split = 255 时主控负责全部
    fn primary_serves_bucket(&self, bucket: u8) -> bool {
        self.split == u8::MAX || bucket < self.split
    }

    /// 该地址是否归主控所有
    fn primary_owns_offset(&self, offset: u32) -> bool {
        self.split == u8::MAX || (offset % 256) < self.split as u32
    }
}

/// 机架之间的复制通道（生产环境经区域控制器中转）
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn send_update(&self, to: &str, update: LeaseUpdate) -> Result<LeaseUpdateAck>;
    async fn send_full_sync(&self, to: &str, sync: FullLeaseSync) -> Result<FullSyncAck>;
    async fn ping(&self, to: &str, ping: PeerPing) -> Result<PeerPong>;
}

/// 交给状态机的 DHCP 请求
#[derive(Debug, Clone)]
pub struct ClientRequest {
    pub mac: MacAddress,
    pub secs: u16,
    /// option 50
    pub requested_ip: Option<Ipv4Addr>,
    /// ciaddr（续租）
    pub client_ip: Option<Ipv4Addr>,
    /// option 54
    pub server_id: Option<Ipv4Addr>,
    pub hostname: Option<String>,
    /// 由 giaddr 确定的子网
    pub subnet_hint: Option<SubnetId>,
}

impl ClientRequest {
    pub fn new(mac: MacAddress) -> Self {
        Self {
            mac,
            secs: 0,
            requested_ip: None,
            client_ip: None,
            server_id: None,
            hostname: None,
            subnet_hint: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestOutcome {
    Ack(Lease),
    Nak(String),
}

struct PeerState {
    state: FailoverState,
    last_peer_contact: DateTime<Utc>,
    /// 最近分配的出站序号
    next_seq: u64,
    /// 最近应用的入站序号
    recv_seq: u64,
    unacked: VecDeque<LeaseUpdate>,
    /// 需要向对端推送全量租约表
    push_pending: bool,
}

/// 单个 VLAN 的主备实例
pub struct FailoverPeer {
    config: RwLock<FailoverConfig>,
    inner: Mutex<PeerState>,
    store: Arc<LeaseStore>,
    transport: Arc<dyn PeerTransport>,
    /// 复制任务已处理到的存储 revision
    settled: watch::Sender<u64>,
    clock: Clock,
    cancel: CancellationToken,
}

impl FailoverPeer {
    pub fn new(
        config: FailoverConfig,
        store: Arc<LeaseStore>,
        transport: Arc<dyn PeerTransport>,
    ) -> Arc<Self> {
        Self::with_clock(config, store, transport, system_clock())
    }

    pub fn with_clock(
        config: FailoverConfig,
        store: Arc<LeaseStore>,
        transport: Arc<dyn PeerTransport>,
        clock: Clock,
    ) -> Arc<Self> {
        let state = config.initial_state();
        let push_pending = state.is_paired() && config.role == DhcpRole::Primary;
        let (settled, _) = watch::channel(0);

        info!(
            "🔧 DHCP 实例: vlan={}, role={:?}, partner={:?}, split={}, state={}",
            config.vlan_id,
            config.role,
            config.partner,
            config.split,
            state.as_str()
        );

        Arc::new(Self {
            inner: Mutex::new(PeerState {
                state,
                last_peer_contact: clock(),
                next_seq: 0,
                recv_seq: 0,
                unacked: VecDeque::new(),
                push_pending,
            }),
            config: RwLock::new(config),
            store,
            transport,
            settled,
            clock,
            cancel: CancellationToken::new(),
        })
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    pub async fn state(&self) -> FailoverState {
        self.inner.lock().await.state
    }

    pub async fn vlan_id(&self) -> VlanId {
        self.config.read().await.vlan_id
    }

    pub async fn config(&self) -> FailoverConfig {
        self.config.read().await.clone()
    }

    /// 启动复制任务：消费本地租约事件并按序发往对端
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let peer = self.clone();
        let mut events = self.store.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = peer.cancel.cancelled() => break,
                    received = events.recv() => match received {
                        Ok(event) => peer.replicate_event(event).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("⚠️ 复制任务落后 {} 条事件，改为全量同步", skipped);
                            let mut st = peer.inner.lock().await;
                            st.unacked.clear();
                            st.push_pending = true;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
            debug!("复制任务结束");
        })
    }

    /// 停止后台任务
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    // ========================================================================
    // 配置
    // ========================================================================

    /// 应用区域控制器下发的新配置
    pub async fn reconfigure(&self, new: FailoverConfig) {
        let mut config = self.config.write().await;
        let mut st = self.inner.lock().await;
        let previous = st.state;

        let next = if !new.enabled {
            FailoverState::Disabled
        } else if new.partner.is_none() {
            FailoverState::Single
        } else if previous.is_paired() && config.partner == new.partner {
            previous
        } else if previous == FailoverState::Degraded && config.partner == new.partner {
            FailoverState::Degraded
        } else {
            st.recv_seq = 0;
            st.unacked.clear();
            st.push_pending = new.role == DhcpRole::Primary;
            st.last_peer_contact = self.now();
            FailoverState::PairedSyncing
        };

        if !next.is_paired() && next != FailoverState::Degraded {
            st.unacked.clear();
            st.push_pending = false;
        }
        st.state = next;
        *config = new;

        if previous != next {
            info!(
                "🔁 DHCP 状态变更: vlan={}, {} -> {}",
                config.vlan_id,
                previous.as_str(),
                next.as_str()
            );
        }
    }

    // ========================================================================
    // 应答策略
    // ========================================================================

    fn should_answer(state: FailoverState, config: &FailoverConfig, mac: &MacAddress, secs: u16) -> bool {
        match state {
            FailoverState::Disabled => false,
            FailoverState::Single | FailoverState::Degraded => true,
            FailoverState::PairedSyncing | FailoverState::PairedActive => {
                let primary = config.primary_serves_bucket(load_balance_bucket(mac));
                let mine = match config.role {
                    DhcpRole::Primary => primary,
                    DhcpRole::Secondary => !primary,
                };
                mine || secs >= config.load_balance_max_secs
            }
        }
    }

    fn owns_address(state: FailoverState, config: &FailoverConfig, subnet: &Subnet, ip: Ipv4Addr) -> bool {
        match state {
            FailoverState::Disabled => false,
            FailoverState::Single | FailoverState::Degraded => true,
            FailoverState::PairedSyncing | FailoverState::PairedActive => {
                let primary = config.primary_owns_offset(subnet.offset_of(ip));
                match config.role {
                    DhcpRole::Primary => primary,
                    DhcpRole::Secondary => !primary,
                }
            }
        }
    }

    // ========================================================================
    // DHCP 处理
    // ========================================================================

    /// DISCOVER：返回要 OFFER 的租约，None 表示保持沉默
    pub async fn handle_discover(&self, request: &ClientRequest) -> Result<Option<Lease>> {
        let state = self.state().await;
        let config = self.config.read().await.clone();

        if !Self::should_answer(state, &config, &request.mac, request.secs) {
            debug!(
                "DISCOVER 不由本端应答: vlan={}, mac={}, state={}",
                config.vlan_id,
                request.mac,
                state.as_str()
            );
            return Ok(None);
        }

        let subnets = match request.subnet_hint {
            Some(subnet) => vec![subnet],
            None => config.subnets.clone(),
        };
        let now = self.now();
        let owns = {
            let config = config.clone();
            move |subnet: &Subnet, ip: Ipv4Addr| Self::owns_address(state, &config, subnet, ip)
        };

        let mut last_subnet = 0;
        for subnet_id in subnets {
            last_subnet = subnet_id;
            match self
                .store
                .allocate_filtered(request.mac, subnet_id, now, &owns)
                .await
            {
                Ok(lease) => return Ok(Some(lease)),
                Err(Error::NoAddressAvailable { .. }) => continue,
                Err(e) => return Err(e),
            }
        }

        if state.is_paired() {
            // 本端的地址份额用尽，由对端应答
            debug!("本端地址份额已用尽: vlan={}, mac={}", config.vlan_id, request.mac);
            return Ok(None);
        }
        Err(Error::NoAddressAvailable {
            subnet_id: last_subnet,
        })
    }

    /// REQUEST：ACK 在返回前同步复制到对端（最多等待 max_response_delay）
    pub async fn handle_request(&self, request: &ClientRequest) -> Result<Option<RequestOutcome>> {
        let state = self.state().await;
        if state == FailoverState::Disabled {
            return Ok(None);
        }
        let config = self.config.read().await.clone();
        let now = self.now();

        if let Some(server_id) = request.server_id {
            if server_id != config.server_ip {
                // 客户端选择了其他服务器；只回收自己发出的 OFFER，
                // 对端的 OFFER 由对端 ACK，本地只等复制
                if let Some(ip) = request.requested_ip {
                    let ours = match self.store.registry().subnet_for_ip(ip).await {
                        Some(subnet) => Self::owns_address(state, &config, &subnet, ip),
                        None => false,
                    };
                    if ours {
                        self.store.nak(request.mac, ip, now).await?;
                    }
                }
                return Ok(None);
            }
        }

        let Some(ip) = request.requested_ip.or(request.client_ip) else {
            return Ok(Some(RequestOutcome::Nak("缺少请求地址".to_string())));
        };

        match self
            .store
            .ack(request.mac, ip, request.hostname.clone(), now)
            .await
        {
            Ok((lease, revision)) => {
                if state.is_paired() {
                    self.wait_replicated(revision, config.max_response_delay).await;
                }
                Ok(Some(RequestOutcome::Ack(lease)))
            }
            Err(Error::LeaseNotFound(_)) => {
                if Self::should_answer(state, &config, &request.mac, request.secs) {
                    Ok(Some(RequestOutcome::Nak(format!("{} 没有有效租约", ip))))
                } else {
                    Ok(None)
                }
            }
            Err(e) => Err(e),
        }
    }

    pub async fn handle_release(&self, mac: MacAddress) -> Result<Option<Lease>> {
        self.store.release(mac, self.now()).await
    }

    pub async fn handle_decline(&self, mac: MacAddress, ip: Ipv4Addr) -> Result<Option<Lease>> {
        self.store.decline(mac, ip, self.now()).await
    }

    async fn wait_replicated(&self, revision: u64, limit: Duration) {
        let mut rx = self.settled.subscribe();
        let timed_out = tokio::time::timeout(limit, rx.wait_for(|settled| *settled >= revision))
            .await
            .is_err();
        if timed_out {
            warn!("⚠️ ACK 复制等待超时: revision={}", revision);
        }
    }

    // ========================================================================
    // 出站复制
    // ========================================================================

    async fn replicate_event(&self, event: LeaseEvent) {
        let revision = event.revision;
        let config = self.config.read().await.clone();

        if event.origin == EventOrigin::Local && event.lease.vlan_id == config.vlan_id {
            let send_now = {
                let mut st = self.inner.lock().await;
                if st.state.is_paired() {
                    st.next_seq += 1;
                    let update = LeaseUpdate {
                        vlan_id: config.vlan_id,
                        seq: st.next_seq,
                        lease: event.lease,
                    };
                    st.unacked.push_back(update);

                    if st.unacked.len() > config.max_unacked_updates {
                        warn!(
                            "⚠️ 未确认更新超过 {} 条，升级为全量同步: vlan={}",
                            config.max_unacked_updates, config.vlan_id
                        );
                        st.unacked.clear();
                        st.push_pending = true;
                    }
                    !st.push_pending
                } else {
                    false
                }
            };

            if send_now {
                self.flush_unacked(&config).await;
            }
        }

        self.settled.send_replace(revision);
    }

    /// 按序重发未确认的更新，遇到失败即停止
    async fn flush_unacked(&self, config: &FailoverConfig) {
        let Some(partner) = config.partner.clone() else {
            return;
        };

        loop {
            let next = {
                let st = self.inner.lock().await;
                if st.push_pending || !st.state.is_paired() {
                    return;
                }
                match st.unacked.front() {
                    Some(update) => update.clone(),
                    None => return,
                }
            };

            match self.transport.send_update(&partner, next.clone()).await {
                Ok(ack) => {
                    let mut st = self.inner.lock().await;
                    st.last_peer_contact = self.now();
                    while st
                        .unacked
                        .front()
                        .map(|u| u.seq <= ack.applied_seq)
                        .unwrap_or(false)
                    {
                        st.unacked.pop_front();
                    }
                    if ack.applied_seq < next.seq {
                        // 对端没有应用这条，等待全量同步
                        st.push_pending = true;
                        return;
                    }
                }
                Err(Error::PeerDiverged {
                    expected, received, ..
                }) => {
                    warn!(
                        "⚠️ 对端复制分叉: vlan={}, expected={}, received={}，改为全量同步",
                        config.vlan_id, expected, received
                    );
                    let mut st = self.inner.lock().await;
                    st.unacked.clear();
                    st.push_pending = true;
                    return;
                }
                Err(e) => {
                    debug!("复制更新发送失败: vlan={}, seq={}, error={}", config.vlan_id, next.seq, e);
                    return;
                }
            }
        }
    }

    /// 推送全量租约表
    pub async fn push_full_table(&self) -> Result<()> {
        let config = self.config.read().await.clone();
        let Some(partner) = config.partner.clone() else {
            return Ok(());
        };

        // 先取序号再取快照：序号之前处理过的事件一定在快照里
        let seq = self.inner.lock().await.next_seq;
        let leases = self.store.snapshot_vlan(config.vlan_id).await;
        let count = leases.len();

        let ack = self
            .transport
            .send_full_sync(
                &partner,
                FullLeaseSync {
                    vlan_id: config.vlan_id,
                    seq,
                    leases,
                },
            )
            .await?;

        {
            let mut st = self.inner.lock().await;
            st.push_pending = false;
            st.last_peer_contact = self.now();
            st.unacked.retain(|u| u.seq > seq);
            if st.state == FailoverState::PairedSyncing {
                st.state = FailoverState::PairedActive;
                info!(
                    "✅ 全量同步完成: vlan={}, 推送 {} 条, 对端合并 {} 条, 状态 -> PAIRED_ACTIVE",
                    config.vlan_id, count, ack.merged
                );
            }
        }

        self.flush_unacked(&config).await;
        Ok(())
    }

    // ========================================================================
    // 入站（来自对端）
    // ========================================================================

    async fn check_partner(&self, from: &str) -> Result<()> {
        let config = self.config.read().await;
        if config.partner.as_deref() != Some(from) {
            return Err(Error::InvalidArgument(format!(
                "{} 不是 VLAN {} 的对端",
                from, config.vlan_id
            )));
        }
        Ok(())
    }

    /// 收到对端的任何消息
    async fn on_peer_contact(&self) {
        let vlan_id = self.config.read().await.vlan_id;
        let mut st = self.inner.lock().await;
        st.last_peer_contact = self.now();

        if st.state == FailoverState::Degraded {
            st.state = FailoverState::PairedSyncing;
            st.push_pending = true;
            st.unacked.clear();
            info!("🔗 对端恢复: vlan={}, DEGRADED -> PAIRED_SYNCING", vlan_id);
        }
    }

    pub async fn handle_ping(&self, from: &str, ping: PeerPing) -> Result<PeerPong> {
        self.check_partner(from).await?;
        self.on_peer_contact().await;

        let st = self.inner.lock().await;
        debug!("收到对端心跳: vlan={}, from={}, seq={}", ping.vlan_id, from, ping.seq);
        Ok(PeerPong {
            vlan_id: ping.vlan_id,
            state: st.state.as_str().to_string(),
            applied_seq: st.recv_seq,
        })
    }

    /// 按序应用对端的单条更新；出现缺口返回 PeerDiverged
    pub async fn apply_update(&self, from: &str, update: LeaseUpdate) -> Result<LeaseUpdateAck> {
        self.check_partner(from).await?;
        self.on_peer_contact().await;

        let mut st = self.inner.lock().await;
        let expected = st.recv_seq + 1;

        if update.seq < expected {
            // 重复投递
            return Ok(LeaseUpdateAck {
                vlan_id: update.vlan_id,
                applied_seq: st.recv_seq,
            });
        }
        if update.seq > expected {
            return Err(Error::PeerDiverged {
                vlan_id: update.vlan_id,
                expected,
                received: update.seq,
            });
        }

        self.store.apply_replicated(update.lease).await?;
        st.recv_seq = update.seq;
        Ok(LeaseUpdateAck {
            vlan_id: update.vlan_id,
            applied_seq: st.recv_seq,
        })
    }

    /// 合并对端推送的全量租约表
    pub async fn apply_full_sync(&self, from: &str, sync: FullLeaseSync) -> Result<FullSyncAck> {
        self.check_partner(from).await?;
        self.on_peer_contact().await;

        let received = sync.leases.len();
        let merged = self.store.merge_snapshot(sync.leases).await?;

        let mut st = self.inner.lock().await;
        st.recv_seq = sync.seq;
        if st.state == FailoverState::PairedSyncing && !st.push_pending {
            st.state = FailoverState::PairedActive;
        }
        info!(
            "📥 合并对端租约表: vlan={}, 收到 {} 条, 更新 {} 条, state={}",
            sync.vlan_id,
            received,
            merged,
            st.state.as_str()
        );

        Ok(FullSyncAck {
            vlan_id: sync.vlan_id,
            merged,
            applied_seq: st.recv_seq,
        })
    }

    // ========================================================================
    // 存活检测
    // ========================================================================

    /// 超过 max_response_delay 没有对端消息则进入 DEGRADED
    pub async fn tick(&self) -> FailoverState {
        let config = self.config.read().await.clone();
        let now = self.now();
        let mut st = self.inner.lock().await;

        if st.state.is_paired() {
            let silent = now - st.last_peer_contact;
            let limit = chrono::Duration::from_std(config.max_response_delay)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
            if silent > limit {
                warn!(
                    "⚠️ 对端 {:?} 已 {} 秒无响应: vlan={}, {} -> DEGRADED，本端应答全部请求",
                    config.partner,
                    silent.num_seconds(),
                    config.vlan_id,
                    st.state.as_str()
                );
                st.state = FailoverState::Degraded;
                st.unacked.clear();
            }
        }
        st.state
    }

    /// 周期任务：检测超时、探测对端、必要时推送全量表
    pub async fn heartbeat(&self) {
        let state = self.tick().await;
        let config = self.config.read().await.clone();
        let Some(partner) = config.partner.clone() else {
            return;
        };
        if matches!(state, FailoverState::Disabled | FailoverState::Single) {
            return;
        }

        let seq = self.inner.lock().await.next_seq;
        let ping = PeerPing {
            vlan_id: config.vlan_id,
            seq,
        };
        match self.transport.ping(&partner, ping).await {
            Ok(_) => self.on_peer_contact().await,
            Err(e) => {
                debug!("对端心跳失败: vlan={}, partner={}, error={}", config.vlan_id, partner, e);
                return;
            }
        }

        let push = {
            let st = self.inner.lock().await;
            st.push_pending && st.state.is_paired()
        };
        if push {
            if let Err(e) = self.push_full_table().await {
                warn!("全量同步失败: vlan={}, error={}", config.vlan_id, e);
            }
        } else {
            self.flush_unacked(&config).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::models::{IpRangeType, LeaseState};
    use common::topology::NewSubnet;
    use common::SubnetRegistry;
    use std::collections::{HashMap, HashSet};

    /// 内存中的对端网络，可以模拟某个机架断开
    #[derive(Default)]
    struct Network {
        peers: RwLock<HashMap<String, Arc<FailoverPeer>>>,
        down: RwLock<HashSet<String>>,
    }

    impl Network {
        async fn reach(&self, from: &str, to: &str) -> Result<Arc<FailoverPeer>> {
            let down = self.down.read().await;
            if down.contains(from) || down.contains(to) {
                return Err(Error::Network(format!("{} -> {} 不可达", from, to)));
            }
            self.peers
                .read()
                .await
                .get(to)
                .cloned()
                .ok_or_else(|| Error::NotFound(to.to_string()))
        }
    }

    struct Link {
        from: String,
        net: Arc<Network>,
    }

    #[async_trait]
    impl PeerTransport for Link {
        async fn send_update(&self, to: &str, update: LeaseUpdate) -> Result<LeaseUpdateAck> {
            self.net.reach(&self.from, to).await?.apply_update(&self.from, update).await
        }

        async fn send_full_sync(&self, to: &str, sync: FullLeaseSync) -> Result<FullSyncAck> {
            self.net.reach(&self.from, to).await?.apply_full_sync(&self.from, sync).await
        }

        async fn ping(&self, to: &str, ping: PeerPing) -> Result<PeerPong> {
            self.net.reach(&self.from, to).await?.handle_ping(&self.from, ping).await
        }
    }

    struct SimClock(std::sync::Mutex<DateTime<Utc>>);

    impl SimClock {
        fn advance(&self, secs: i64) {
            let mut now = self.0.lock().unwrap();
            *now += chrono::Duration::seconds(secs);
        }
    }

    fn mac(n: u16) -> MacAddress {
        let [hi, lo] = n.to_be_bytes();
        MacAddress::new([0x52, 0x54, 0x00, 0x10, hi, lo])
    }

    async fn registry() -> (Arc<SubnetRegistry>, SubnetId, VlanId) {
        let registry = Arc::new(SubnetRegistry::new());
        let (_, vlan) = registry.create_fabric("fabric-0").await.unwrap();
        let subnet = registry
            .create_subnet(NewSubnet {
                vlan_id: vlan.id,
                cidr: "10.0.0.0/24".parse().unwrap(),
                managed: true,
                gateway_ip: Some(Ipv4Addr::new(10, 0, 0, 1)),
                dns_servers: vec![],
            })
            .await
            .unwrap();
        registry
            .add_range(
                subnet.id,
                IpRangeType::Dynamic,
                Ipv4Addr::new(10, 0, 0, 10),
                Ipv4Addr::new(10, 0, 0, 200),
                "",
            )
            .await
            .unwrap();
        (registry, subnet.id, vlan.id)
    }

    struct Rack {
        peer: Arc<FailoverPeer>,
        store: Arc<LeaseStore>,
    }

    async fn pair(split: u8) -> (Arc<Network>, Arc<SimClock>, Rack, Rack) {
        let net = Arc::new(Network::default());
        let sim = Arc::new(SimClock(std::sync::Mutex::new(Utc::now())));
        let clock: Clock = {
            let sim = sim.clone();
            Arc::new(move || *sim.0.lock().unwrap())
        };

        let mut racks = Vec::new();
        for (id, partner, role, last) in [
            ("r1", "r2", DhcpRole::Primary, 1u8),
            ("r2", "r1", DhcpRole::Secondary, 2u8),
        ] {
            let (registry, subnet, vlan) = registry().await;
            let store = Arc::new(LeaseStore::new(registry, None));
            let config = FailoverConfig {
                vlan_id: vlan,
                local_id: id.to_string(),
                server_ip: Ipv4Addr::new(10, 0, 0, last + 1),
                enabled: true,
                role,
                partner: Some(partner.to_string()),
                split,
                subnets: vec![subnet],
                max_response_delay: Duration::from_secs(60),
                max_unacked_updates: 10,
                load_balance_max_secs: 3,
            };
            let transport = Arc::new(Link {
                from: id.to_string(),
                net: net.clone(),
            });
            let peer = FailoverPeer::with_clock(config, store.clone(), transport, clock.clone());
            peer.start();
            net.peers.write().await.insert(id.to_string(), peer.clone());
            racks.push(Rack { peer, store });
        }

        let r2 = racks.pop().unwrap();
        let r1 = racks.pop().unwrap();
        (net, sim, r1, r2)
    }

    /// 客户端广播 DISCOVER，取第一个应答，然后向该服务器 REQUEST
    async fn dora(racks: &[&Rack], client: MacAddress) -> Option<Lease> {
        for rack in racks {
            let request = ClientRequest::new(client);
            if let Some(offer) = rack.peer.handle_discover(&request).await.unwrap() {
                let config = rack.peer.config().await;
                let mut req = ClientRequest::new(client);
                req.requested_ip = Some(offer.ip);
                req.server_id = Some(config.server_ip);
                return match rack.peer.handle_request(&req).await.unwrap() {
                    Some(RequestOutcome::Ack(lease)) => Some(lease),
                    other => panic!("unexpected outcome: {other:?}"),
                };
            }
        }
        None
    }

    /// 等待复制任务处理完当前所有事件
    async fn settle(rack: &Rack) {
        let revision = rack.store.revision().await;
        let mut rx = rack.peer.settled.subscribe();
        rx.wait_for(|settled| *settled >= revision).await.unwrap();
    }

    #[test]
    fn test_bucket_is_deterministic() {
        let a = load_balance_bucket(&mac(1));
        assert_eq!(a, load_balance_bucket(&mac(1)));

        let config = FailoverConfig {
            vlan_id: 1,
            local_id: "r1".into(),
            server_ip: Ipv4Addr::new(10, 0, 0, 2),
            enabled: true,
            role: DhcpRole::Primary,
            partner: Some("r2".into()),
            split: 255,
            subnets: vec![],
            max_response_delay: Duration::from_secs(60),
            max_unacked_updates: 10,
            load_balance_max_secs: 3,
        };
        // split = 255：主控负责全部桶与全部地址
        assert!((0..=255u8).all(|b| config.primary_serves_bucket(b)));
        assert!((0..1024u32).all(|o| config.primary_owns_offset(o)));

        let half = FailoverConfig { split: 128, ..config };
        assert!(half.primary_serves_bucket(127));
        assert!(!half.primary_serves_bucket(128));
        assert!(half.primary_owns_offset(300));
        assert!(!half.primary_owns_offset(200));
    }

    #[tokio::test]
    async fn test_initial_full_sync_reaches_paired_active() {
        let (_net, _sim, r1, r2) = pair(255).await;
        assert_eq!(r1.peer.state().await, FailoverState::PairedSyncing);
        assert_eq!(r2.peer.state().await, FailoverState::PairedSyncing);

        r1.peer.heartbeat().await;
        assert_eq!(r1.peer.state().await, FailoverState::PairedActive);
        assert_eq!(r2.peer.state().await, FailoverState::PairedActive);
    }

    #[tokio::test]
    async fn test_split_255_primary_answers_and_secondary_stays_silent() {
        let (_net, _sim, r1, r2) = pair(255).await;
        r1.peer.heartbeat().await;

        for n in 0..20 {
            let request = ClientRequest::new(mac(n));
            assert!(r2.peer.handle_discover(&request).await.unwrap().is_none());
            assert!(r1.peer.handle_discover(&request).await.unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn test_acked_lease_is_on_secondary_before_ack_returns() {
        let (_net, _sim, r1, r2) = pair(255).await;
        r1.peer.heartbeat().await;

        let lease = dora(&[&r1, &r2], mac(1)).await.unwrap();
        let replica = r2.store.query(lease.ip).await.unwrap();
        assert_eq!(replica.mac_address, Some(mac(1)));
        assert_eq!(replica.state, common::models::LeaseState::Acked);
    }

    #[tokio::test]
    async fn test_split_128_both_answer_without_duplicates() {
        let (_net, _sim, r1, r2) = pair(128).await;
        r1.peer.heartbeat().await;

        let mut ips = HashSet::new();
        let mut served_by_secondary = 0;
        for n in 0..120 {
            let client = mac(n);
            let from_r1 = r1.peer.handle_discover(&ClientRequest::new(client)).await.unwrap();
            let from_r2 = r2.peer.handle_discover(&ClientRequest::new(client)).await.unwrap();
            // 每个客户端只有一端应答
            assert!(from_r1.is_some() ^ from_r2.is_some());
            if from_r2.is_some() {
                served_by_secondary += 1;
            }
            let offer = from_r1.or(from_r2).unwrap();
            assert!(ips.insert(offer.ip), "重复地址 {}", offer.ip);
        }
        assert!(served_by_secondary > 0);
    }

    #[tokio::test]
    async fn test_failover_convergence_and_resync() {
        let (net, sim, r1, r2) = pair(255).await;
        r1.peer.heartbeat().await;

        let mut ips = HashSet::new();
        for n in 0..20 {
            let lease = dora(&[&r1, &r2], mac(n)).await.unwrap();
            assert!(ips.insert(lease.ip));
        }

        // R1 心跳停止
        net.down.write().await.insert("r1".to_string());
        sim.advance(30);
        r2.peer.heartbeat().await;
        assert_eq!(r2.peer.state().await, FailoverState::PairedActive);

        sim.advance(31);
        r2.peer.heartbeat().await;
        assert_eq!(r2.peer.state().await, FailoverState::Degraded);

        // R2 应答全部新的 DISCOVER，且不与 R1 分出的地址重复
        for n in 100..140 {
            let lease = dora(&[&r2], mac(n)).await.expect("secondary must answer");
            assert!(ips.insert(lease.ip), "重复地址 {}", lease.ip);
        }

        // 5 分钟后 R1 恢复
        sim.advance(300);
        net.down.write().await.remove("r1");
        r1.peer.heartbeat().await;
        r2.peer.heartbeat().await;

        assert_eq!(r1.peer.state().await, FailoverState::PairedActive);
        assert_eq!(r2.peer.state().await, FailoverState::PairedActive);

        // 没有租约丢失
        let on_r1: HashSet<Ipv4Addr> = r1.store.snapshot().await.iter().map(|l| l.ip).collect();
        let on_r2: HashSet<Ipv4Addr> = r2.store.snapshot().await.iter().map(|l| l.ip).collect();
        assert_eq!(on_r1, ips);
        assert_eq!(on_r2, ips);
    }

    #[tokio::test]
    async fn test_sequence_gap_is_reported_as_diverged() {
        let (_net, _sim, r1, r2) = pair(255).await;
        r1.peer.heartbeat().await;

        let lease = dora(&[&r1], mac(1)).await.unwrap();
        let update = LeaseUpdate {
            vlan_id: lease.vlan_id,
            seq: 1000,
            lease,
        };
        let err = r2.peer.apply_update("r1", update).await.unwrap_err();
        assert!(matches!(err, Error::PeerDiverged { received: 1000, .. }));

        // 非对端发来的消息被拒绝
        let ping = PeerPing { vlan_id: 1, seq: 0 };
        assert!(r2.peer.handle_ping("r9", ping).await.is_err());
    }

    #[tokio::test]
    async fn test_reconfigure_to_single_and_disabled() {
        let (_net, _sim, r1, _r2) = pair(255).await;

        let mut single = r1.peer.config().await;
        single.partner = None;
        r1.peer.reconfigure(single.clone()).await;
        assert_eq!(r1.peer.state().await, FailoverState::Single);

        let mut disabled = single;
        disabled.enabled = false;
        r1.peer.reconfigure(disabled).await;
        assert_eq!(r1.peer.state().await, FailoverState::Disabled);
        assert!(r1
            .peer
            .handle_discover(&ClientRequest::new(mac(1)))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_request_for_partner_offer_leaves_it_alone() {
        let (_net, _sim, r1, r2) = pair(255).await;
        r1.peer.heartbeat().await;

        let offer = r1
            .peer
            .handle_discover(&ClientRequest::new(mac(1)))
            .await
            .unwrap()
            .unwrap();
        settle(&r1).await;
        assert_eq!(r2.store.query(offer.ip).await.unwrap().state, LeaseState::Offered);

        // 广播的 REQUEST 先到达备机，server_id 指向主机
        let mut req = ClientRequest::new(mac(1));
        req.requested_ip = Some(offer.ip);
        req.server_id = Some(r1.peer.config().await.server_ip);
        assert!(r2.peer.handle_request(&req).await.unwrap().is_none());
        settle(&r2).await;
        assert_eq!(r1.store.query(offer.ip).await.unwrap().state, LeaseState::Offered);

        match r1.peer.handle_request(&req).await.unwrap() {
            Some(RequestOutcome::Ack(lease)) => assert_eq!(lease.ip, offer.ip),
            other => panic!("unexpected outcome: {other:?}"),
        }
        settle(&r2).await;

        for rack in [&r1, &r2] {
            let held = rack.store.query(offer.ip).await.unwrap();
            assert_eq!(held.state, LeaseState::Acked);
            assert_eq!(held.mac_address, Some(mac(1)));
        }

        // 地址不会再分给别的客户端
        let other = r1
            .peer
            .handle_discover(&ClientRequest::new(mac(2)))
            .await
            .unwrap()
            .unwrap();
        assert_ne!(other.ip, offer.ip);
    }

    #[tokio::test]
    async fn test_unacked_backlog_escalates_to_full_sync() {
        let (net, _sim, r1, r2) = pair(255).await;
        r1.peer.heartbeat().await;
        assert_eq!(r1.peer.state().await, FailoverState::PairedActive);

        // 对端不可达时本地继续分配，积压超过 max_unacked_updates
        net.down.write().await.insert("r2".to_string());
        let subnet = r1.peer.config().await.subnets[0];
        let mut ips = HashSet::new();
        for n in 0..15 {
            let lease = r1.store.allocate(mac(n), subnet, r1.peer.now()).await.unwrap();
            ips.insert(lease.ip);
        }
        settle(&r1).await;
        {
            let st = r1.peer.inner.lock().await;
            assert!(st.push_pending);
            assert!(st.unacked.len() <= 10);
        }
        assert!(r2.store.snapshot().await.is_empty());

        // 链路恢复后下一次心跳推送全量表
        net.down.write().await.remove("r2");
        r1.peer.heartbeat().await;

        assert!(!r1.peer.inner.lock().await.push_pending);
        assert_eq!(r1.peer.state().await, FailoverState::PairedActive);
        assert_eq!(r2.peer.state().await, FailoverState::PairedActive);
        let on_r2: HashSet<Ipv4Addr> = r2.store.snapshot().await.iter().map(|l| l.ip).collect();
        assert_eq!(on_r2, ips);
    }
}
