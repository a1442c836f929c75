/// 租约存储
///
/// 每个子网一把锁：同一子网的分配严格串行，不同子网并行。
/// 所有变更都会在广播通道上发出 [`LeaseEvent`]，供主备复制消费。
/// ACK 状态的租约在返回前写入检查点。

use chrono::{DateTime, Duration, Utc};
use common::models::{Lease, LeaseState, MacAddress, Subnet, SubnetId, VlanId};
use common::settings::ClusterSettings;
use common::{Error, Result, SubnetRegistry};
use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, warn};

use super::checkpoint::LeaseCheckpoint;

const EVENT_CHANNEL_CAPACITY: usize = 4096;

/// 租约计时参数
#[derive(Debug, Clone, Copy)]
pub struct LeaseTimers {
    pub lease_time: Duration,
    pub offer_timeout: Duration,
    pub conflict_quarantine: Duration,
}

impl LeaseTimers {
    pub fn from_settings(settings: &ClusterSettings) -> Self {
        Self {
            lease_time: Duration::seconds(settings.lease_time as i64),
            offer_timeout: Duration::seconds(settings.offer_timeout as i64),
            conflict_quarantine: Duration::seconds(
                common::models::constants::CONFLICT_QUARANTINE as i64,
            ),
        }
    }
}

impl Default for LeaseTimers {
    fn default() -> Self {
        Self::from_settings(&ClusterSettings::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseEventKind {
    Offered,
    Acked,
    Renewed,
    Released,
    Expired,
    Declined,
    Nacked,
}

impl LeaseEventKind {
    fn for_state(state: LeaseState) -> Self {
        match state {
            LeaseState::Offered => LeaseEventKind::Offered,
            LeaseState::Acked => LeaseEventKind::Acked,
            LeaseState::Expired => LeaseEventKind::Expired,
            LeaseState::Released => LeaseEventKind::Released,
        }
    }
}

/// 事件来源：本地 DHCP 处理，或对端复制
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOrigin {
    Local,
    Replicated,
}

/// 租约变更事件
#[derive(Debug, Clone)]
pub struct LeaseEvent {
    /// 存储内单调递增
    pub revision: u64,
    pub kind: LeaseEventKind,
    pub origin: EventOrigin,
    pub lease: Lease,
}

/// 合并时的冲突规则：同一 MAC 取较新的记录；
/// 不同 MAC 时 ACKED 胜过 OFFERED，否则取较新的记录。
pub fn prefer_incoming(existing: &Lease, incoming: &Lease) -> bool {
    if existing.mac_address != incoming.mac_address {
        match (existing.state, incoming.state) {
            (LeaseState::Acked, LeaseState::Offered) => return false,
            (LeaseState::Offered, LeaseState::Acked) => return true,
            _ => {}
        }
    }
    incoming.updated_at > existing.updated_at
}

/// 复制流按序到达，时间相同的记录照常应用；只有本地记录更新时才丢弃。
/// 其他 MAC 的 ACK 不会被 OFFER 覆盖。
fn replica_is_stale(existing: &Lease, incoming: &Lease) -> bool {
    if existing.mac_address != incoming.mac_address
        && existing.state == LeaseState::Acked
        && incoming.state == LeaseState::Offered
    {
        return true;
    }
    existing.updated_at > incoming.updated_at
}

#[derive(Debug, Default)]
struct SubnetLeases {
    /// 每个地址只保留最新一条记录
    by_ip: BTreeMap<Ipv4Addr, Lease>,
}

impl SubnetLeases {
    fn is_free(&self, ip: Ipv4Addr, now: DateTime<Utc>) -> bool {
        self.by_ip
            .get(&ip)
            .map(|lease| !lease.holds_address(now))
            .unwrap_or(true)
    }

    fn active_for_mac(&mut self, mac: &MacAddress, now: DateTime<Utc>) -> Option<&mut Lease> {
        self.by_ip
            .values_mut()
            .find(|l| l.mac_address.as_ref() == Some(mac) && l.holds_address(now))
    }
}

/// 租约存储
pub struct LeaseStore {
    registry: Arc<SubnetRegistry>,
    subnets: RwLock<HashMap<SubnetId, Arc<Mutex<SubnetLeases>>>>,
    /// 需要持久化的租约（ACKED 与冲突标记）
    durable: Mutex<BTreeMap<Ipv4Addr, Lease>>,
    checkpoint: Option<LeaseCheckpoint>,
    timers: RwLock<LeaseTimers>,
    events: broadcast::Sender<LeaseEvent>,
    revision: Mutex<u64>,
}

impl LeaseStore {
    pub fn new(registry: Arc<SubnetRegistry>, checkpoint: Option<LeaseCheckpoint>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            registry,
            subnets: RwLock::new(HashMap::new()),
            durable: Mutex::new(BTreeMap::new()),
            checkpoint,
            timers: RwLock::new(LeaseTimers::default()),
            events,
            revision: Mutex::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<SubnetRegistry> {
        &self.registry
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LeaseEvent> {
        self.events.subscribe()
    }

    pub async fn set_timers(&self, timers: LeaseTimers) {
        *self.timers.write().await = timers;
    }

    pub async fn revision(&self) -> u64 {
        *self.revision.lock().await
    }

    async fn slot(&self, subnet_id: SubnetId) -> Arc<Mutex<SubnetLeases>> {
        if let Some(slot) = self.subnets.read().await.get(&subnet_id) {
            return slot.clone();
        }
        self.subnets
            .write()
            .await
            .entry(subnet_id)
            .or_default()
            .clone()
    }

    async fn slots(&self) -> Vec<Arc<Mutex<SubnetLeases>>> {
        self.subnets.read().await.values().cloned().collect()
    }

    async fn emit(&self, kind: LeaseEventKind, origin: EventOrigin, lease: Lease) -> u64 {
        let mut revision = self.revision.lock().await;
        *revision += 1;
        // 没有订阅者时发送失败是正常的
        let _ = self.events.send(LeaseEvent {
            revision: *revision,
            kind,
            origin,
            lease,
        });
        *revision
    }

    /// 更新持久化集合，有变化时写检查点
    async fn persist(&self, leases: &[Lease]) -> Result<()> {
        let mut durable = self.durable.lock().await;
        let mut changed = false;

        for lease in leases {
            if lease.state == LeaseState::Acked {
                durable.insert(lease.ip, lease.clone());
                changed = true;
            } else if durable.remove(&lease.ip).is_some() {
                changed = true;
            }
        }

        if changed {
            if let Some(checkpoint) = &self.checkpoint {
                checkpoint.save(durable.values().cloned().collect()).await?;
            }
        }
        Ok(())
    }

    /// 从检查点恢复 ACKED 租约
    pub async fn restore(&self) -> Result<usize> {
        let Some(checkpoint) = &self.checkpoint else {
            return Ok(0);
        };

        let leases = checkpoint.load().await?;
        let mut durable = self.durable.lock().await;
        let mut restored = 0;

        for lease in leases.into_iter().filter(|l| l.state == LeaseState::Acked) {
            let slot = self.slot(lease.subnet_id).await;
            slot.lock().await.by_ip.insert(lease.ip, lease.clone());
            durable.insert(lease.ip, lease);
            restored += 1;
        }

        info!("✅ 租约表已恢复: {} 条", restored);
        Ok(restored)
    }

    // ========================================================================
    // 分配
    // ========================================================================

    /// 为 MAC 在子网上分配地址（OFFERED）
    pub async fn allocate(&self, mac: MacAddress, subnet_id: SubnetId, now: DateTime<Utc>) -> Result<Lease> {
        let any = |_: &Subnet, _: Ipv4Addr| true;
        self.allocate_filtered(mac, subnet_id, now, &any).await
    }

    /// 分配地址，`owns` 限制本端可以写入的新地址
    ///
    /// 顺序：已有的有效租约 > 主机保留 > 地址池中最低的空闲地址
    pub async fn allocate_filtered(
        &self,
        mac: MacAddress,
        subnet_id: SubnetId,
        now: DateTime<Utc>,
        owns: &(dyn Fn(&Subnet, Ipv4Addr) -> bool + Send + Sync),
    ) -> Result<Lease> {
        let pool = self.registry.allocation_pool(subnet_id).await?;
        let timers = *self.timers.read().await;
        let slot = self.slot(subnet_id).await;

        let lease = {
            let mut leases = slot.lock().await;

            if let Some(existing) = leases.active_for_mac(&mac, now) {
                if existing.state == LeaseState::Offered {
                    existing.expires_at = now + timers.offer_timeout;
                    existing.updated_at = now;
                    let lease = existing.clone();
                    self.emit(LeaseEventKind::Offered, EventOrigin::Local, lease.clone())
                        .await;
                    return Ok(lease);
                }
                debug!("MAC {} 已持有租约 {}", mac, existing.ip);
                return Ok(existing.clone());
            }

            let reserved = pool
                .reservation_for(&mac)
                .filter(|ip| leases.is_free(*ip, now));
            let ip = match reserved {
                Some(ip) => ip,
                None => pool
                    .candidates()
                    .find(|ip| owns(&pool.subnet, *ip) && leases.is_free(*ip, now))
                    .ok_or(Error::NoAddressAvailable { subnet_id })?,
            };

            let lease = Lease {
                mac_address: Some(mac),
                ip,
                subnet_id,
                vlan_id: pool.subnet.vlan_id,
                state: LeaseState::Offered,
                hostname: None,
                created_at: now,
                updated_at: now,
                expires_at: now + timers.offer_timeout,
            };
            leases.by_ip.insert(ip, lease.clone());
            self.emit(LeaseEventKind::Offered, EventOrigin::Local, lease.clone())
                .await;
            lease
        };

        // 被替换的旧记录可能还在持久化集合中
        self.persist(std::slice::from_ref(&lease)).await?;
        debug!("📤 OFFER: mac={}, ip={}, subnet={}", mac, lease.ip, subnet_id);
        Ok(lease)
    }

    /// REQUEST 确认：OFFERED -> ACKED，已 ACKED 的续期
    ///
    /// 返回租约与事件 revision
    pub async fn ack(
        &self,
        mac: MacAddress,
        ip: Ipv4Addr,
        hostname: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(Lease, u64)> {
        let subnet = self
            .registry
            .subnet_for_ip(ip)
            .await
            .ok_or_else(|| Error::LeaseNotFound(format!("{} ({})", ip, mac)))?;
        let timers = *self.timers.read().await;
        let slot = self.slot(subnet.id).await;
        let mut leases = slot.lock().await;

        let lease = match leases.by_ip.get_mut(&ip) {
            Some(lease)
                if lease.mac_address == Some(mac) && lease.state != LeaseState::Released =>
            {
                lease.state = LeaseState::Acked;
                lease.updated_at = now;
                lease.expires_at = now + timers.lease_time;
                if hostname.is_some() {
                    lease.hostname = hostname;
                }
                lease.clone()
            }
            _ => return Err(Error::LeaseNotFound(format!("{} ({})", ip, mac))),
        };

        self.persist(std::slice::from_ref(&lease)).await?;
        let revision = self
            .emit(LeaseEventKind::Acked, EventOrigin::Local, lease.clone())
            .await;

        info!("✅ ACK: mac={}, ip={}, expires_at={}", mac, ip, lease.expires_at);
        Ok((lease, revision))
    }

    /// 续期 MAC 的 ACKED 租约
    pub async fn renew(&self, mac: MacAddress, now: DateTime<Utc>) -> Result<(Lease, u64)> {
        let timers = *self.timers.read().await;

        for slot in self.slots().await {
            let mut leases = slot.lock().await;
            let Some(lease) = leases
                .by_ip
                .values_mut()
                .find(|l| l.mac_address == Some(mac) && l.state == LeaseState::Acked)
            else {
                continue;
            };

            lease.updated_at = now;
            lease.expires_at = now + timers.lease_time;
            let lease = lease.clone();

            self.persist(std::slice::from_ref(&lease)).await?;
            let revision = self
                .emit(LeaseEventKind::Renewed, EventOrigin::Local, lease.clone())
                .await;
            debug!("🔄 续期: mac={}, ip={}", mac, lease.ip);
            return Ok((lease, revision));
        }

        Err(Error::LeaseNotFound(mac.to_string()))
    }

    /// 释放 MAC 的租约；没有有效租约时不做任何事
    pub async fn release(&self, mac: MacAddress, now: DateTime<Utc>) -> Result<Option<Lease>> {
        for slot in self.slots().await {
            let mut leases = slot.lock().await;
            let Some(lease) = leases
                .by_ip
                .values_mut()
                .find(|l| l.mac_address == Some(mac) && l.state.is_active())
            else {
                continue;
            };

            lease.state = LeaseState::Released;
            lease.updated_at = now;
            lease.expires_at = now;
            let lease = lease.clone();

            self.persist(std::slice::from_ref(&lease)).await?;
            self.emit(LeaseEventKind::Released, EventOrigin::Local, lease.clone())
                .await;
            info!("📥 RELEASE: mac={}, ip={}", mac, lease.ip);
            return Ok(Some(lease));
        }

        debug!("RELEASE 无有效租约，忽略: mac={}", mac);
        Ok(None)
    }

    /// 丢弃未确认的 OFFER（客户端选择了其他服务器或 REQUEST 被拒）
    pub async fn nak(&self, mac: MacAddress, ip: Ipv4Addr, now: DateTime<Utc>) -> Result<Option<Lease>> {
        let Some(subnet) = self.registry.subnet_for_ip(ip).await else {
            return Ok(None);
        };
        let slot = self.slot(subnet.id).await;
        let mut leases = slot.lock().await;

        let lease = match leases.by_ip.get_mut(&ip) {
            Some(lease) if lease.mac_address == Some(mac) && lease.state == LeaseState::Offered => {
                lease.state = LeaseState::Expired;
                lease.updated_at = now;
                lease.expires_at = now;
                lease.clone()
            }
            _ => return Ok(None),
        };

        self.emit(LeaseEventKind::Nacked, EventOrigin::Local, lease.clone())
            .await;
        Ok(Some(lease))
    }

    /// DHCPDECLINE：地址被其他设备占用，写入冲突标记隔离一段时间。
    ///
    /// 地址仍被其他 MAC 持有时不做任何修改，返回 `None`。
    pub async fn decline(
        &self,
        mac: MacAddress,
        ip: Ipv4Addr,
        now: DateTime<Utc>,
    ) -> Result<Option<Lease>> {
        let subnet = self
            .registry
            .subnet_for_ip(ip)
            .await
            .ok_or_else(|| Error::LeaseNotFound(format!("{} ({})", ip, mac)))?;
        let timers = *self.timers.read().await;
        let slot = self.slot(subnet.id).await;
        let mut leases = slot.lock().await;

        if let Some(existing) = leases.by_ip.get(&ip) {
            let foreign = existing
                .mac_address
                .as_ref()
                .is_some_and(|holder| *holder != mac);
            if foreign && existing.holds_address(now) {
                warn!(
                    "⚠️ 忽略 DHCPDECLINE: ip={} 由 {:?} 持有，报告者 {}",
                    ip, existing.mac_address, mac
                );
                return Ok(None);
            }
        }

        let marker = Lease {
            mac_address: None,
            ip,
            subnet_id: subnet.id,
            vlan_id: subnet.vlan_id,
            state: LeaseState::Acked,
            hostname: None,
            created_at: now,
            updated_at: now,
            expires_at: now + timers.conflict_quarantine,
        };
        leases.by_ip.insert(ip, marker.clone());

        self.persist(std::slice::from_ref(&marker)).await?;
        self.emit(LeaseEventKind::Declined, EventOrigin::Local, marker.clone())
            .await;
        warn!("⚠️ 地址冲突: ip={}, 由 {} 报告，隔离至 {}", ip, mac, marker.expires_at);
        Ok(Some(marker))
    }

    /// 过期扫描：超时的 OFFERED / ACKED 变为 EXPIRED，到期的冲突标记删除
    pub async fn expire(&self, now: DateTime<Utc>) -> Result<Vec<Lease>> {
        let mut expired = Vec::new();

        for slot in self.slots().await {
            let mut leases = slot.lock().await;
            let due: Vec<Ipv4Addr> = leases
                .by_ip
                .values()
                .filter(|l| l.state.is_active() && l.expires_at <= now)
                .map(|l| l.ip)
                .collect();

            for ip in due {
                let Some(lease) = leases.by_ip.get_mut(&ip) else {
                    continue;
                };
                if lease.is_conflict_marker() {
                    let mut marker = lease.clone();
                    leases.by_ip.remove(&ip);
                    marker.state = LeaseState::Expired;
                    expired.push(marker);
                    continue;
                }

                lease.state = LeaseState::Expired;
                lease.updated_at = now;
                let lease = lease.clone();
                self.emit(LeaseEventKind::Expired, EventOrigin::Local, lease.clone())
                    .await;
                expired.push(lease);
            }
        }

        if !expired.is_empty() {
            self.persist(&expired).await?;
            debug!("⏰ 过期租约: {}", expired.len());
        }
        Ok(expired)
    }

    // ========================================================================
    // 查询
    // ========================================================================

    /// 按地址查询当前记录
    pub async fn query(&self, ip: Ipv4Addr) -> Option<Lease> {
        let subnet = self.registry.subnet_for_ip(ip).await?;
        let slot = self.subnets.read().await.get(&subnet.id).cloned()?;
        let leases = slot.lock().await;
        leases.by_ip.get(&ip).cloned()
    }

    /// MAC 当前的有效租约
    pub async fn lease_for_mac(&self, mac: MacAddress, now: DateTime<Utc>) -> Option<Lease> {
        for slot in self.slots().await {
            let leases = slot.lock().await;
            if let Some(lease) = leases
                .by_ip
                .values()
                .find(|l| l.mac_address == Some(mac) && l.holds_address(now))
            {
                return Some(lease.clone());
            }
        }
        None
    }

    /// 全部记录
    pub async fn snapshot(&self) -> Vec<Lease> {
        let mut all = Vec::new();
        for slot in self.slots().await {
            all.extend(slot.lock().await.by_ip.values().cloned());
        }
        all.sort_by_key(|l| l.ip);
        all
    }

    /// 某个 VLAN 的全部记录
    pub async fn snapshot_vlan(&self, vlan_id: VlanId) -> Vec<Lease> {
        self.snapshot()
            .await
            .into_iter()
            .filter(|l| l.vlan_id == vlan_id)
            .collect()
    }

    // ========================================================================
    // 复制
    // ========================================================================

    /// 应用对端复制的租约，不重新校验唯一性。
    ///
    /// 本地已有更新的记录时丢弃该条复制，返回当前修订号。
    pub async fn apply_replicated(&self, lease: Lease) -> Result<u64> {
        let slot = self.slot(lease.subnet_id).await;
        let mut leases = slot.lock().await;
        if let Some(existing) = leases.by_ip.get(&lease.ip) {
            if replica_is_stale(existing, &lease) {
                debug!(
                    "⏭️ 忽略过期的复制记录: ip={}, 本地 {:?}@{}, 对端 {:?}@{}",
                    lease.ip, existing.state, existing.updated_at, lease.state, lease.updated_at
                );
                drop(leases);
                return Ok(self.revision().await);
            }
        }
        leases.by_ip.insert(lease.ip, lease.clone());

        self.persist(std::slice::from_ref(&lease)).await?;
        let revision = self
            .emit(
                LeaseEventKind::for_state(lease.state),
                EventOrigin::Replicated,
                lease,
            )
            .await;
        Ok(revision)
    }

    /// 合并对端的全量租约表，从不删除记录；返回发生变化的条数
    pub async fn merge_snapshot(&self, incoming: Vec<Lease>) -> Result<usize> {
        let mut changed = Vec::new();

        for lease in incoming {
            let slot = self.slot(lease.subnet_id).await;
            let mut leases = slot.lock().await;

            let take = match leases.by_ip.get(&lease.ip) {
                None => true,
                Some(existing) => prefer_incoming(existing, &lease),
            };
            if !take {
                continue;
            }

            leases.by_ip.insert(lease.ip, lease.clone());
            self.emit(
                LeaseEventKind::for_state(lease.state),
                EventOrigin::Replicated,
                lease.clone(),
            )
            .await;
            changed.push(lease);
        }

        self.persist(&changed).await?;
        Ok(changed.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::models::IpRangeType;
    use common::topology::NewSubnet;

    fn ip(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(10, 0, 0, last)
    }

    fn mac(n: u8) -> MacAddress {
        MacAddress::new([0x52, 0x54, 0x00, 0x00, 0x00, n])
    }

    async fn setup(managed: bool) -> (Arc<SubnetRegistry>, SubnetId) {
        let registry = Arc::new(SubnetRegistry::new());
        let (_, vlan) = registry.create_fabric("fabric-0").await.unwrap();
        let subnet = registry
            .create_subnet(NewSubnet {
                vlan_id: vlan.id,
                cidr: "10.0.0.0/24".parse().unwrap(),
                managed,
                gateway_ip: Some(ip(1)),
                dns_servers: vec![],
            })
            .await
            .unwrap();
        if managed {
            registry
                .add_range(subnet.id, IpRangeType::Dynamic, ip(50), ip(99), "")
                .await
                .unwrap();
        }
        (registry, subnet.id)
    }

    #[tokio::test]
    async fn test_basic_lease_cycle_reuses_lowest_address() {
        let (registry, subnet) = setup(true).await;
        let store = LeaseStore::new(registry, None);
        let now = Utc::now();

        let first: MacAddress = "AA:BB:CC:00:01:02".parse().unwrap();
        let a = store.allocate(first, subnet, now).await.unwrap();
        assert_eq!(a.ip, ip(50));

        let b = store.allocate(mac(2), subnet, now).await.unwrap();
        assert_eq!(b.ip, ip(51));

        store.release(first, now).await.unwrap();
        let c = store.allocate(mac(3), subnet, now).await.unwrap();
        assert_eq!(c.ip, ip(50));
    }

    #[tokio::test]
    async fn test_repeated_discover_returns_same_lease() {
        let (registry, subnet) = setup(true).await;
        let store = LeaseStore::new(registry, None);
        let now = Utc::now();

        let a = store.allocate(mac(1), subnet, now).await.unwrap();
        let b = store
            .allocate(mac(1), subnet, now + Duration::seconds(5))
            .await
            .unwrap();
        assert_eq!(a.ip, b.ip);
        assert_eq!(store.snapshot().await.len(), 1);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let (registry, subnet) = setup(true).await;
        let store = LeaseStore::new(registry, None);
        let now = Utc::now();

        let lease = store.allocate(mac(1), subnet, now).await.unwrap();
        store.ack(mac(1), lease.ip, None, now).await.unwrap();

        assert!(store.release(mac(1), now).await.unwrap().is_some());
        let after_first = store.snapshot().await;
        let revision = store.revision().await;

        assert!(store.release(mac(1), now).await.unwrap().is_none());
        assert_eq!(store.snapshot().await, after_first);
        assert_eq!(store.revision().await, revision);

        // 从未见过的 MAC
        assert!(store.release(mac(9), now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_allocations_are_unique() {
        let (registry, subnet) = setup(true).await;
        let store = Arc::new(LeaseStore::new(registry, None));
        let now = Utc::now();

        let mut handles = Vec::new();
        for n in 0..60u8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.allocate(mac(n), subnet, now).await
            }));
        }

        let mut ips = std::collections::HashSet::new();
        let mut exhausted = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(lease) => assert!(ips.insert(lease.ip), "重复地址 {}", lease.ip),
                Err(Error::NoAddressAvailable { .. }) => exhausted += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(ips.len(), 50);
        assert_eq!(exhausted, 10);
    }

    #[tokio::test]
    async fn test_managed_subnet_never_allocates_reserved() {
        let (registry, subnet) = setup(true).await;
        registry
            .add_range(subnet, IpRangeType::Reserved, ip(100), ip(110), "bmc")
            .await
            .unwrap();
        let store = LeaseStore::new(registry, None);
        let now = Utc::now();

        for n in 0..50u8 {
            let lease = store.allocate(mac(n), subnet, now).await.unwrap();
            assert!(lease.ip < ip(100) || lease.ip > ip(110));
        }
        let err = store.allocate(mac(200), subnet, now).await.unwrap_err();
        assert!(matches!(err, Error::NoAddressAvailable { .. }));
    }

    #[tokio::test]
    async fn test_unmanaged_subnet_allocates_only_reserved() {
        let (registry, subnet) = setup(false).await;
        registry
            .add_range(subnet, IpRangeType::Reserved, ip(200), ip(202), "maas")
            .await
            .unwrap();
        let store = LeaseStore::new(registry, None);
        let now = Utc::now();

        let mut got = Vec::new();
        for n in 0..3u8 {
            got.push(store.allocate(mac(n), subnet, now).await.unwrap().ip);
        }
        assert_eq!(got, vec![ip(200), ip(201), ip(202)]);
        assert!(store.allocate(mac(3), subnet, now).await.is_err());
    }

    #[tokio::test]
    async fn test_offer_expires_and_address_is_reused() {
        let (registry, subnet) = setup(true).await;
        let store = LeaseStore::new(registry, None);
        let now = Utc::now();

        let offered = store.allocate(mac(1), subnet, now).await.unwrap();
        let later = now + Duration::seconds(61);
        let expired = store.expire(later).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(store.query(offered.ip).await.unwrap().state, LeaseState::Expired);

        let next = store.allocate(mac(2), subnet, later).await.unwrap();
        assert_eq!(next.ip, offered.ip);

        // 过期的 OFFER 不能再被 ACK
        assert!(store.ack(mac(1), offered.ip, None, later).await.is_err());
    }

    #[tokio::test]
    async fn test_renew_unknown_mac_is_not_found() {
        let (registry, subnet) = setup(true).await;
        let store = LeaseStore::new(registry, None);
        let now = Utc::now();

        assert!(matches!(
            store.renew(mac(1), now).await.unwrap_err(),
            Error::LeaseNotFound(_)
        ));

        let lease = store.allocate(mac(1), subnet, now).await.unwrap();
        let (acked, _) = store.ack(mac(1), lease.ip, None, now).await.unwrap();
        let (renewed, _) = store.renew(mac(1), now + Duration::seconds(300)).await.unwrap();
        assert!(renewed.expires_at > acked.expires_at);
    }

    #[tokio::test]
    async fn test_host_reservation_wins() {
        let (registry, subnet) = setup(true).await;
        registry.add_host_reservation(subnet, mac(7), ip(77)).await.unwrap();
        let store = LeaseStore::new(registry, None);
        let now = Utc::now();

        assert_eq!(store.allocate(mac(7), subnet, now).await.unwrap().ip, ip(77));
        for n in 0..48u8 {
            assert_ne!(store.allocate(mac(100 + n), subnet, now).await.unwrap().ip, ip(77));
        }
    }

    #[tokio::test]
    async fn test_declined_address_is_quarantined() {
        let (registry, subnet) = setup(true).await;
        let store = LeaseStore::new(registry, None);
        let now = Utc::now();

        let lease = store.allocate(mac(1), subnet, now).await.unwrap();
        store.decline(mac(1), lease.ip, now).await.unwrap();

        let next = store.allocate(mac(2), subnet, now).await.unwrap();
        assert_ne!(next.ip, lease.ip);

        // 隔离期结束后标记被删除
        store.expire(now + Duration::hours(2)).await.unwrap();
        assert!(store.query(lease.ip).await.is_none());
    }

    #[tokio::test]
    async fn test_decline_from_other_mac_keeps_active_lease() {
        let (registry, subnet) = setup(true).await;
        let store = LeaseStore::new(registry, None);
        let now = Utc::now();

        let offer = store.allocate(mac(1), subnet, now).await.unwrap();
        store.ack(mac(1), offer.ip, None, now).await.unwrap();

        // 其他客户端对该地址发 DECLINE
        let declined = store.decline(mac(2), offer.ip, now).await.unwrap();
        assert!(declined.is_none());

        let held = store.query(offer.ip).await.unwrap();
        assert_eq!(held.mac_address, Some(mac(1)));
        assert_eq!(held.state, LeaseState::Acked);
        let (renewed, _) = store.renew(mac(1), now + Duration::minutes(5)).await.unwrap();
        assert_eq!(renewed.ip, offer.ip);
    }

    #[tokio::test]
    async fn test_older_replica_does_not_replace_newer_ack() {
        let (registry, subnet) = setup(true).await;
        let store = LeaseStore::new(registry, None);
        let now = Utc::now();

        let offer = store.allocate(mac(1), subnet, now).await.unwrap();
        let (acked, _) = store
            .ack(mac(1), offer.ip, None, now + Duration::seconds(2))
            .await
            .unwrap();

        // 对端在 ACK 之前把同一个 OFFER 置为过期
        let mut late = offer.clone();
        late.state = LeaseState::Expired;
        late.updated_at = now + Duration::seconds(1);
        let before = store.revision().await;
        assert_eq!(store.apply_replicated(late).await.unwrap(), before);

        let held = store.query(offer.ip).await.unwrap();
        assert_eq!(held.state, LeaseState::Acked);
        assert_eq!(held.updated_at, acked.updated_at);

        // 其他 MAC 的 OFFER 也不能覆盖 ACK
        let mut rival = offer.clone();
        rival.mac_address = Some(mac(9));
        rival.updated_at = now + Duration::seconds(10);
        store.apply_replicated(rival).await.unwrap();
        assert_eq!(store.query(offer.ip).await.unwrap().mac_address, Some(mac(1)));

        // 更新的记录照常应用
        let mut released = acked.clone();
        released.state = LeaseState::Released;
        released.updated_at = now + Duration::seconds(20);
        store.apply_replicated(released).await.unwrap();
        assert_eq!(store.query(offer.ip).await.unwrap().state, LeaseState::Released);
    }

    #[tokio::test]
    async fn test_ownership_filter_restricts_new_addresses() {
        let (registry, subnet) = setup(true).await;
        let store = LeaseStore::new(registry, None);
        let now = Utc::now();

        let odd_only = |_: &Subnet, addr: Ipv4Addr| addr.octets()[3] % 2 == 1;
        let lease = store
            .allocate_filtered(mac(1), subnet, now, &odd_only)
            .await
            .unwrap();
        assert_eq!(lease.ip, ip(51));
    }

    #[tokio::test]
    async fn test_acked_leases_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leases.json");
        let (registry, subnet) = setup(true).await;
        let now = Utc::now();

        {
            let store = LeaseStore::new(registry.clone(), Some(LeaseCheckpoint::new(&path)));
            let a = store.allocate(mac(1), subnet, now).await.unwrap();
            store.ack(mac(1), a.ip, Some("node-1".into()), now).await.unwrap();
            store.allocate(mac(2), subnet, now).await.unwrap();
        }

        let store = LeaseStore::new(registry, Some(LeaseCheckpoint::new(&path)));
        assert_eq!(store.restore().await.unwrap(), 1);

        let restored = store.query(ip(50)).await.unwrap();
        assert_eq!(restored.state, LeaseState::Acked);
        assert_eq!(restored.hostname.as_deref(), Some("node-1"));
        assert!(store.query(ip(51)).await.is_none());

        // 恢复后同一 MAC 拿回原地址
        assert_eq!(store.allocate(mac(1), subnet, now).await.unwrap().ip, ip(50));
    }

    #[tokio::test]
    async fn test_merge_never_drops_and_acked_wins() {
        let (registry, subnet) = setup(true).await;
        let store = LeaseStore::new(registry, None);
        let now = Utc::now();

        let mine = store.allocate(mac(1), subnet, now).await.unwrap();
        store.ack(mac(1), mine.ip, None, now).await.unwrap();

        // 对端在同一地址上只有一个较新的 OFFER
        let mut theirs = mine.clone();
        theirs.mac_address = Some(mac(2));
        theirs.state = LeaseState::Offered;
        theirs.updated_at = now + Duration::seconds(10);

        let mut other = mine.clone();
        other.ip = ip(60);
        other.mac_address = Some(mac(3));

        let merged = store.merge_snapshot(vec![theirs, other]).await.unwrap();
        assert_eq!(merged, 1);
        assert_eq!(store.query(mine.ip).await.unwrap().mac_address, Some(mac(1)));
        assert_eq!(store.query(ip(60)).await.unwrap().mac_address, Some(mac(3)));
    }

    #[tokio::test]
    async fn test_events_carry_increasing_revisions() {
        let (registry, subnet) = setup(true).await;
        let store = LeaseStore::new(registry, None);
        let mut rx = store.subscribe();
        let now = Utc::now();

        let lease = store.allocate(mac(1), subnet, now).await.unwrap();
        store.ack(mac(1), lease.ip, None, now).await.unwrap();

        let offered = rx.recv().await.unwrap();
        let acked = rx.recv().await.unwrap();
        assert_eq!(offered.kind, LeaseEventKind::Offered);
        assert_eq!(acked.kind, LeaseEventKind::Acked);
        assert_eq!(acked.origin, EventOrigin::Local);
        assert!(acked.revision > offered.revision);
    }
}
