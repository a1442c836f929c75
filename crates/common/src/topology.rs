/// 子网注册表
///
/// 保存 Fabric / VLAN / 子网 / 地址段拓扑，并负责所有拓扑约束的校验：
/// - 每个 Fabric 始终有一个默认 VLAN（VID 0）
/// - 同一子网内的地址段互不重叠，且必须位于子网内
/// - 动态地址段只能加在受管子网上
///
/// 保留段的语义在受管与非受管子网之间是反转的，见 [`SubnetRegistry::allocation_pool`]。

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info};

use crate::errors::{Error, Result};
use crate::models::{
    Fabric, FabricId, HostReservation, IpRange, IpRangeType, MacAddress, RangeId, Subnet,
    SubnetId, TopologySnapshot, Vlan, VlanId, MAX_VID,
};

/// 默认 VLAN 的 VID
pub const DEFAULT_VID: u16 = 0;

/// 默认 MTU
pub const DEFAULT_MTU: u32 = 1500;

/// 创建子网的参数
#[derive(Debug, Clone)]
pub struct NewSubnet {
    pub vlan_id: VlanId,
    pub cidr: Ipv4Network,
    pub managed: bool,
    pub gateway_ip: Option<Ipv4Addr>,
    pub dns_servers: Vec<Ipv4Addr>,
}

/// 子网更新（`None` 表示不修改）
#[derive(Debug, Clone, Default)]
pub struct SubnetUpdate {
    pub managed: Option<bool>,
    pub gateway_ip: Option<Option<Ipv4Addr>>,
    pub dns_servers: Option<Vec<Ipv4Addr>>,
    pub disabled_boot_architectures: Option<Vec<String>>,
}

/// VLAN DHCP 配置更新
#[derive(Debug, Clone)]
pub struct VlanDhcpUpdate {
    pub dhcp_on: bool,
    pub primary_rack: Option<String>,
    pub secondary_rack: Option<String>,
}

/// 某个子网的可分配地址池
#[derive(Debug, Clone)]
pub struct AllocationPool {
    pub subnet: Subnet,
    /// 闭区间，按起始地址升序
    pub ranges: Vec<(Ipv4Addr, Ipv4Addr)>,
    /// 永远不能分配的地址：网关、DNS、网络地址、广播地址
    pub excluded: BTreeSet<Ipv4Addr>,
    /// 主机保留
    pub reservations: HashMap<MacAddress, Ipv4Addr>,
}

impl AllocationPool {
    /// MAC 的保留地址
    pub fn reservation_for(&self, mac: &MacAddress) -> Option<Ipv4Addr> {
        self.reservations.get(mac).copied()
    }

    /// 按升序列出可作为动态分配的地址（不含任何主机保留地址）
    pub fn candidates(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        let reserved: BTreeSet<Ipv4Addr> = self.reservations.values().copied().collect();
        self.ranges
            .iter()
            .flat_map(|(start, end)| (u32::from(*start)..=u32::from(*end)).map(Ipv4Addr::from))
            .filter(move |ip| !self.excluded.contains(ip) && !reserved.contains(ip))
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.ranges.iter().any(|(s, e)| ip >= *s && ip <= *e) && !self.excluded.contains(&ip)
    }
}

#[derive(Debug, Default)]
struct TopologyState {
    version: u64,
    next_id: i64,
    fabrics: BTreeMap<FabricId, Fabric>,
    vlans: BTreeMap<VlanId, Vlan>,
    subnets: BTreeMap<SubnetId, Subnet>,
    ranges: BTreeMap<RangeId, IpRange>,
    reservations: Vec<HostReservation>,
}

impl TopologyState {
    fn alloc_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn bump(&mut self) -> u64 {
        self.version += 1;
        self.version
    }

    fn subnet(&self, id: SubnetId) -> Result<&Subnet> {
        self.subnets
            .get(&id)
            .ok_or_else(|| Error::NotFound(format!("子网 {}", id)))
    }

    fn vlan(&self, id: VlanId) -> Result<&Vlan> {
        self.vlans
            .get(&id)
            .ok_or_else(|| Error::NotFound(format!("VLAN {}", id)))
    }

    fn ranges_of(&self, subnet_id: SubnetId) -> Vec<IpRange> {
        let mut ranges: Vec<IpRange> = self
            .ranges
            .values()
            .filter(|r| r.subnet_id == subnet_id)
            .cloned()
            .collect();
        ranges.sort_by_key(|r| r.start_ip);
        ranges
    }

    fn touch_subnet(&mut self, subnet_id: SubnetId) {
        if let Some(subnet) = self.subnets.get_mut(&subnet_id) {
            subnet.version += 1;
        }
    }
}

fn cidrs_overlap(a: &Ipv4Network, b: &Ipv4Network) -> bool {
    a.network() <= b.broadcast() && b.network() <= a.broadcast()
}

/// 子网注册表
pub struct SubnetRegistry {
    state: RwLock<TopologyState>,
    version_tx: watch::Sender<u64>,
}

impl Default for SubnetRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SubnetRegistry {
    pub fn new() -> Self {
        let (version_tx, _) = watch::channel(0);
        Self {
            state: RwLock::new(TopologyState::default()),
            version_tx,
        }
    }

    /// 从快照构造
    pub fn from_snapshot(snapshot: TopologySnapshot) -> Result<Self> {
        let registry = Self::new();
        registry.restore_blocking(snapshot)?;
        Ok(registry)
    }

    /// 订阅拓扑版本变化
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version_tx.subscribe()
    }

    pub async fn version(&self) -> u64 {
        self.state.read().await.version
    }

    fn publish(&self, version: u64) {
        self.version_tx.send_replace(version);
    }

    // ========================================================================
    // 查询
    // ========================================================================

    /// 根据 Fabric 与 VID 解析 VLAN
    pub async fn resolve_vlan(&self, fabric_id: FabricId, vid: u16) -> Result<Vlan> {
        let state = self.state.read().await;
        state
            .vlans
            .values()
            .find(|v| v.fabric_id == fabric_id && v.vid == vid)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Fabric {} 上的 VID {}", fabric_id, vid)))
    }

    /// 子网内全部地址段，按起始地址升序
    pub async fn ranges_for(&self, subnet_id: SubnetId) -> Result<Vec<IpRange>> {
        let state = self.state.read().await;
        state.subnet(subnet_id)?;
        Ok(state.ranges_of(subnet_id))
    }

    pub async fn is_managed(&self, subnet_id: SubnetId) -> Result<bool> {
        Ok(self.state.read().await.subnet(subnet_id)?.managed)
    }

    pub async fn get_fabric(&self, id: FabricId) -> Result<Fabric> {
        self.state
            .read()
            .await
            .fabrics
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Fabric {}", id)))
    }

    pub async fn get_vlan(&self, id: VlanId) -> Result<Vlan> {
        self.state.read().await.vlan(id).cloned()
    }

    pub async fn get_subnet(&self, id: SubnetId) -> Result<Subnet> {
        self.state.read().await.subnet(id).cloned()
    }

    pub async fn list_vlans(&self) -> Vec<Vlan> {
        self.state.read().await.vlans.values().cloned().collect()
    }

    pub async fn subnets_on_vlan(&self, vlan_id: VlanId) -> Vec<Subnet> {
        self.state
            .read()
            .await
            .subnets
            .values()
            .filter(|s| s.vlan_id == vlan_id)
            .cloned()
            .collect()
    }

    /// 包含该地址的子网
    pub async fn subnet_for_ip(&self, ip: Ipv4Addr) -> Option<Subnet> {
        self.state
            .read()
            .await
            .subnets
            .values()
            .find(|s| s.cidr.contains(ip))
            .cloned()
    }

    pub async fn host_reservations(&self, subnet_id: SubnetId) -> Vec<HostReservation> {
        self.state
            .read()
            .await
            .reservations
            .iter()
            .filter(|r| r.subnet_id == subnet_id)
            .cloned()
            .collect()
    }

    /// 计算子网的可分配地址池
    ///
    /// 保留段的语义反转：
    /// - 受管子网：地址池是动态地址段，落在保留段内的地址一律排除
    /// - 非受管子网：地址池只限于保留段
    ///
    /// 两种情况都会排除网关、子网内的 DNS 服务器、网络地址和广播地址。
    pub async fn allocation_pool(&self, subnet_id: SubnetId) -> Result<AllocationPool> {
        let state = self.state.read().await;
        let subnet = state.subnet(subnet_id)?.clone();
        let ranges = state.ranges_of(subnet_id);

        let reserved: Vec<&IpRange> = ranges
            .iter()
            .filter(|r| r.range_type == IpRangeType::Reserved)
            .collect();

        let pool: Vec<(Ipv4Addr, Ipv4Addr)> = if subnet.managed {
            ranges
                .iter()
                .filter(|r| r.range_type == IpRangeType::Dynamic)
                .flat_map(|r| subtract_ranges((r.start_ip, r.end_ip), &reserved))
                .collect()
        } else {
            reserved.iter().map(|r| (r.start_ip, r.end_ip)).collect()
        };

        let mut excluded = BTreeSet::new();
        if subnet.cidr.prefix() < 31 {
            excluded.insert(subnet.cidr.network());
            excluded.insert(subnet.cidr.broadcast());
        }
        if let Some(gw) = subnet.gateway_ip {
            excluded.insert(gw);
        }
        for dns in &subnet.dns_servers {
            if subnet.cidr.contains(*dns) {
                excluded.insert(*dns);
            }
        }

        let reservations = state
            .reservations
            .iter()
            .filter(|r| r.subnet_id == subnet_id)
            .map(|r| (r.mac_address, r.ip))
            .collect();

        Ok(AllocationPool {
            subnet,
            ranges: pool,
            excluded,
            reservations,
        })
    }

    // ========================================================================
    // 变更
    // ========================================================================

    /// 创建 Fabric，同时创建默认 VLAN
    pub async fn create_fabric(&self, name: &str) -> Result<(Fabric, Vlan)> {
        let mut state = self.state.write().await;

        if state.fabrics.values().any(|f| f.name == name) {
            return Err(Error::AlreadyExists(format!("Fabric {}", name)));
        }

        let fabric_id = state.alloc_id();
        let vlan_id = state.alloc_id();

        let vlan = Vlan {
            id: vlan_id,
            fabric_id,
            vid: DEFAULT_VID,
            name: "untagged".to_string(),
            mtu: DEFAULT_MTU,
            space: None,
            dhcp_on: false,
            primary_rack: None,
            secondary_rack: None,
            version: 1,
        };
        let fabric = Fabric {
            id: fabric_id,
            name: name.to_string(),
            default_vlan_id: vlan_id,
        };

        state.fabrics.insert(fabric_id, fabric.clone());
        state.vlans.insert(vlan_id, vlan.clone());
        let version = state.bump();
        drop(state);
        self.publish(version);

        info!("✅ 创建 Fabric: id={}, name={}, default_vlan={}", fabric_id, name, vlan_id);
        Ok((fabric, vlan))
    }

    pub async fn create_vlan(
        &self,
        fabric_id: FabricId,
        vid: u16,
        name: &str,
        space: Option<String>,
    ) -> Result<Vlan> {
        if vid > MAX_VID {
            return Err(Error::InvalidArgument(format!("VID 超出范围: {}", vid)));
        }

        let mut state = self.state.write().await;
        if !state.fabrics.contains_key(&fabric_id) {
            return Err(Error::NotFound(format!("Fabric {}", fabric_id)));
        }
        if state
            .vlans
            .values()
            .any(|v| v.fabric_id == fabric_id && v.vid == vid)
        {
            return Err(Error::AlreadyExists(format!(
                "Fabric {} 上的 VID {}",
                fabric_id, vid
            )));
        }

        let id = state.alloc_id();
        let vlan = Vlan {
            id,
            fabric_id,
            vid,
            name: name.to_string(),
            mtu: DEFAULT_MTU,
            space,
            dhcp_on: false,
            primary_rack: None,
            secondary_rack: None,
            version: 1,
        };
        state.vlans.insert(id, vlan.clone());
        let version = state.bump();
        drop(state);
        self.publish(version);

        info!("✅ 创建 VLAN: id={}, fabric={}, vid={}", id, fabric_id, vid);
        Ok(vlan)
    }

    /// 删除 VLAN；Fabric 的默认 VLAN 与仍有子网的 VLAN 不能删除
    pub async fn delete_vlan(&self, vlan_id: VlanId) -> Result<()> {
        let mut state = self.state.write().await;
        let vlan = state.vlan(vlan_id)?.clone();

        if state
            .fabrics
            .get(&vlan.fabric_id)
            .map(|f| f.default_vlan_id == vlan_id)
            .unwrap_or(false)
        {
            return Err(Error::InvalidArgument(format!(
                "VLAN {} 是 Fabric {} 的默认 VLAN",
                vlan_id, vlan.fabric_id
            )));
        }
        if state.subnets.values().any(|s| s.vlan_id == vlan_id) {
            return Err(Error::InvalidArgument(format!("VLAN {} 上仍有子网", vlan_id)));
        }

        state.vlans.remove(&vlan_id);
        let version = state.bump();
        drop(state);
        self.publish(version);
        Ok(())
    }

    pub async fn create_subnet(&self, new: NewSubnet) -> Result<Subnet> {
        let mut state = self.state.write().await;
        state.vlan(new.vlan_id)?;

        // 规范化为网络地址
        let cidr = Ipv4Network::new(new.cidr.network(), new.cidr.prefix())
            .map_err(|e| Error::InvalidArgument(format!("无效的 CIDR {}: {}", new.cidr, e)))?;

        if let Some(existing) = state.subnets.values().find(|s| cidrs_overlap(&s.cidr, &cidr)) {
            return Err(Error::AlreadyExists(format!(
                "子网 {} 与已有子网 {} 重叠",
                cidr, existing.cidr
            )));
        }
        if let Some(gw) = new.gateway_ip {
            if !cidr.contains(gw) {
                return Err(Error::InvalidArgument(format!("网关 {} 不在子网 {} 内", gw, cidr)));
            }
        }

        let id = state.alloc_id();
        let subnet = Subnet {
            id,
            cidr,
            vlan_id: new.vlan_id,
            managed: new.managed,
            gateway_ip: new.gateway_ip,
            dns_servers: new.dns_servers,
            disabled_boot_architectures: Vec::new(),
            version: 1,
        };
        state.subnets.insert(id, subnet.clone());
        let version = state.bump();
        drop(state);
        self.publish(version);

        info!("✅ 创建子网: id={}, cidr={}, vlan={}, managed={}", id, cidr, subnet.vlan_id, subnet.managed);
        Ok(subnet)
    }

    /// 乐观并发更新子网：`expected_version` 必须等于当前版本
    pub async fn update_subnet(
        &self,
        subnet_id: SubnetId,
        expected_version: u64,
        update: SubnetUpdate,
    ) -> Result<Subnet> {
        let mut state = self.state.write().await;
        let current = state.subnet(subnet_id)?.clone();

        if current.version != expected_version {
            return Err(Error::VersionConflict {
                entity: format!("subnet:{}", subnet_id),
                expected: expected_version,
                actual: current.version,
            });
        }

        let mut subnet = current;
        if let Some(managed) = update.managed {
            if !managed
                && state
                    .ranges
                    .values()
                    .any(|r| r.subnet_id == subnet_id && r.range_type == IpRangeType::Dynamic)
            {
                return Err(Error::InvalidArgument(format!(
                    "子网 {} 仍有动态地址段，不能改为非受管",
                    subnet_id
                )));
            }
            subnet.managed = managed;
        }
        if let Some(gateway) = update.gateway_ip {
            if let Some(gw) = gateway {
                if !subnet.cidr.contains(gw) {
                    return Err(Error::InvalidArgument(format!(
                        "网关 {} 不在子网 {} 内",
                        gw, subnet.cidr
                    )));
                }
            }
            subnet.gateway_ip = gateway;
        }
        if let Some(dns) = update.dns_servers {
            subnet.dns_servers = dns;
        }
        if let Some(disabled) = update.disabled_boot_architectures {
            subnet.disabled_boot_architectures = disabled;
        }
        subnet.version += 1;

        state.subnets.insert(subnet_id, subnet.clone());
        let version = state.bump();
        drop(state);
        self.publish(version);

        debug!("更新子网: id={}, version={}", subnet_id, subnet.version);
        Ok(subnet)
    }

    /// 添加地址段；重叠或越界直接拒绝，不做自动修正
    pub async fn add_range(
        &self,
        subnet_id: SubnetId,
        range_type: IpRangeType,
        start_ip: Ipv4Addr,
        end_ip: Ipv4Addr,
        comment: &str,
    ) -> Result<IpRange> {
        let mut state = self.state.write().await;
        let subnet = state.subnet(subnet_id)?.clone();

        if start_ip > end_ip {
            return Err(Error::InvalidArgument(format!(
                "地址段起点 {} 大于终点 {}",
                start_ip, end_ip
            )));
        }
        if !subnet.cidr.contains(start_ip) || !subnet.cidr.contains(end_ip) {
            return Err(Error::InvalidArgument(format!(
                "地址段 {}-{} 不在子网 {} 内",
                start_ip, end_ip, subnet.cidr
            )));
        }
        if range_type == IpRangeType::Dynamic && !subnet.managed {
            return Err(Error::InvalidArgument(format!(
                "非受管子网 {} 不能添加动态地址段",
                subnet.cidr
            )));
        }
        if let Some(existing) = state
            .ranges
            .values()
            .find(|r| r.subnet_id == subnet_id && r.overlaps(start_ip, end_ip))
        {
            return Err(Error::OverlappingRange(format!(
                "{}-{} 与已有 {} 段 {}-{} 重叠",
                start_ip,
                end_ip,
                existing.range_type.as_str(),
                existing.start_ip,
                existing.end_ip
            )));
        }

        let id = state.alloc_id();
        let range = IpRange {
            id,
            subnet_id,
            range_type,
            start_ip,
            end_ip,
            comment: comment.to_string(),
        };
        state.ranges.insert(id, range.clone());
        state.touch_subnet(subnet_id);
        let version = state.bump();
        drop(state);
        self.publish(version);

        info!(
            "✅ 添加地址段: subnet={}, type={}, {}-{}",
            subnet_id,
            range_type.as_str(),
            start_ip,
            end_ip
        );
        Ok(range)
    }

    pub async fn remove_range(&self, range_id: RangeId) -> Result<IpRange> {
        let mut state = self.state.write().await;
        let range = state
            .ranges
            .remove(&range_id)
            .ok_or_else(|| Error::NotFound(format!("地址段 {}", range_id)))?;
        state.touch_subnet(range.subnet_id);
        let version = state.bump();
        drop(state);
        self.publish(version);
        Ok(range)
    }

    /// 添加主机保留；同一 MAC 的旧保留被替换
    pub async fn add_host_reservation(
        &self,
        subnet_id: SubnetId,
        mac: MacAddress,
        ip: Ipv4Addr,
    ) -> Result<HostReservation> {
        let mut state = self.state.write().await;
        let subnet = state.subnet(subnet_id)?.clone();

        if !subnet.cidr.contains(ip) {
            return Err(Error::InvalidArgument(format!("{} 不在子网 {} 内", ip, subnet.cidr)));
        }
        if state
            .reservations
            .iter()
            .any(|r| r.subnet_id == subnet_id && r.ip == ip && r.mac_address != mac)
        {
            return Err(Error::AlreadyExists(format!("地址 {} 已被保留", ip)));
        }

        state
            .reservations
            .retain(|r| !(r.subnet_id == subnet_id && r.mac_address == mac));
        let reservation = HostReservation {
            subnet_id,
            mac_address: mac,
            ip,
        };
        state.reservations.push(reservation.clone());
        state.touch_subnet(subnet_id);
        let version = state.bump();
        drop(state);
        self.publish(version);
        Ok(reservation)
    }

    /// 设置 VLAN 的 DHCP 开关与主备机架
    pub async fn set_vlan_dhcp(
        &self,
        vlan_id: VlanId,
        expected_version: Option<u64>,
        update: VlanDhcpUpdate,
    ) -> Result<Vlan> {
        let mut state = self.state.write().await;
        let current = state.vlan(vlan_id)?.clone();

        if let Some(expected) = expected_version {
            if current.version != expected {
                return Err(Error::VersionConflict {
                    entity: format!("vlan:{}", vlan_id),
                    expected,
                    actual: current.version,
                });
            }
        }
        if update.dhcp_on && update.primary_rack.is_none() {
            return Err(Error::InvalidArgument(format!(
                "VLAN {} 启用 DHCP 需要指定主控机架",
                vlan_id
            )));
        }

        let mut vlan = current;
        vlan.dhcp_on = update.dhcp_on;
        vlan.primary_rack = update.primary_rack;
        vlan.secondary_rack = update.secondary_rack;
        vlan.version += 1;

        state.vlans.insert(vlan_id, vlan.clone());
        let version = state.bump();
        drop(state);
        self.publish(version);

        info!(
            "VLAN DHCP 配置: vlan={}, dhcp_on={}, primary={:?}, secondary={:?}",
            vlan_id, vlan.dhcp_on, vlan.primary_rack, vlan.secondary_rack
        );
        Ok(vlan)
    }

    // ========================================================================
    // 快照
    // ========================================================================

    pub async fn snapshot(&self) -> TopologySnapshot {
        let state = self.state.read().await;
        TopologySnapshot {
            version: state.version,
            fabrics: state.fabrics.values().cloned().collect(),
            vlans: state.vlans.values().cloned().collect(),
            subnets: state.subnets.values().cloned().collect(),
            ranges: state.ranges.values().cloned().collect(),
            host_reservations: state.reservations.clone(),
        }
    }

    /// 用快照整体替换当前拓扑
    pub async fn restore(&self, snapshot: TopologySnapshot) -> Result<()> {
        let new_state = build_state(snapshot)?;
        let version = new_state.version;
        *self.state.write().await = new_state;
        self.publish(version);
        debug!("拓扑已恢复: version={}", version);
        Ok(())
    }

    fn restore_blocking(&self, snapshot: TopologySnapshot) -> Result<()> {
        let new_state = build_state(snapshot)?;
        let version = new_state.version;
        match self.state.try_write() {
            Ok(mut guard) => *guard = new_state,
            Err(_) => return Err(Error::Internal("拓扑状态被占用".to_string())),
        }
        self.publish(version);
        Ok(())
    }
}

fn build_state(snapshot: TopologySnapshot) -> Result<TopologyState> {
    let mut state = TopologyState {
        version: snapshot.version,
        ..Default::default()
    };

    for fabric in snapshot.fabrics {
        state.fabrics.insert(fabric.id, fabric);
    }
    for vlan in snapshot.vlans {
        if !state.fabrics.contains_key(&vlan.fabric_id) {
            return Err(Error::InvalidArgument(format!(
                "VLAN {} 引用了不存在的 Fabric {}",
                vlan.id, vlan.fabric_id
            )));
        }
        state.vlans.insert(vlan.id, vlan);
    }
    for fabric in state.fabrics.values() {
        if !state.vlans.contains_key(&fabric.default_vlan_id) {
            return Err(Error::InvalidArgument(format!(
                "Fabric {} 缺少默认 VLAN {}",
                fabric.id, fabric.default_vlan_id
            )));
        }
    }
    for subnet in snapshot.subnets {
        if !state.vlans.contains_key(&subnet.vlan_id) {
            return Err(Error::InvalidArgument(format!(
                "子网 {} 引用了不存在的 VLAN {}",
                subnet.id, subnet.vlan_id
            )));
        }
        state.subnets.insert(subnet.id, subnet);
    }
    for range in snapshot.ranges {
        if !state.subnets.contains_key(&range.subnet_id) {
            return Err(Error::InvalidArgument(format!(
                "地址段 {} 引用了不存在的子网 {}",
                range.id, range.subnet_id
            )));
        }
        state.ranges.insert(range.id, range);
    }
    state.reservations = snapshot.host_reservations;

    state.next_id = state
        .fabrics
        .keys()
        .chain(state.vlans.keys())
        .chain(state.subnets.keys())
        .chain(state.ranges.keys())
        .copied()
        .max()
        .unwrap_or(0);

    Ok(state)
}

/// 从闭区间中扣除与之相交的区间
fn subtract_ranges(range: (Ipv4Addr, Ipv4Addr), holes: &[&IpRange]) -> Vec<(Ipv4Addr, Ipv4Addr)> {
    let mut pieces = vec![(u32::from(range.0), u32::from(range.1))];

    for hole in holes {
        let (hs, he) = (u32::from(hole.start_ip), u32::from(hole.end_ip));
        pieces = pieces
            .into_iter()
            .flat_map(|(s, e)| {
                if he < s || hs > e {
                    return vec![(s, e)];
                }
                let mut out = Vec::new();
                if hs > s {
                    out.push((s, hs - 1));
                }
                if he < e {
                    out.push((he + 1, e));
                }
                out
            })
            .collect();
    }

    pieces
        .into_iter()
        .map(|(s, e)| (Ipv4Addr::from(s), Ipv4Addr::from(e)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(10, 0, 0, last)
    }

    async fn registry_with_subnet(managed: bool) -> (SubnetRegistry, Subnet) {
        let registry = SubnetRegistry::new();
        let (_, vlan) = registry.create_fabric("fabric-0").await.unwrap();
        let subnet = registry
            .create_subnet(NewSubnet {
                vlan_id: vlan.id,
                cidr: "10.0.0.0/24".parse().unwrap(),
                managed,
                gateway_ip: Some(ip(1)),
                dns_servers: vec![ip(2)],
            })
            .await
            .unwrap();
        (registry, subnet)
    }

    #[tokio::test]
    async fn test_fabric_has_default_vlan() {
        let registry = SubnetRegistry::new();
        let (fabric, vlan) = registry.create_fabric("fabric-0").await.unwrap();

        assert_eq!(fabric.default_vlan_id, vlan.id);
        assert_eq!(vlan.vid, DEFAULT_VID);

        let resolved = registry.resolve_vlan(fabric.id, 0).await.unwrap();
        assert_eq!(resolved.id, vlan.id);
        assert!(registry.delete_vlan(vlan.id).await.is_err());

        let tagged = registry.create_vlan(fabric.id, 10, "vlan-10", None).await.unwrap();
        assert!(registry.create_vlan(fabric.id, 10, "dup", None).await.is_err());
        assert!(registry.create_vlan(fabric.id, 4095, "bad", None).await.is_err());
        assert!(registry.create_vlan(999, 11, "orphan", None).await.is_err());
        registry.delete_vlan(tagged.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_managed_subnet_excludes_reserved_ranges() {
        let (registry, subnet) = registry_with_subnet(true).await;
        registry
            .add_range(subnet.id, IpRangeType::Dynamic, ip(50), ip(59), "")
            .await
            .unwrap();
        registry
            .add_range(subnet.id, IpRangeType::Reserved, ip(60), ip(69), "switches")
            .await
            .unwrap();

        let pool = registry.allocation_pool(subnet.id).await.unwrap();
        let candidates: Vec<Ipv4Addr> = pool.candidates().collect();

        assert_eq!(candidates.first(), Some(&ip(50)));
        assert_eq!(candidates.len(), 10);
        assert!(candidates.iter().all(|a| *a < ip(60) || *a > ip(69)));
    }

    #[tokio::test]
    async fn test_unmanaged_subnet_restricted_to_reserved_ranges() {
        let (registry, subnet) = registry_with_subnet(false).await;
        registry
            .add_range(subnet.id, IpRangeType::Reserved, ip(200), ip(204), "maas")
            .await
            .unwrap();

        let pool = registry.allocation_pool(subnet.id).await.unwrap();
        let candidates: Vec<Ipv4Addr> = pool.candidates().collect();

        assert_eq!(candidates, vec![ip(200), ip(201), ip(202), ip(203), ip(204)]);
        assert!(!registry.is_managed(subnet.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_dynamic_range_rejected_on_unmanaged_subnet() {
        let (registry, subnet) = registry_with_subnet(false).await;
        let err = registry
            .add_range(subnet.id, IpRangeType::Dynamic, ip(50), ip(99), "")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_ARGUMENT");
    }

    #[tokio::test]
    async fn test_pool_excludes_gateway_and_dns() {
        let (registry, subnet) = registry_with_subnet(true).await;
        registry
            .add_range(subnet.id, IpRangeType::Dynamic, ip(0), ip(5), "")
            .await
            .unwrap();

        let pool = registry.allocation_pool(subnet.id).await.unwrap();
        let candidates: Vec<Ipv4Addr> = pool.candidates().collect();
        assert_eq!(candidates, vec![ip(3), ip(4), ip(5)]);
    }

    #[tokio::test]
    async fn test_overlapping_and_outside_ranges_rejected() {
        let (registry, subnet) = registry_with_subnet(true).await;
        registry
            .add_range(subnet.id, IpRangeType::Dynamic, ip(50), ip(99), "")
            .await
            .unwrap();

        let err = registry
            .add_range(subnet.id, IpRangeType::Reserved, ip(90), ip(110), "")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "OVERLAPPING_RANGE");

        let err = registry
            .add_range(
                subnet.id,
                IpRangeType::Reserved,
                ip(250),
                Ipv4Addr::new(10, 0, 1, 5),
                "",
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_ARGUMENT");

        // 原有地址段保持不变
        assert_eq!(registry.ranges_for(subnet.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_subnet_version_conflict() {
        let (registry, subnet) = registry_with_subnet(true).await;

        let updated = registry
            .update_subnet(
                subnet.id,
                subnet.version,
                SubnetUpdate {
                    disabled_boot_architectures: Some(vec!["pxe".to_string()]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.version, subnet.version + 1);

        let err = registry
            .update_subnet(subnet.id, subnet.version, SubnetUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::VersionConflict { .. }));
    }

    #[tokio::test]
    async fn test_version_watch_and_snapshot_restore() {
        let (registry, subnet) = registry_with_subnet(true).await;
        let mut rx = registry.subscribe();
        let before = *rx.borrow_and_update();

        registry
            .add_range(subnet.id, IpRangeType::Dynamic, ip(50), ip(99), "")
            .await
            .unwrap();
        rx.changed().await.unwrap();
        assert!(*rx.borrow() > before);

        let snapshot = registry.snapshot().await;
        let copy = SubnetRegistry::from_snapshot(snapshot.clone()).unwrap();
        assert_eq!(copy.snapshot().await, snapshot);

        // 新分配的 ID 不与快照中的冲突
        let (fabric, _) = copy.create_fabric("fabric-1").await.unwrap();
        assert!(snapshot.fabrics.iter().all(|f| f.id != fabric.id));
        assert!(snapshot.ranges.iter().all(|r| r.id != fabric.id));
    }

    #[tokio::test]
    async fn test_host_reservation_excluded_from_candidates() {
        let (registry, subnet) = registry_with_subnet(true).await;
        registry
            .add_range(subnet.id, IpRangeType::Dynamic, ip(50), ip(52), "")
            .await
            .unwrap();
        let mac: MacAddress = "52:54:00:00:00:01".parse().unwrap();
        registry.add_host_reservation(subnet.id, mac, ip(50)).await.unwrap();

        let other: MacAddress = "52:54:00:00:00:02".parse().unwrap();
        assert!(registry.add_host_reservation(subnet.id, other, ip(50)).await.is_err());

        let pool = registry.allocation_pool(subnet.id).await.unwrap();
        assert_eq!(pool.reservation_for(&mac), Some(ip(50)));
        assert_eq!(pool.candidates().collect::<Vec<_>>(), vec![ip(51), ip(52)]);
    }
}
