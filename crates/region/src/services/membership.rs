/// 控制器成员管理
///
/// 维护在线控制器集合。每次成员变化都会重新平衡：
/// - 机架的 RPC 计划：所有在线区域控制器按轮转顺序排列
/// - DHCP 主备：主控被移除时提升备控，备控缺失时选举新的备控
/// - 机器电源归属：保留在线的归属机架，否则选择负载最低的机架
///
/// 心跳超时只把节点标记为离线，不改变主备分配。

use chrono::{DateTime, Utc};
use common::models::{
    ControllerNode, DhcpRole, FailoverPeering, ReplicationState, Vlan, VlanId,
};
use common::settings::ClusterSettings;
use common::topology::VlanDhcpUpdate;
use common::ws_rpc::VlanDhcpConfig;
use common::{Error, Result, SubnetRegistry};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 256;

/// 成员变化事件
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MembershipEvent {
    Registered { system_id: String },
    Deregistered { system_id: String },
    WentOffline { system_id: String },
    CameOnline { system_id: String },
    PeeringChanged { vlan: Vlan },
    RpcPlanChanged { rack_id: String, plan: Vec<String> },
    PowerOwnerChanged { machine_id: String, rack_id: Option<String> },
}

#[derive(Debug, Clone, Serialize)]
pub struct MembershipChange {
    pub version: u64,
    pub event: MembershipEvent,
}

#[derive(Default)]
struct MembershipState {
    version: u64,
    nodes: BTreeMap<String, ControllerNode>,
    rpc_plans: HashMap<String, Vec<String>>,
    /// 机器 -> BMC 所在 VLAN
    machines: BTreeMap<String, Option<VlanId>>,
    power_owners: HashMap<String, String>,
    replication: HashMap<VlanId, ReplicationState>,
}

impl MembershipState {
    fn is_live_rack(&self, system_id: &str) -> bool {
        self.nodes
            .get(system_id)
            .map(|n| n.online && n.role.is_rack())
            .unwrap_or(false)
    }

    fn attached(&self, system_id: &str, vlan_id: VlanId) -> bool {
        self.nodes
            .get(system_id)
            .map(|n| n.vlans.contains(&vlan_id))
            .unwrap_or(false)
    }

    /// VLAN 上在线机架中 system_id 最小的一个
    fn elect_secondary(&self, vlan_id: VlanId, exclude: &str) -> Option<String> {
        self.nodes
            .values()
            .filter(|n| n.online && n.role.is_rack())
            .filter(|n| n.system_id != exclude && n.vlans.contains(&vlan_id))
            .map(|n| n.system_id.clone())
            .next()
    }
}

pub struct ControllerMembership {
    state: RwLock<MembershipState>,
    registry: Arc<SubnetRegistry>,
    settings: RwLock<ClusterSettings>,
    events: broadcast::Sender<MembershipChange>,
}

impl ControllerMembership {
    pub fn new(registry: Arc<SubnetRegistry>, settings: ClusterSettings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: RwLock::new(MembershipState::default()),
            registry,
            settings: RwLock::new(settings),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MembershipChange> {
        self.events.subscribe()
    }

    pub fn registry(&self) -> &Arc<SubnetRegistry> {
        &self.registry
    }

    pub async fn version(&self) -> u64 {
        self.state.read().await.version
    }

    pub async fn apply_settings(&self, settings: ClusterSettings) {
        *self.settings.write().await = settings;
    }

    pub async fn settings(&self) -> ClusterSettings {
        self.settings.read().await.clone()
    }

    fn emit(&self, state: &mut MembershipState, event: MembershipEvent) {
        state.version += 1;
        debug!("成员事件: version={}, event={:?}", state.version, event);
        // 没有订阅者时发送失败可以忽略
        let _ = self.events.send(MembershipChange {
            version: state.version,
            event,
        });
    }

    // ========================================================================
    // 查询
    // ========================================================================

    pub async fn get(&self, system_id: &str) -> Option<ControllerNode> {
        self.state.read().await.nodes.get(system_id).cloned()
    }

    pub async fn list(&self) -> Vec<ControllerNode> {
        self.state.read().await.nodes.values().cloned().collect()
    }

    pub async fn rpc_plan(&self, rack_id: &str) -> Vec<String> {
        self.state
            .read()
            .await
            .rpc_plans
            .get(rack_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn power_owner(&self, machine_id: &str) -> Option<String> {
        self.state.read().await.power_owners.get(machine_id).cloned()
    }

    /// 当前所有 DHCP 主备对
    pub async fn peerings(&self) -> Vec<FailoverPeering> {
        let split = self.settings.read().await.dhcp_failover_split;
        let state = self.state.read().await;
        self.registry
            .list_vlans()
            .await
            .into_iter()
            .filter(|v| v.dhcp_on)
            .filter_map(|v| {
                let primary = v.primary_rack?;
                let secondary = v.secondary_rack?;
                Some(FailoverPeering {
                    vlan_id: v.id,
                    primary,
                    secondary,
                    split,
                    replication: state
                        .replication
                        .get(&v.id)
                        .copied()
                        .unwrap_or(ReplicationState::InSync),
                })
            })
            .collect()
    }

    /// 中转复制消息时观察到的复制状态
    pub async fn mark_replication(&self, vlan_id: VlanId, replication: ReplicationState) {
        let mut state = self.state.write().await;
        let previous = state.replication.insert(vlan_id, replication);
        if previous != Some(replication) {
            info!("VLAN {} 复制状态: {:?}", vlan_id, replication);
        }
    }

    /// 下发给某个机架的 DHCP 配置
    pub async fn dhcp_configs_for(&self, rack_id: &str) -> Vec<VlanDhcpConfig> {
        let split = self.settings.read().await.dhcp_failover_split;
        let mut configs = Vec::new();

        for vlan in self.registry.list_vlans().await {
            if !vlan.dhcp_on {
                continue;
            }
            let (role, partner) = if vlan.primary_rack.as_deref() == Some(rack_id) {
                (DhcpRole::Primary, vlan.secondary_rack.clone())
            } else if vlan.secondary_rack.as_deref() == Some(rack_id) {
                (DhcpRole::Secondary, vlan.primary_rack.clone())
            } else {
                continue;
            };
            let subnets = self
                .registry
                .subnets_on_vlan(vlan.id)
                .await
                .into_iter()
                .map(|s| s.id)
                .collect();
            configs.push(VlanDhcpConfig {
                vlan_id: vlan.id,
                enabled: true,
                role,
                partner,
                split,
                subnets,
            });
        }
        configs.sort_by_key(|c| c.vlan_id);
        configs
    }

    // ========================================================================
    // 成员变更
    // ========================================================================

    /// 注册或重新注册节点
    pub async fn register(&self, mut node: ControllerNode) -> Result<ControllerNode> {
        if node.system_id.is_empty() {
            return Err(Error::InvalidArgument("system_id 不能为空".to_string()));
        }
        node.online = true;

        let mut state = self.state.write().await;
        let known = state.nodes.insert(node.system_id.clone(), node.clone()).is_some();
        info!(
            "✅ 控制器注册: system_id={}, hostname={}, role={}, vlans={:?}, known={}",
            node.system_id,
            node.hostname,
            node.role.as_str(),
            node.vlans,
            known
        );
        self.emit(
            &mut state,
            MembershipEvent::Registered {
                system_id: node.system_id.clone(),
            },
        );
        self.rebalance(&mut state, true).await?;
        Ok(node)
    }

    /// 启动时载入已知控制器，全部视为离线，等待重新注册或心跳
    pub async fn restore(&self, nodes: Vec<ControllerNode>) {
        let mut state = self.state.write().await;
        for mut node in nodes {
            node.online = false;
            state.nodes.entry(node.system_id.clone()).or_insert(node);
        }
        info!("载入已知控制器: {} 个", state.nodes.len());
        self.rebalance_rpc_plans(&mut state);
    }

    /// 记录心跳；离线节点恢复在线
    pub async fn heartbeat(
        &self,
        system_id: &str,
        vlans: Option<std::collections::BTreeSet<VlanId>>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let node = state
            .nodes
            .get_mut(system_id)
            .ok_or_else(|| Error::NotFound(format!("控制器 {}", system_id)))?;

        node.last_heartbeat = now;
        let came_online = !node.online;
        node.online = true;

        let vlans_changed = match vlans {
            Some(vlans) if vlans != node.vlans => {
                node.vlans = vlans;
                true
            }
            _ => false,
        };

        if came_online {
            info!("🔗 控制器恢复在线: {}", system_id);
            self.emit(
                &mut state,
                MembershipEvent::CameOnline {
                    system_id: system_id.to_string(),
                },
            );
        }
        if came_online || vlans_changed {
            self.rebalance(&mut state, vlans_changed).await?;
        }
        Ok(())
    }

    /// 合并数据库中由其他区域控制器写入的心跳，返回恢复在线的节点
    ///
    /// 只接受比内存中更新且未超时的记录，本节点跳过。
    pub async fn absorb_heartbeats(
        &self,
        self_id: &str,
        persisted: Vec<ControllerNode>,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> Result<Vec<String>> {
        let limit = chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::seconds(90));
        let mut state = self.state.write().await;
        let mut revived = Vec::new();
        let mut peering = false;

        for seen in persisted {
            if seen.system_id == self_id || now - seen.last_heartbeat > limit {
                continue;
            }
            match state.nodes.get_mut(&seen.system_id) {
                Some(node) => {
                    if seen.last_heartbeat <= node.last_heartbeat {
                        continue;
                    }
                    node.last_heartbeat = seen.last_heartbeat;
                    if node.vlans != seen.vlans {
                        node.vlans = seen.vlans;
                        peering = true;
                    }
                    if !node.online {
                        node.online = true;
                        revived.push(seen.system_id);
                    }
                }
                None => {
                    // 在其他区域控制器上注册的新节点
                    let system_id = seen.system_id.clone();
                    state.nodes.insert(
                        system_id.clone(),
                        ControllerNode {
                            online: true,
                            ..seen
                        },
                    );
                    revived.push(system_id);
                    peering = true;
                }
            }
        }

        for system_id in &revived {
            info!("🔗 控制器恢复在线（数据库心跳）: {}", system_id);
            self.emit(
                &mut state,
                MembershipEvent::CameOnline {
                    system_id: system_id.clone(),
                },
            );
        }
        if !revived.is_empty() || peering {
            self.rebalance(&mut state, peering).await?;
        }
        Ok(revived)
    }

    /// 心跳超时检测，返回本次被标记离线的节点
    pub async fn mark_stale(&self, now: DateTime<Utc>, timeout: Duration) -> Result<Vec<String>> {
        let limit = chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::seconds(90));
        let mut state = self.state.write().await;

        let stale: Vec<String> = state
            .nodes
            .values()
            .filter(|n| n.online && now - n.last_heartbeat > limit)
            .map(|n| n.system_id.clone())
            .collect();
        if stale.is_empty() {
            return Ok(stale);
        }

        for system_id in &stale {
            if let Some(node) = state.nodes.get_mut(system_id) {
                node.online = false;
            }
            warn!("⚠️ 控制器心跳超时，标记离线: {}", system_id);
            self.emit(
                &mut state,
                MembershipEvent::WentOffline {
                    system_id: system_id.clone(),
                },
            );
        }
        self.rebalance(&mut state, false).await?;
        Ok(stale)
    }

    /// 注销节点
    ///
    /// 节点是某个启用 DHCP 的 VLAN 的主控且没有可用备控时，非强制注销返回
    /// `IsPrimaryRack`；强制注销会关闭这些 VLAN 的 DHCP。
    pub async fn deregister(&self, system_id: &str, force: bool) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.nodes.contains_key(system_id) {
            return Err(Error::NotFound(format!("控制器 {}", system_id)));
        }

        let mut orphaned = Vec::new();
        for vlan in self.registry.list_vlans().await {
            if !vlan.dhcp_on || vlan.primary_rack.as_deref() != Some(system_id) {
                continue;
            }
            let viable = vlan
                .secondary_rack
                .as_deref()
                .map(|s| s != system_id && state.is_live_rack(s))
                .unwrap_or(false);
            if !viable {
                orphaned.push(vlan.id);
            }
        }

        if !orphaned.is_empty() {
            if !force {
                return Err(Error::IsPrimaryRack {
                    system_id: system_id.to_string(),
                    vlans: orphaned,
                });
            }
            for vlan_id in &orphaned {
                let vlan = self
                    .registry
                    .set_vlan_dhcp(
                        *vlan_id,
                        None,
                        VlanDhcpUpdate {
                            dhcp_on: false,
                            primary_rack: None,
                            secondary_rack: None,
                        },
                    )
                    .await?;
                warn!("🛑 强制注销 {}: 关闭 VLAN {} 的 DHCP", system_id, vlan_id);
                self.emit(&mut state, MembershipEvent::PeeringChanged { vlan });
            }
        }

        state.nodes.remove(system_id);
        state.rpc_plans.remove(system_id);
        info!("控制器已注销: {}", system_id);
        self.emit(
            &mut state,
            MembershipEvent::Deregistered {
                system_id: system_id.to_string(),
            },
        );
        self.rebalance(&mut state, true).await
    }

    /// 手动指定 VLAN 的 DHCP 主备
    pub async fn reconfigure_dhcp(
        &self,
        vlan_id: VlanId,
        dhcp_on: bool,
        primary: Option<String>,
        secondary: Option<String>,
    ) -> Result<Option<FailoverPeering>> {
        let mut state = self.state.write().await;
        self.registry.get_vlan(vlan_id).await?;

        if dhcp_on && primary.is_none() {
            return Err(Error::InvalidArgument(format!(
                "VLAN {} 启用 DHCP 需要指定主控机架",
                vlan_id
            )));
        }
        if primary.is_none() && secondary.is_some() {
            return Err(Error::InvalidArgument("指定备控时必须同时指定主控".to_string()));
        }
        if primary.is_some() && primary == secondary {
            return Err(Error::InvalidArgument("主控与备控不能是同一个机架".to_string()));
        }
        for rack in primary.iter().chain(secondary.iter()) {
            let node = state
                .nodes
                .get(rack)
                .ok_or_else(|| Error::NotFound(format!("机架控制器 {}", rack)))?;
            if !node.role.is_rack() {
                return Err(Error::InvalidArgument(format!("{} 不是机架控制器", rack)));
            }
            if !state.attached(rack, vlan_id) {
                return Err(Error::InvalidArgument(format!(
                    "机架 {} 未接入 VLAN {}",
                    rack, vlan_id
                )));
            }
        }

        let vlan = self
            .registry
            .set_vlan_dhcp(
                vlan_id,
                None,
                VlanDhcpUpdate {
                    dhcp_on,
                    primary_rack: primary.clone(),
                    secondary_rack: secondary.clone(),
                },
            )
            .await?;
        state.replication.remove(&vlan_id);
        self.emit(&mut state, MembershipEvent::PeeringChanged { vlan: vlan.clone() });

        let split = self.settings.read().await.dhcp_failover_split;
        Ok(match (vlan.dhcp_on, primary, secondary) {
            (true, Some(primary), Some(secondary)) => Some(FailoverPeering {
                vlan_id,
                primary,
                secondary,
                split,
                replication: ReplicationState::InSync,
            }),
            _ => None,
        })
    }

    /// 登记机器，用于分配电源控制归属
    pub async fn register_machine(&self, machine_id: &str, bmc_vlan: Option<VlanId>) -> Result<Option<String>> {
        let mut state = self.state.write().await;
        state.machines.insert(machine_id.to_string(), bmc_vlan);
        self.rebalance_power(&mut state);
        Ok(state.power_owners.get(machine_id).cloned())
    }

    pub async fn unregister_machine(&self, machine_id: &str) {
        let mut state = self.state.write().await;
        state.machines.remove(machine_id);
        state.power_owners.remove(machine_id);
    }

    // ========================================================================
    // 重新平衡
    // ========================================================================

    async fn rebalance(&self, state: &mut MembershipState, peering: bool) -> Result<()> {
        self.rebalance_rpc_plans(state);
        if peering {
            self.rebalance_peerings(state).await?;
        }
        self.rebalance_power(state);
        Ok(())
    }

    /// 每个机架拿到全部在线区域控制器，起点按机架序号轮转
    fn rebalance_rpc_plans(&self, state: &mut MembershipState) {
        let regions: Vec<String> = state
            .nodes
            .values()
            .filter(|n| n.online && n.role.is_region())
            .map(|n| n.rpc_endpoint.clone().unwrap_or_else(|| n.system_id.clone()))
            .collect();
        let racks: Vec<String> = state
            .nodes
            .values()
            .filter(|n| n.role.is_rack())
            .map(|n| n.system_id.clone())
            .collect();

        for (index, rack_id) in racks.into_iter().enumerate() {
            let mut plan = regions.clone();
            if !plan.is_empty() {
                let len = plan.len();
                plan.rotate_left(index % len);
            }
            if state.rpc_plans.get(&rack_id) != Some(&plan) {
                state.rpc_plans.insert(rack_id.clone(), plan.clone());
                self.emit(state, MembershipEvent::RpcPlanChanged { rack_id, plan });
            }
        }
    }

    async fn rebalance_peerings(&self, state: &mut MembershipState) -> Result<()> {
        for vlan in self.registry.list_vlans().await {
            if !vlan.dhcp_on {
                continue;
            }
            let registered = |id: &Option<String>| {
                id.as_ref()
                    .map(|id| state.nodes.contains_key(id))
                    .unwrap_or(false)
            };

            let mut primary = vlan.primary_rack.clone();
            let mut secondary = vlan.secondary_rack.clone();

            if !registered(&primary) {
                if registered(&secondary) {
                    info!(
                        "🔄 VLAN {} 主控 {:?} 已移除，提升备控 {:?}",
                        vlan.id, primary, secondary
                    );
                    primary = secondary.take();
                } else {
                    primary = None;
                    secondary = None;
                }
            }
            if secondary.is_some() && !registered(&secondary) {
                secondary = None;
            }
            // 单机模式的 VLAN 在有其他在线机架接入时同样补选备控
            if secondary.is_none() {
                if let Some(p) = &primary {
                    secondary = state.elect_secondary(vlan.id, p);
                    match &secondary {
                        Some(s) => info!("VLAN {} 选举新备控: {}", vlan.id, s),
                        None if vlan.secondary_rack.is_some() => {
                            info!("VLAN {} 没有可用备控，进入单机模式", vlan.id)
                        }
                        None => {}
                    }
                }
            }

            if primary == vlan.primary_rack && secondary == vlan.secondary_rack {
                continue;
            }

            let dhcp_on = primary.is_some();
            if !dhcp_on {
                warn!("VLAN {} 没有可用的 DHCP 机架，关闭 DHCP", vlan.id);
            }
            let updated = self
                .registry
                .set_vlan_dhcp(
                    vlan.id,
                    Some(vlan.version),
                    VlanDhcpUpdate {
                        dhcp_on,
                        primary_rack: primary,
                        secondary_rack: secondary,
                    },
                )
                .await?;
            state.replication.remove(&vlan.id);
            self.emit(state, MembershipEvent::PeeringChanged { vlan: updated });
        }
        Ok(())
    }

    /// 保留在线且接入 BMC VLAN 的归属机架，否则选择负载最低的候选机架
    fn rebalance_power(&self, state: &mut MembershipState) {
        let mut load: HashMap<String, usize> = HashMap::new();
        for (machine_id, owner) in &state.power_owners {
            if state.machines.contains_key(machine_id) {
                *load.entry(owner.clone()).or_default() += 1;
            }
        }

        let machines: Vec<(String, Option<VlanId>)> = state
            .machines
            .iter()
            .map(|(id, vlan)| (id.clone(), *vlan))
            .collect();

        for (machine_id, bmc_vlan) in machines {
            let eligible = |state: &MembershipState, rack: &str| {
                state.is_live_rack(rack)
                    && bmc_vlan.map(|v| state.attached(rack, v)).unwrap_or(true)
            };

            let current = state.power_owners.get(&machine_id).cloned();
            if let Some(owner) = &current {
                if eligible(state, owner) {
                    continue;
                }
                if let Some(count) = load.get_mut(owner) {
                    *count = count.saturating_sub(1);
                }
            }

            let candidate = state
                .nodes
                .values()
                .filter(|n| eligible(state, &n.system_id))
                .min_by_key(|n| (load.get(&n.system_id).copied().unwrap_or(0), n.system_id.clone()))
                .map(|n| n.system_id.clone());

            match &candidate {
                Some(rack) => {
                    *load.entry(rack.clone()).or_default() += 1;
                    state.power_owners.insert(machine_id.clone(), rack.clone());
                }
                None => {
                    state.power_owners.remove(&machine_id);
                }
            }
            if candidate != current {
                info!(
                    "⚡ 电源归属变更: machine={}, {:?} -> {:?}",
                    machine_id, current, candidate
                );
                self.emit(
                    state,
                    MembershipEvent::PowerOwnerChanged {
                        machine_id,
                        rack_id: candidate,
                    },
                );
            }
        }
    }
}
