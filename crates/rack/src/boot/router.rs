/// 引导请求路由
///
/// 根据客户端架构、子网禁用的引导方式和机器状态决定
/// next-server / 引导文件。没有匹配时不返回引导参数。

use async_trait::async_trait;
use common::models::{Machine, MachineStatus, MacAddress, SubnetId};
use common::{Result, SubnetRegistry};
use serde::Serialize;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, warn};

use super::methods::{self, BootMethod};

/// 机器目录（生产环境向区域控制器查询）
#[async_trait]
pub trait MachineDirectory: Send + Sync {
    async fn find_by_mac(&self, mac: MacAddress) -> Result<Option<Machine>>;
}

/// 引导目的
///
/// 只作参考，不影响 next-server 与引导文件：引导文件只由架构决定，
/// 加载器启动后再按目的取对应的配置。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BootPurpose {
    /// 未知机器，进入登记环境
    Enlistment,
    Commissioning,
    Rescue,
    Install,
    LocalBoot,
    PowerOff,
}

impl BootPurpose {
    pub fn for_machine(machine: Option<&Machine>) -> Self {
        let Some(machine) = machine else {
            return BootPurpose::Enlistment;
        };
        match machine.status {
            MachineStatus::New | MachineStatus::Commissioning | MachineStatus::Testing => {
                BootPurpose::Commissioning
            }
            MachineStatus::Rescue => BootPurpose::Rescue,
            MachineStatus::Deploying => BootPurpose::Install,
            MachineStatus::Deployed | MachineStatus::Broken => BootPurpose::LocalBoot,
            MachineStatus::Ready | MachineStatus::Allocated => BootPurpose::PowerOff,
        }
    }
}

/// 请求来源
#[derive(Debug, Clone, Default)]
pub struct BootSource {
    /// 接收请求的本地接口
    pub interface: Option<String>,
    pub subnet_id: Option<SubnetId>,
    /// option 93
    pub client_arch: Vec<u16>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BootInstructions {
    pub next_server: Ipv4Addr,
    pub boot_filename: String,
    pub architecture_hint: String,
    pub method: &'static str,
    /// 参考信息，见 [`BootPurpose`]
    pub purpose: BootPurpose,
    pub http: bool,
}

pub struct BootRouter {
    next_server: Ipv4Addr,
    http_port: u16,
    registry: Arc<SubnetRegistry>,
    machines: Arc<dyn MachineDirectory>,
}

impl BootRouter {
    pub fn new(
        next_server: Ipv4Addr,
        http_port: u16,
        registry: Arc<SubnetRegistry>,
        machines: Arc<dyn MachineDirectory>,
    ) -> Self {
        Self {
            next_server,
            http_port,
            registry,
            machines,
        }
    }

    async fn disabled_methods(&self, subnet_id: Option<SubnetId>) -> Vec<String> {
        let Some(subnet_id) = subnet_id else {
            return Vec::new();
        };
        match self.registry.get_subnet(subnet_id).await {
            Ok(subnet) => {
                for name in &subnet.disabled_boot_architectures {
                    if methods::find_by_name(name).is_none() {
                        warn!("子网 {} 禁用了未知的引导方式: {}", subnet_id, name);
                    }
                }
                subnet.disabled_boot_architectures
            }
            Err(_) => Vec::new(),
        }
    }

    fn boot_filename(&self, method: &BootMethod) -> String {
        if method.http {
            format!(
                "http://{}:{}/images/{}",
                self.next_server, self.http_port, method.bootloader
            )
        } else {
            method.bootloader.to_string()
        }
    }

    pub async fn route_boot(&self, mac: MacAddress, source: &BootSource) -> Option<BootInstructions> {
        let disabled = self.disabled_methods(source.subnet_id).await;

        let Some(method) = methods::select(&source.client_arch, &disabled) else {
            debug!(
                "没有匹配的引导方式: mac={}, arch={:?}, interface={:?}, disabled={:?}",
                mac, source.client_arch, source.interface, disabled
            );
            return None;
        };

        let machine = match self.machines.find_by_mac(mac).await {
            Ok(machine) => machine,
            Err(e) => {
                warn!("查询机器失败，不下发引导参数: mac={}, error={}", mac, e);
                return None;
            }
        };
        let purpose = BootPurpose::for_machine(machine.as_ref());
        let architecture_hint = machine
            .as_ref()
            .map(|m| m.architecture.clone())
            .filter(|a| !a.is_empty())
            .unwrap_or_else(|| method.arch_hint.to_string());

        debug!(
            "引导路由: mac={}, method={}, purpose={:?}, arch={}",
            mac, method.name, purpose, architecture_hint
        );

        Some(BootInstructions {
            next_server: self.next_server,
            boot_filename: self.boot_filename(method),
            architecture_hint,
            method: method.name,
            purpose,
            http: method.http,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::models::PowerType;
    use common::topology::{NewSubnet, SubnetUpdate};
    use std::collections::HashMap;

    struct StaticDirectory(HashMap<MacAddress, Machine>);

    #[async_trait]
    impl MachineDirectory for StaticDirectory {
        async fn find_by_mac(&self, mac: MacAddress) -> Result<Option<Machine>> {
            Ok(self.0.get(&mac).cloned())
        }
    }

    fn machine(mac: MacAddress, status: MachineStatus) -> Machine {
        Machine {
            system_id: "abc123".into(),
            hostname: "node-1".into(),
            architecture: "arm64/generic".into(),
            status,
            boot_macs: vec![mac],
            power_type: PowerType::Manual,
            power_parameters: Default::default(),
            bmc_vlan_id: None,
        }
    }

    async fn router(known: Vec<Machine>) -> (BootRouter, SubnetId, Arc<SubnetRegistry>) {
        let registry = Arc::new(SubnetRegistry::new());
        let (_, vlan) = registry.create_fabric("fabric-0").await.unwrap();
        let subnet = registry
            .create_subnet(NewSubnet {
                vlan_id: vlan.id,
                cidr: "10.0.0.0/24".parse().unwrap(),
                managed: true,
                gateway_ip: None,
                dns_servers: vec![],
            })
            .await
            .unwrap();

        let directory = StaticDirectory(
            known
                .into_iter()
                .flat_map(|m| m.boot_macs.clone().into_iter().map(move |mac| (mac, m.clone())))
                .collect(),
        );
        let router = BootRouter::new(
            Ipv4Addr::new(10, 0, 0, 2),
            5248,
            registry.clone(),
            Arc::new(directory),
        );
        (router, subnet.id, registry)
    }

    #[tokio::test]
    async fn test_unknown_mac_enlists_over_pxe() {
        let (router, subnet_id, _) = router(vec![]).await;
        let mac: MacAddress = "aa:bb:cc:00:00:01".parse().unwrap();
        let source = BootSource {
            subnet_id: Some(subnet_id),
            ..Default::default()
        };

        let boot = router.route_boot(mac, &source).await.unwrap();
        assert_eq!(boot.boot_filename, "lpxelinux.0");
        assert_eq!(boot.next_server, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(boot.purpose, BootPurpose::Enlistment);
        assert_eq!(boot.architecture_hint, "i386/generic");
    }

    #[tokio::test]
    async fn test_known_machine_purpose_and_http_boot() {
        let mac: MacAddress = "aa:bb:cc:00:00:02".parse().unwrap();
        let (router, subnet_id, _) = router(vec![machine(mac, MachineStatus::Deploying)]).await;
        let source = BootSource {
            subnet_id: Some(subnet_id),
            client_arch: vec![0x0013],
            ..Default::default()
        };

        let boot = router.route_boot(mac, &source).await.unwrap();
        assert_eq!(boot.purpose, BootPurpose::Install);
        assert_eq!(boot.architecture_hint, "arm64/generic");
        assert!(boot.http);
        assert_eq!(boot.boot_filename, "http://10.0.0.2:5248/images/bootaa64.efi");
    }

    #[tokio::test]
    async fn test_disabled_architecture_gives_no_boot() {
        let (router, subnet_id, registry) = router(vec![]).await;
        let subnet = registry.get_subnet(subnet_id).await.unwrap();
        registry
            .update_subnet(
                subnet_id,
                subnet.version,
                SubnetUpdate {
                    disabled_boot_architectures: Some(vec!["pxe".into()]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let mac: MacAddress = "aa:bb:cc:00:00:03".parse().unwrap();
        let source = BootSource {
            subnet_id: Some(subnet_id),
            ..Default::default()
        };
        assert!(router.route_boot(mac, &source).await.is_none());
    }

    #[tokio::test]
    async fn test_purpose_does_not_change_boot_file() {
        let deploying: MacAddress = "aa:bb:cc:00:00:05".parse().unwrap();
        let deployed: MacAddress = "aa:bb:cc:00:00:06".parse().unwrap();
        let mut other = machine(deployed, MachineStatus::Deployed);
        other.system_id = "def456".into();
        let (router, subnet_id, _) =
            router(vec![machine(deploying, MachineStatus::Deploying), other]).await;
        let source = BootSource {
            subnet_id: Some(subnet_id),
            client_arch: vec![0x0007],
            ..Default::default()
        };

        let install = router.route_boot(deploying, &source).await.unwrap();
        let local = router.route_boot(deployed, &source).await.unwrap();
        assert_eq!(install.purpose, BootPurpose::Install);
        assert_eq!(local.purpose, BootPurpose::LocalBoot);
        assert_eq!(install.boot_filename, local.boot_filename);
        assert_eq!(install.next_server, local.next_server);
    }

    #[test]
    fn test_purpose_by_status() {
        let mac: MacAddress = "aa:bb:cc:00:00:04".parse().unwrap();
        assert_eq!(BootPurpose::for_machine(None), BootPurpose::Enlistment);
        let ready = machine(mac, MachineStatus::Ready);
        assert_eq!(BootPurpose::for_machine(Some(&ready)), BootPurpose::PowerOff);
        let deployed = machine(mac, MachineStatus::Deployed);
        assert_eq!(BootPurpose::for_machine(Some(&deployed)), BootPurpose::LocalBoot);
    }
}
