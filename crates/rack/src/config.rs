/// 配置管理
///
/// 默认值 < 可选 TOML 文件 < `EASYMETAL_*` 环境变量

use common::models::{ControllerRole, VlanId};
use serde::Deserialize;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    pub system_id: String,
    pub hostname: Option<String>,
    pub role: ControllerRole,
    /// 区域控制器地址，每个地址一条连接
    pub region_urls: Vec<String>,
    /// 机架接入的 VLAN
    pub vlans: Vec<VlanId>,
    /// 非中继 DHCP 请求所属的 VLAN
    pub local_vlan: Option<VlanId>,
    pub dhcp_listen: SocketAddr,
    pub dhcp_interface: Option<String>,
    /// DHCP server identifier 与 next-server
    pub server_ip: Ipv4Addr,
    pub http_boot_port: u16,
    pub lease_checkpoint: PathBuf,
    pub reconnect_interval: u64,
    pub rpc_timeout: u64,
    pub maintenance_interval: u64,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            system_id: String::new(),
            hostname: None,
            role: ControllerRole::Rack,
            region_urls: vec!["ws://localhost:5250/ws/rack".to_string()],
            vlans: Vec::new(),
            local_vlan: None,
            dhcp_listen: SocketAddr::from(([0, 0, 0, 0], 67)),
            dhcp_interface: None,
            server_ip: Ipv4Addr::LOCALHOST,
            http_boot_port: 5248,
            lease_checkpoint: PathBuf::from("/var/lib/easymetal/leases.json"),
            reconnect_interval: 5,
            rpc_timeout: 30,
            maintenance_interval: 5,
            log_level: "debug".to_string(),
        }
    }
}

impl Config {
    /// 加载配置；`path` 指向的文件可以不存在
    pub fn load(path: Option<&str>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("EASYMETAL")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("region_urls")
                .with_list_parse_key("vlans"),
        );

        let mut cfg: Config = builder.build()?.try_deserialize()?;
        if cfg.system_id.is_empty() {
            cfg.system_id = common::utils::generate_system_id();
        }
        if cfg.region_urls.is_empty() {
            anyhow::bail!("至少需要配置一个区域控制器地址");
        }
        Ok(cfg)
    }

    pub fn from_env() -> anyhow::Result<Self> {
        let path = std::env::var("EASYMETAL_CONFIG_FILE").ok();
        Self::load(path.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> (tempfile::TempDir, String) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rack.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        (dir, path.to_string_lossy().into_owned())
    }

    #[test]
    fn test_load_file_over_defaults() {
        let (_dir, path) = write_config(
            r#"
system_id = "rk0001"
region_urls = ["ws://10.0.0.5:5250/ws/rack", "ws://10.0.0.6:5251/ws/rack"]
vlans = [10, 20]
local_vlan = 10
server_ip = "10.0.0.2"
"#,
        );

        let cfg = Config::load(Some(&path)).unwrap();
        assert_eq!(cfg.system_id, "rk0001");
        assert_eq!(cfg.region_urls.len(), 2);
        assert_eq!(cfg.vlans, vec![10, 20]);
        assert_eq!(cfg.local_vlan, Some(10));
        assert_eq!(cfg.server_ip, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(cfg.http_boot_port, 5248);
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let (_dir, path) = write_config("dhcp_split = 128\n");
        assert!(Config::load(Some(&path)).is_err());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let cfg = Config::load(Some("/nonexistent/easymetal-rack")).unwrap();
        assert_eq!(cfg.system_id.len(), 6);
        assert_eq!(cfg.role, ControllerRole::Rack);
    }
}
