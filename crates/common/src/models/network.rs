/// 网络拓扑模型
///
/// Fabric -> VLAN -> Subnet -> IPRange 的层级结构

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::errors::Error;

pub type FabricId = i64;
pub type VlanId = i64;
pub type SubnetId = i64;
pub type RangeId = i64;

/// VLAN VID 上限（802.1Q）
pub const MAX_VID: u16 = 4094;

/// MAC 地址
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

impl FromStr for MacAddress {
    type Err = Error;

    /// 接受 `aa:bb:cc:dd:ee:ff` 与 `aa-bb-cc-dd-ee-ff`，大小写不敏感
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(|c| c == ':' || c == '-').collect();
        if parts.len() != 6 {
            return Err(Error::InvalidArgument(format!("无效的 MAC 地址: {}", s)));
        }

        let mut octets = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            if part.len() != 2 {
                return Err(Error::InvalidArgument(format!("无效的 MAC 地址: {}", s)));
            }
            octets[i] = u8::from_str_radix(part, 16)
                .map_err(|_| Error::InvalidArgument(format!("无效的 MAC 地址: {}", s)))?;
        }

        Ok(Self(octets))
    }
}

impl Serialize for MacAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Fabric：共享二层连通性的一组 VLAN
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Fabric {
    pub id: FabricId,
    pub name: String,
    pub default_vlan_id: VlanId,
}

/// VLAN
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Vlan {
    pub id: VlanId,
    pub fabric_id: FabricId,
    pub vid: u16,
    pub name: String,
    pub mtu: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub space: Option<String>,
    pub dhcp_on: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_rack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary_rack: Option<String>,
    pub version: u64,
}

/// 子网
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Subnet {
    pub id: SubnetId,
    pub cidr: Ipv4Network,
    pub vlan_id: VlanId,
    /// 受管子网：MAAS 风格的地址管理，保留段被排除在分配之外
    pub managed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_ip: Option<Ipv4Addr>,
    #[serde(default)]
    pub dns_servers: Vec<Ipv4Addr>,
    /// 在该子网上禁用的引导方式名称，例如 `pxe`
    #[serde(default)]
    pub disabled_boot_architectures: Vec<String>,
    pub version: u64,
}

impl Subnet {
    /// 地址相对于网络地址的偏移
    pub fn offset_of(&self, ip: Ipv4Addr) -> u32 {
        u32::from(ip).wrapping_sub(u32::from(self.cidr.network()))
    }
}

/// 地址段类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IpRangeType {
    Dynamic,
    Reserved,
}

impl IpRangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IpRangeType::Dynamic => "dynamic",
            IpRangeType::Reserved => "reserved",
        }
    }
}

impl FromStr for IpRangeType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dynamic" => Ok(IpRangeType::Dynamic),
            "reserved" => Ok(IpRangeType::Reserved),
            other => Err(Error::InvalidArgument(format!("未知的地址段类型: {}", other))),
        }
    }
}

/// IP 地址段（闭区间）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IpRange {
    pub id: RangeId,
    pub subnet_id: SubnetId,
    #[serde(rename = "type")]
    pub range_type: IpRangeType,
    pub start_ip: Ipv4Addr,
    pub end_ip: Ipv4Addr,
    #[serde(default)]
    pub comment: String,
}

impl IpRange {
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        ip >= self.start_ip && ip <= self.end_ip
    }

    pub fn overlaps(&self, start: Ipv4Addr, end: Ipv4Addr) -> bool {
        start <= self.end_ip && self.start_ip <= end
    }

    pub fn size(&self) -> u32 {
        u32::from(self.end_ip) - u32::from(self.start_ip) + 1
    }
}

/// 主机保留：固定 MAC 始终获得固定地址
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostReservation {
    pub subnet_id: SubnetId,
    pub mac_address: MacAddress,
    pub ip: Ipv4Addr,
}

/// 拓扑快照，用于下发给机架控制器与持久化
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TopologySnapshot {
    pub version: u64,
    pub fabrics: Vec<Fabric>,
    pub vlans: Vec<Vlan>,
    pub subnets: Vec<Subnet>,
    pub ranges: Vec<IpRange>,
    #[serde(default)]
    pub host_reservations: Vec<HostReservation>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_parse_and_display() {
        let mac: MacAddress = "AA:BB:CC:00:01:02".parse().unwrap();
        assert_eq!(mac.to_string(), "aa:bb:cc:00:01:02");

        let dashed: MacAddress = "aa-bb-cc-00-01-02".parse().unwrap();
        assert_eq!(mac, dashed);

        assert!("aa:bb:cc:00:01".parse::<MacAddress>().is_err());
        assert!("aa:bb:cc:00:01:0g".parse::<MacAddress>().is_err());
    }

    #[test]
    fn test_mac_serde_as_string() {
        let mac: MacAddress = "52:54:00:12:34:56".parse().unwrap();
        let json = serde_json::to_string(&mac).unwrap();
        assert_eq!(json, "\"52:54:00:12:34:56\"");
    }

    #[test]
    fn test_range_overlap() {
        let range = IpRange {
            id: 1,
            subnet_id: 1,
            range_type: IpRangeType::Dynamic,
            start_ip: Ipv4Addr::new(10, 0, 0, 50),
            end_ip: Ipv4Addr::new(10, 0, 0, 99),
            comment: String::new(),
        };
        assert!(range.overlaps(Ipv4Addr::new(10, 0, 0, 99), Ipv4Addr::new(10, 0, 0, 120)));
        assert!(!range.overlaps(Ipv4Addr::new(10, 0, 0, 100), Ipv4Addr::new(10, 0, 0, 120)));
        assert_eq!(range.size(), 50);
    }
}
