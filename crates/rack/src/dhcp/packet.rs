/// DHCPv4 报文编解码
///
/// BOOTP 固定头（236 字节）+ magic cookie + options。
/// 只解析本服务用到的选项，其余选项跳过。

use common::models::MacAddress;
use std::net::Ipv4Addr;
use thiserror::Error;

pub const BOOTREQUEST: u8 = 1;
pub const BOOTREPLY: u8 = 2;

const HTYPE_ETHERNET: u8 = 1;
const HEADER_LEN: usize = 236;
const MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];
/// BOOTP 报文最小长度
const MIN_PACKET_LEN: usize = 300;
/// flags 中的广播位
const FLAG_BROADCAST: u16 = 0x8000;

/// 选项编号
pub mod options {
    pub const PAD: u8 = 0;
    pub const SUBNET_MASK: u8 = 1;
    pub const ROUTER: u8 = 3;
    pub const DNS_SERVERS: u8 = 6;
    pub const HOSTNAME: u8 = 12;
    pub const REQUESTED_IP: u8 = 50;
    pub const LEASE_TIME: u8 = 51;
    pub const MESSAGE_TYPE: u8 = 53;
    pub const SERVER_ID: u8 = 54;
    pub const PARAMETER_LIST: u8 = 55;
    pub const VENDOR_CLASS: u8 = 60;
    pub const CLIENT_ID: u8 = 61;
    pub const TFTP_SERVER: u8 = 66;
    pub const BOOTFILE: u8 = 67;
    pub const CLIENT_ARCH: u8 = 93;
    pub const END: u8 = 255;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("报文过短: {0} 字节")]
    TooShort(usize),

    #[error("magic cookie 无效")]
    BadCookie,

    #[error("选项 {0} 被截断")]
    Truncated(u8),

    #[error("选项 {code} 长度无效: {len}")]
    BadLength { code: u8, len: usize },

    #[error("未知的 DHCP 消息类型: {0}")]
    UnknownMessageType(u8),
}

/// option 53
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Discover = 1,
    Offer = 2,
    Request = 3,
    Decline = 4,
    Ack = 5,
    Nak = 6,
    Release = 7,
    Inform = 8,
}

impl TryFrom<u8> for MessageType {
    type Error = PacketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => MessageType::Discover,
            2 => MessageType::Offer,
            3 => MessageType::Request,
            4 => MessageType::Decline,
            5 => MessageType::Ack,
            6 => MessageType::Nak,
            7 => MessageType::Release,
            8 => MessageType::Inform,
            other => return Err(PacketError::UnknownMessageType(other)),
        })
    }
}

/// 解析后的选项
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DhcpOptions {
    pub message_type: Option<MessageType>,
    pub subnet_mask: Option<Ipv4Addr>,
    pub routers: Vec<Ipv4Addr>,
    pub dns_servers: Vec<Ipv4Addr>,
    pub hostname: Option<String>,
    pub requested_ip: Option<Ipv4Addr>,
    pub lease_time: Option<u32>,
    pub server_id: Option<Ipv4Addr>,
    pub parameter_list: Vec<u8>,
    pub vendor_class: Option<String>,
    pub client_id: Option<Vec<u8>>,
    pub tftp_server: Option<String>,
    pub bootfile: Option<String>,
    /// RFC 4578 客户端架构
    pub client_arch: Vec<u16>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DhcpPacket {
    pub op: u8,
    pub htype: u8,
    pub hlen: u8,
    pub hops: u8,
    pub xid: u32,
    pub secs: u16,
    pub flags: u16,
    pub ciaddr: Ipv4Addr,
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    pub giaddr: Ipv4Addr,
    pub chaddr: [u8; 16],
    pub sname: String,
    pub file: String,
    pub options: DhcpOptions,
}

fn read_ip(bytes: &[u8]) -> Ipv4Addr {
    Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3])
}

fn read_ips(code: u8, value: &[u8]) -> Result<Vec<Ipv4Addr>, PacketError> {
    if value.is_empty() || value.len() % 4 != 0 {
        return Err(PacketError::BadLength {
            code,
            len: value.len(),
        });
    }
    Ok(value.chunks(4).map(read_ip).collect())
}

fn read_single_ip(code: u8, value: &[u8]) -> Result<Ipv4Addr, PacketError> {
    if value.len() != 4 {
        return Err(PacketError::BadLength {
            code,
            len: value.len(),
        });
    }
    Ok(read_ip(value))
}

/// 以 NUL 结尾的定长字段
fn read_cstr(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn write_cstr(out: &mut Vec<u8>, value: &str, width: usize) {
    let bytes = value.as_bytes();
    let n = bytes.len().min(width - 1);
    out.extend_from_slice(&bytes[..n]);
    out.resize(out.len() + (width - n), 0);
}

fn push_option(out: &mut Vec<u8>, code: u8, value: &[u8]) {
    // 超过 255 字节的值截断
    let n = value.len().min(255);
    out.push(code);
    out.push(n as u8);
    out.extend_from_slice(&value[..n]);
}

impl DhcpOptions {
    fn parse(mut data: &[u8]) -> Result<Self, PacketError> {
        let mut opts = DhcpOptions::default();

        while let Some((&code, rest)) = data.split_first() {
            match code {
                options::PAD => {
                    data = rest;
                    continue;
                }
                options::END => break,
                _ => {}
            }

            let (&len, rest) = rest.split_first().ok_or(PacketError::Truncated(code))?;
            let len = len as usize;
            if rest.len() < len {
                return Err(PacketError::Truncated(code));
            }
            let (value, rest) = rest.split_at(len);
            data = rest;

            match code {
                options::MESSAGE_TYPE => {
                    let raw = *value.first().ok_or(PacketError::BadLength { code, len })?;
                    opts.message_type = Some(MessageType::try_from(raw)?);
                }
                options::SUBNET_MASK => opts.subnet_mask = Some(read_single_ip(code, value)?),
                options::ROUTER => opts.routers = read_ips(code, value)?,
                options::DNS_SERVERS => opts.dns_servers = read_ips(code, value)?,
                options::HOSTNAME => {
                    opts.hostname = Some(String::from_utf8_lossy(value).into_owned())
                }
                options::REQUESTED_IP => opts.requested_ip = Some(read_single_ip(code, value)?),
                options::LEASE_TIME => {
                    let bytes: [u8; 4] = value
                        .try_into()
                        .map_err(|_| PacketError::BadLength { code, len })?;
                    opts.lease_time = Some(u32::from_be_bytes(bytes));
                }
                options::SERVER_ID => opts.server_id = Some(read_single_ip(code, value)?),
                options::PARAMETER_LIST => opts.parameter_list = value.to_vec(),
                options::VENDOR_CLASS => {
                    opts.vendor_class = Some(String::from_utf8_lossy(value).into_owned())
                }
                options::CLIENT_ID => opts.client_id = Some(value.to_vec()),
                options::TFTP_SERVER => {
                    opts.tftp_server = Some(String::from_utf8_lossy(value).into_owned())
                }
                options::BOOTFILE => {
                    opts.bootfile = Some(String::from_utf8_lossy(value).into_owned())
                }
                options::CLIENT_ARCH => {
                    if len % 2 != 0 {
                        return Err(PacketError::BadLength { code, len });
                    }
                    opts.client_arch = value
                        .chunks(2)
                        .map(|c| u16::from_be_bytes([c[0], c[1]]))
                        .collect();
                }
                _ => {}
            }
        }

        Ok(opts)
    }

    fn encode(&self, out: &mut Vec<u8>) {
        if let Some(kind) = self.message_type {
            push_option(out, options::MESSAGE_TYPE, &[kind as u8]);
        }
        if let Some(server_id) = self.server_id {
            push_option(out, options::SERVER_ID, &server_id.octets());
        }
        if let Some(lease_time) = self.lease_time {
            push_option(out, options::LEASE_TIME, &lease_time.to_be_bytes());
        }
        if let Some(mask) = self.subnet_mask {
            push_option(out, options::SUBNET_MASK, &mask.octets());
        }
        if !self.routers.is_empty() {
            let bytes: Vec<u8> = self.routers.iter().flat_map(|ip| ip.octets()).collect();
            push_option(out, options::ROUTER, &bytes);
        }
        if !self.dns_servers.is_empty() {
            let bytes: Vec<u8> = self.dns_servers.iter().flat_map(|ip| ip.octets()).collect();
            push_option(out, options::DNS_SERVERS, &bytes);
        }
        if let Some(hostname) = &self.hostname {
            push_option(out, options::HOSTNAME, hostname.as_bytes());
        }
        if let Some(ip) = self.requested_ip {
            push_option(out, options::REQUESTED_IP, &ip.octets());
        }
        if !self.parameter_list.is_empty() {
            push_option(out, options::PARAMETER_LIST, &self.parameter_list);
        }
        if let Some(vendor_class) = &self.vendor_class {
            push_option(out, options::VENDOR_CLASS, vendor_class.as_bytes());
        }
        if let Some(client_id) = &self.client_id {
            push_option(out, options::CLIENT_ID, client_id);
        }
        if let Some(server) = &self.tftp_server {
            push_option(out, options::TFTP_SERVER, server.as_bytes());
        }
        if let Some(file) = &self.bootfile {
            push_option(out, options::BOOTFILE, file.as_bytes());
        }
        if !self.client_arch.is_empty() {
            let bytes: Vec<u8> = self.client_arch.iter().flat_map(|a| a.to_be_bytes()).collect();
            push_option(out, options::CLIENT_ARCH, &bytes);
        }
        out.push(options::END);
    }
}

impl DhcpPacket {
    pub fn parse(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() < HEADER_LEN + MAGIC_COOKIE.len() {
            return Err(PacketError::TooShort(data.len()));
        }
        if data[HEADER_LEN..HEADER_LEN + 4] != MAGIC_COOKIE {
            return Err(PacketError::BadCookie);
        }

        let mut chaddr = [0u8; 16];
        chaddr.copy_from_slice(&data[28..44]);

        Ok(Self {
            op: data[0],
            htype: data[1],
            hlen: data[2],
            hops: data[3],
            xid: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            secs: u16::from_be_bytes([data[8], data[9]]),
            flags: u16::from_be_bytes([data[10], data[11]]),
            ciaddr: read_ip(&data[12..16]),
            yiaddr: read_ip(&data[16..20]),
            siaddr: read_ip(&data[20..24]),
            giaddr: read_ip(&data[24..28]),
            chaddr,
            sname: read_cstr(&data[44..108]),
            file: read_cstr(&data[108..236]),
            options: DhcpOptions::parse(&data[HEADER_LEN + 4..])?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MIN_PACKET_LEN);
        out.push(self.op);
        out.push(self.htype);
        out.push(self.hlen);
        out.push(self.hops);
        out.extend_from_slice(&self.xid.to_be_bytes());
        out.extend_from_slice(&self.secs.to_be_bytes());
        out.extend_from_slice(&self.flags.to_be_bytes());
        for ip in [self.ciaddr, self.yiaddr, self.siaddr, self.giaddr] {
            out.extend_from_slice(&ip.octets());
        }
        out.extend_from_slice(&self.chaddr);
        write_cstr(&mut out, &self.sname, 64);
        write_cstr(&mut out, &self.file, 128);
        out.extend_from_slice(&MAGIC_COOKIE);
        self.options.encode(&mut out);

        if out.len() < MIN_PACKET_LEN {
            out.resize(MIN_PACKET_LEN, options::PAD);
        }
        out
    }

    /// 以太网客户端的 MAC
    pub fn client_mac(&self) -> Option<MacAddress> {
        if self.htype != HTYPE_ETHERNET || self.hlen != 6 {
            return None;
        }
        let mut octets = [0u8; 6];
        octets.copy_from_slice(&self.chaddr[..6]);
        Some(MacAddress::new(octets))
    }

    pub fn message_type(&self) -> Option<MessageType> {
        self.options.message_type
    }

    pub fn is_relayed(&self) -> bool {
        !self.giaddr.is_unspecified()
    }

    /// 带 option 93，或 option 60 以 `PXEClient` 开头
    pub fn is_pxe(&self) -> bool {
        !self.options.client_arch.is_empty()
            || self
                .options
                .vendor_class
                .as_deref()
                .is_some_and(|class| class.starts_with("PXEClient"))
    }

    pub fn wants_broadcast(&self) -> bool {
        self.flags & FLAG_BROADCAST != 0
    }

    /// 根据请求构造应答骨架
    pub fn reply(&self, kind: MessageType, yiaddr: Ipv4Addr, server_id: Ipv4Addr) -> DhcpPacket {
        DhcpPacket {
            op: BOOTREPLY,
            htype: self.htype,
            hlen: self.hlen,
            hops: 0,
            xid: self.xid,
            secs: 0,
            flags: self.flags,
            ciaddr: if kind == MessageType::Nak {
                Ipv4Addr::UNSPECIFIED
            } else {
                self.ciaddr
            },
            yiaddr,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: self.giaddr,
            chaddr: self.chaddr,
            sname: String::new(),
            file: String::new(),
            options: DhcpOptions {
                message_type: Some(kind),
                server_id: Some(server_id),
                ..Default::default()
            },
        }
    }

    /// 构造一个客户端请求，测试与工具使用
    pub fn request(kind: MessageType, mac: MacAddress, xid: u32) -> DhcpPacket {
        let mut chaddr = [0u8; 16];
        chaddr[..6].copy_from_slice(&mac.octets());
        DhcpPacket {
            op: BOOTREQUEST,
            htype: HTYPE_ETHERNET,
            hlen: 6,
            hops: 0,
            xid,
            secs: 0,
            flags: 0,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr,
            sname: String::new(),
            file: String::new(),
            options: DhcpOptions {
                message_type: Some(kind),
                ..Default::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac() -> MacAddress {
        MacAddress::new([0x52, 0x54, 0x00, 0xab, 0xcd, 0xef])
    }

    #[test]
    fn test_parse_pxe_discover() {
        let mut discover = DhcpPacket::request(MessageType::Discover, mac(), 0xdead_beef);
        discover.secs = 4;
        discover.flags = FLAG_BROADCAST;
        discover.options.client_arch = vec![0x0007];
        discover.options.vendor_class = Some("PXEClient:Arch:00007:UNDI:003016".into());
        discover.options.parameter_list = vec![1, 3, 6, 66, 67];

        let bytes = discover.encode();
        assert_eq!(bytes.len(), MIN_PACKET_LEN);

        let parsed = DhcpPacket::parse(&bytes).unwrap();
        assert_eq!(parsed.xid, 0xdead_beef);
        assert_eq!(parsed.secs, 4);
        assert!(parsed.wants_broadcast());
        assert!(!parsed.is_relayed());
        assert_eq!(parsed.client_mac(), Some(mac()));
        assert_eq!(parsed.message_type(), Some(MessageType::Discover));
        assert_eq!(parsed.options.client_arch, vec![0x0007]);
        assert_eq!(parsed.options.parameter_list, vec![1, 3, 6, 66, 67]);
        assert!(parsed.is_pxe());
        assert!(!DhcpPacket::request(MessageType::Discover, mac(), 1).is_pxe());
    }

    #[test]
    fn test_offer_carries_boot_options() {
        let discover = DhcpPacket::request(MessageType::Discover, mac(), 7);
        let server = Ipv4Addr::new(10, 0, 0, 2);
        let mut offer = discover.reply(MessageType::Offer, Ipv4Addr::new(10, 0, 0, 50), server);
        offer.siaddr = server;
        offer.options.lease_time = Some(600);
        offer.options.subnet_mask = Some(Ipv4Addr::new(255, 255, 255, 0));
        offer.options.routers = vec![Ipv4Addr::new(10, 0, 0, 1)];
        offer.options.tftp_server = Some("10.0.0.2".into());
        offer.options.bootfile = Some("lpxelinux.0".into());

        let parsed = DhcpPacket::parse(&offer.encode()).unwrap();
        assert_eq!(parsed.op, BOOTREPLY);
        assert_eq!(parsed.yiaddr, Ipv4Addr::new(10, 0, 0, 50));
        assert_eq!(parsed.siaddr, server);
        assert_eq!(parsed.options.server_id, Some(server));
        assert_eq!(parsed.options.lease_time, Some(600));
        assert_eq!(parsed.options.bootfile.as_deref(), Some("lpxelinux.0"));
        assert_eq!(parsed.options.tftp_server.as_deref(), Some("10.0.0.2"));
    }

    #[test]
    fn test_rejects_malformed_packets() {
        assert_eq!(DhcpPacket::parse(&[0u8; 100]), Err(PacketError::TooShort(100)));

        let mut bytes = DhcpPacket::request(MessageType::Discover, mac(), 1).encode();
        bytes[HEADER_LEN] = 0;
        assert_eq!(DhcpPacket::parse(&bytes), Err(PacketError::BadCookie));

        // option 50 声明 4 字节但报文只剩 2 字节
        let mut bytes = DhcpPacket::request(MessageType::Request, mac(), 1).encode();
        bytes.truncate(HEADER_LEN + 4);
        bytes.extend_from_slice(&[options::REQUESTED_IP, 4, 10, 0]);
        assert_eq!(
            DhcpPacket::parse(&bytes),
            Err(PacketError::Truncated(options::REQUESTED_IP))
        );
    }

    #[test]
    fn test_non_ethernet_has_no_mac() {
        let mut packet = DhcpPacket::request(MessageType::Discover, mac(), 1);
        packet.htype = 6;
        assert_eq!(packet.client_mac(), None);
    }
}
