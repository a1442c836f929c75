/// DHCP UDP 服务
///
/// 监听 67 端口，把 DISCOVER/REQUEST/RELEASE/DECLINE 交给对应 VLAN 的
/// 主备实例，应答中带上引导路由给出的 next-server 与引导文件。

use common::models::constants::{DHCP_CLIENT_PORT, DHCP_SERVER_PORT};
use common::models::{Lease, Subnet, SubnetId, VlanId};
use common::{Error, Result};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::failover::{ClientRequest, RequestOutcome};
use super::packet::{DhcpPacket, MessageType, BOOTREQUEST};
use super::DhcpService;
use crate::boot::{BootInstructions, BootRouter, BootSource};

const MAX_DATAGRAM: usize = 1500;
const HTTP_CLIENT_CLASS: &str = "HTTPClient";

pub struct DhcpServer {
    service: Arc<DhcpService>,
    boot: Arc<BootRouter>,
    /// 非中继请求所属的 VLAN
    local_vlan: Option<VlanId>,
    interface: Option<String>,
}

impl DhcpServer {
    pub fn new(
        service: Arc<DhcpService>,
        boot: Arc<BootRouter>,
        local_vlan: Option<VlanId>,
        interface: Option<String>,
    ) -> Self {
        Self {
            service,
            boot,
            local_vlan,
            interface,
        }
    }

    pub async fn run(self: Arc<Self>, listen: SocketAddr, cancel: CancellationToken) -> Result<()> {
        let socket = UdpSocket::bind(listen)
            .await
            .map_err(|e| Error::Network(format!("绑定 DHCP 端口 {} 失败: {}", listen, e)))?;
        socket
            .set_broadcast(true)
            .map_err(|e| Error::Network(format!("启用广播失败: {}", e)))?;
        info!("🚀 DHCP 服务监听: {}", listen);

        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            let (len, from) = tokio::select! {
                _ = cancel.cancelled() => break,
                received = socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        error!("接收 DHCP 报文失败: {}", e);
                        continue;
                    }
                },
            };

            let packet = match DhcpPacket::parse(&buf[..len]) {
                Ok(packet) => packet,
                Err(e) => {
                    debug!("丢弃无效报文: from={}, error={}", from, e);
                    continue;
                }
            };

            match self.handle_packet(&packet).await {
                Ok(Some((reply, to))) => {
                    if let Err(e) = socket.send_to(&reply.encode(), to).await {
                        warn!("发送 DHCP 应答失败: to={}, error={}", to, e);
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("处理 DHCP 报文失败: xid={:#x}, error={}", packet.xid, e),
            }
        }

        info!("DHCP 服务已停止");
        Ok(())
    }

    /// 中继请求按 giaddr 定位子网，否则使用本地 VLAN
    async fn locate(&self, packet: &DhcpPacket) -> Option<(VlanId, Option<Subnet>)> {
        if packet.is_relayed() {
            let subnet = self
                .service
                .store()
                .registry()
                .subnet_for_ip(packet.giaddr)
                .await?;
            return Some((subnet.vlan_id, Some(subnet)));
        }
        self.local_vlan.map(|vlan| (vlan, None))
    }

    /// 处理一个请求，返回应答与目的地址
    pub async fn handle_packet(&self, packet: &DhcpPacket) -> Result<Option<(DhcpPacket, SocketAddr)>> {
        if packet.op != BOOTREQUEST {
            return Ok(None);
        }
        let (Some(mac), Some(kind)) = (packet.client_mac(), packet.message_type()) else {
            return Ok(None);
        };

        let Some((vlan_id, subnet)) = self.locate(packet).await else {
            debug!("无法确定请求所属 VLAN: mac={}, giaddr={}", mac, packet.giaddr);
            return Ok(None);
        };
        let Some(peer) = self.service.peer(vlan_id).await else {
            debug!("VLAN {} 未启用 DHCP: mac={}", vlan_id, mac);
            return Ok(None);
        };

        let request = ClientRequest {
            mac,
            secs: packet.secs,
            requested_ip: packet.options.requested_ip,
            client_ip: Some(packet.ciaddr).filter(|ip| !ip.is_unspecified()),
            server_id: packet.options.server_id,
            hostname: packet.options.hostname.clone(),
            subnet_hint: subnet.as_ref().map(|s| s.id),
        };
        debug!("📥 {:?}: mac={}, vlan={}, xid={:#x}", kind, mac, vlan_id, packet.xid);

        // PXE 客户端先确定引导方式，没有匹配时不应答也不分配地址
        let boot = if packet.is_pxe() && matches!(kind, MessageType::Discover | MessageType::Request) {
            let subnet_id = match &subnet {
                Some(subnet) => Some(subnet.id),
                None => peer.config().await.subnets.first().copied(),
            };
            match self.boot.route_boot(mac, &self.boot_source(packet, subnet_id)).await {
                Some(boot) => Some(boot),
                None => {
                    debug!(
                        "PXE 请求没有可用的引导方式，不应答: mac={}, arch={:?}",
                        mac, packet.options.client_arch
                    );
                    return Ok(None);
                }
            }
        } else {
            None
        };

        let reply = match kind {
            MessageType::Discover => match peer.handle_discover(&request).await {
                Ok(Some(lease)) => Some(
                    self.lease_reply(packet, MessageType::Offer, &lease, boot)
                        .await?,
                ),
                Ok(None) => None,
                Err(Error::NoAddressAvailable { subnet_id }) => {
                    warn!("⚠️ 子网 {} 地址耗尽，无法应答 mac={}", subnet_id, mac);
                    None
                }
                Err(e) => return Err(e),
            },
            MessageType::Request => match peer.handle_request(&request).await? {
                Some(RequestOutcome::Ack(lease)) => {
                    Some(self.lease_reply(packet, MessageType::Ack, &lease, boot).await?)
                }
                Some(RequestOutcome::Nak(reason)) => {
                    debug!("📤 NAK: mac={}, reason={}", mac, reason);
                    Some(packet.reply(MessageType::Nak, Ipv4Addr::UNSPECIFIED, self.service.server_ip()))
                }
                None => None,
            },
            MessageType::Release => {
                peer.handle_release(mac).await?;
                None
            }
            MessageType::Decline => {
                if let Some(ip) = request.requested_ip {
                    peer.handle_decline(mac, ip).await?;
                }
                None
            }
            other => {
                debug!("忽略 {:?}: mac={}", other, mac);
                None
            }
        };

        Ok(reply.map(|reply| {
            let to = destination(packet, &reply);
            (reply, to)
        }))
    }

    fn boot_source(&self, packet: &DhcpPacket, subnet_id: Option<SubnetId>) -> BootSource {
        BootSource {
            interface: self.interface.clone(),
            subnet_id,
            client_arch: packet.options.client_arch.clone(),
        }
    }

    /// `boot` 为空时按租约所在子网重新路由
    async fn lease_reply(
        &self,
        packet: &DhcpPacket,
        kind: MessageType,
        lease: &Lease,
        boot: Option<BootInstructions>,
    ) -> Result<DhcpPacket> {
        let registry = self.service.store().registry();
        let subnet = registry.get_subnet(lease.subnet_id).await?;

        let mut reply = packet.reply(kind, lease.ip, self.service.server_ip());
        reply.options.lease_time = Some(self.service.lease_time().await);
        reply.options.subnet_mask = Some(subnet.cidr.mask());
        reply.options.routers = subnet.gateway_ip.into_iter().collect();
        reply.options.dns_servers = subnet.dns_servers.clone();

        let boot = match (boot, packet.client_mac()) {
            (Some(boot), _) => Some(boot),
            (None, Some(mac)) => {
                self.boot
                    .route_boot(mac, &self.boot_source(packet, Some(subnet.id)))
                    .await
            }
            (None, None) => None,
        };
        if let Some(boot) = boot {
            reply.siaddr = boot.next_server;
            reply.file = boot.boot_filename.clone();
            reply.options.tftp_server = Some(boot.next_server.to_string());
            reply.options.bootfile = Some(boot.boot_filename);
            if boot.http {
                reply.options.vendor_class = Some(HTTP_CLIENT_CLASS.to_string());
            }
        }

        debug!("📤 {:?}: mac={}, ip={}", kind, lease.mac_address.map(|m| m.to_string()).unwrap_or_default(), lease.ip);
        Ok(reply)
    }
}

fn destination(request: &DhcpPacket, reply: &DhcpPacket) -> SocketAddr {
    let addr = if request.is_relayed() {
        SocketAddrV4::new(request.giaddr, DHCP_SERVER_PORT)
    } else if !request.ciaddr.is_unspecified() && reply.message_type() != Some(MessageType::Nak) {
        SocketAddrV4::new(request.ciaddr, DHCP_CLIENT_PORT)
    } else {
        SocketAddrV4::new(Ipv4Addr::BROADCAST, DHCP_CLIENT_PORT)
    };
    SocketAddr::V4(addr)
}
