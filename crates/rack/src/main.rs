/// Easy Metal - Rack Controller
///
/// 机架控制器，运行在每个机架上，负责 DHCP、网络引导与 BMC 电源操作

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

mod boot;
mod config;
mod dhcp;
mod lease;
mod node;
mod power;
mod ws;

use boot::BootRouter;
use common::SubnetRegistry;
use dhcp::{DhcpServer, DhcpService};
use lease::{LeaseCheckpoint, LeaseStore};
use node::RackIdentity;
use power::PowerManager;
use ws::{RackHandlers, RegionClient, RegionMachineDirectory, RegionPool, RegionRelay};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    // 可以通过环境变量 RUST_LOG 设置日志级别，例如：
    // RUST_LOG=rack=debug cargo run --bin rack
    dotenvy::dotenv().ok();
    let cfg = config::Config::from_env()?;

    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.log_level)),
        )
        .init();

    info!("🚀 启动 Easy Metal Rack Controller...");
    info!("📌 System ID: {}", cfg.system_id);

    let hostname = cfg.hostname.clone().unwrap_or_else(node::local_hostname);
    let identity = RackIdentity::new(
        cfg.system_id.clone(),
        hostname,
        cfg.role,
        cfg.vlans.iter().copied(),
    );

    // 拓扑与租约
    let registry = Arc::new(SubnetRegistry::new());
    let store = Arc::new(LeaseStore::new(
        registry.clone(),
        Some(LeaseCheckpoint::new(cfg.lease_checkpoint.clone())),
    ));
    match store.restore().await {
        Ok(count) => info!("💾 从检查点恢复 {} 条租约", count),
        Err(e) => error!("恢复租约检查点失败: {}", e),
    }

    // 区域控制器连接池与对端中转
    let pool = Arc::new(RegionPool::new(Duration::from_secs(cfg.rpc_timeout)));
    let relay = Arc::new(RegionRelay::new(cfg.system_id.clone(), pool.clone()));

    info!("🌐 初始化 DHCP 服务...");
    let dhcp = Arc::new(DhcpService::new(
        cfg.system_id.clone(),
        cfg.server_ip,
        store.clone(),
        relay,
    ));

    info!("⚡ 初始化电源管理器...");
    let power = Arc::new(PowerManager::new()?);

    let boot = Arc::new(BootRouter::new(
        cfg.server_ip,
        cfg.http_boot_port,
        registry.clone(),
        Arc::new(RegionMachineDirectory::new(pool.clone())),
    ));

    let handlers = Arc::new(RackHandlers::new(
        cfg.system_id.clone(),
        registry,
        dhcp.clone(),
        power,
        pool.clone(),
    ));
    let router = handlers.router().await;
    info!("✅ RPC 处理器已初始化");

    // 每个区域控制器一条连接（自动重连）
    for url in &cfg.region_urls {
        let client = Arc::new(RegionClient::new(
            url.clone(),
            identity.clone(),
            router.clone(),
            handlers.clone(),
            Duration::from_secs(cfg.reconnect_interval),
            Duration::from_secs(cfg.rpc_timeout),
        ));
        pool.add(client.clone()).await;
        info!("🎯 连接到区域控制器: {}", url);
        tokio::spawn(client.run());
    }

    let cancel = CancellationToken::new();

    tokio::spawn(dhcp.clone().run_maintenance(
        Duration::from_secs(cfg.maintenance_interval),
        cancel.clone(),
    ));

    let server = Arc::new(DhcpServer::new(
        dhcp,
        boot,
        cfg.local_vlan,
        cfg.dhcp_interface.clone(),
    ));
    let dhcp_task = tokio::spawn(server.run(cfg.dhcp_listen, cancel.clone()));

    tokio::signal::ctrl_c().await?;
    info!("🛑 收到退出信号，正在停止...");
    cancel.cancel();

    match dhcp_task.await {
        Ok(Err(e)) => error!("DHCP 服务异常退出: {}", e),
        Err(e) => error!("DHCP 任务异常: {}", e),
        Ok(Ok(())) => {}
    }

    info!("👋 Rack Controller 已停止");
    Ok(())
}
