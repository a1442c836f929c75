/// Easy Metal - Region Controller
///
/// 区域控制器：保存拓扑与机器数据，协调机架控制器的 DHCP 主备与电源操作，提供管理 API

mod api;
mod app_state;
mod config;
mod db;
mod services;
mod ws;

use axum::{extract::State, routing::get, Json, Router};
use chrono::Utc;
use common::models::{ControllerNode, ControllerRole};
use common::SubnetRegistry;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

use crate::{
    app_state::AppState,
    db::{create_schema, establish_connection},
    services::{
        controller_service::{start_cluster_sync, start_liveness_monitor},
        ControllerMembership, ControllerService,
        MachineCache, MachineService, SettingsService, TopologyService,
    },
    ws::RackConnectionManager,
};

/// 区域控制器向机架发起普通 RPC 的超时
const RACK_RPC_TIMEOUT: Duration = Duration::from_secs(30);

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cfg = config::Config::from_env()?;

    // 初始化日志
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.log_level)),
        )
        .init();

    // 工作线程数 = min(CPU 数, worker_cap)
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(cfg.workers())
        .enable_all()
        .build()?;
    runtime.block_on(run(cfg))
}

async fn run(cfg: config::Config) -> anyhow::Result<()> {
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());
    let region_id = if cfg.region_id.is_empty() {
        hostname.clone()
    } else {
        cfg.region_id.clone()
    };

    info!("🚀 启动 Easy Metal Region Controller...");
    info!(
        "📌 Region ID: {}, workers={}, db_pool={}",
        region_id,
        cfg.workers(),
        cfg.db_pool_size()
    );

    // 数据库
    let sea_db = establish_connection(&cfg.database_url, cfg.db_pool_size()).await?;
    create_schema(&sea_db).await?;

    // 载入持久化状态
    let snapshot = TopologyService::load_snapshot(&sea_db).await?;
    let registry = Arc::new(SubnetRegistry::from_snapshot(snapshot)?);
    let settings = SettingsService::load(&sea_db).await?;
    let membership = Arc::new(ControllerMembership::new(registry, settings.clone()));
    membership
        .restore(ControllerService::load_all(&sea_db).await?)
        .await;
    info!("✅ 拓扑、配置与控制器已载入");

    let machines = Arc::new(MachineCache::new());
    for machine in MachineService::load_all(&sea_db).await? {
        membership
            .register_machine(&machine.system_id, machine.bmc_vlan_id)
            .await?;
        machines.insert(machine).await;
    }

    let rack_manager = RackConnectionManager::new(RACK_RPC_TIMEOUT);
    let state = AppState::new(
        sea_db,
        region_id.clone(),
        membership.clone(),
        machines,
        rack_manager,
    );

    // 同步任务需要在本节点注册前订阅，才能把自身写入数据库
    start_cluster_sync(state.clone());

    // 本节点作为区域控制器加入成员
    membership
        .register(ControllerNode {
            system_id: region_id.clone(),
            hostname: hostname.clone(),
            role: ControllerRole::Region,
            rpc_endpoint: Some(cfg.endpoint(&hostname)),
            services: Default::default(),
            vlans: Default::default(),
            last_heartbeat: Utc::now(),
            online: true,
        })
        .await?;

    start_liveness_monitor(
        state.clone(),
        Duration::from_secs(cfg.liveness_check_interval),
    );
    info!(
        "✅ 心跳监控任务已启动（超时 {:?}）",
        settings.heartbeat_timeout()
    );

    // 设置CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // 构建应用路由
    let app = Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/ws/rack", get(ws::handle_rack_websocket))
        .nest("/api", api::api_routes())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("收到退出信号，正在关闭...");
        }
        shutdown.cancel();
    });

    // 启动服务器
    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.server_port));
    info!("🎯 服务器监听在 http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;

    info!("👋 Region Controller 已退出");
    Ok(())
}

async fn root_handler() -> &'static str {
    "Easy Metal Region Controller API v1"
}

async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "region_id": state.region_id,
        "connected_racks": state.rack_manager.count().await,
    }))
}
