/// 区域控制器连接池
///
/// 按区域控制器下发的 RPC 计划选择连接，计划中靠前的优先

use common::ws_rpc::WsRpcConnection;
use common::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::client::RegionClient;

pub struct RegionPool {
    clients: RwLock<Vec<Arc<RegionClient>>>,
    plan: RwLock<Vec<String>>,
    timeout: Duration,
}

impl RegionPool {
    pub fn new(timeout: Duration) -> Self {
        Self {
            clients: RwLock::new(Vec::new()),
            plan: RwLock::new(Vec::new()),
            timeout,
        }
    }

    pub async fn add(&self, client: Arc<RegionClient>) {
        self.clients.write().await.push(client);
    }

    pub async fn set_plan(&self, plan: Vec<String>) {
        let mut current = self.plan.write().await;
        if *current != plan {
            info!("🔄 更新 RPC 计划: {:?}", plan);
            *current = plan;
        }
    }

    pub async fn plan(&self) -> Vec<String> {
        self.plan.read().await.clone()
    }

    /// 计划中的区域控制器按顺序在前，其余保持配置顺序
    async fn ordered_clients(&self) -> Vec<Arc<RegionClient>> {
        let plan = self.plan.read().await.clone();
        let mut clients = self.clients.read().await.clone();
        clients.sort_by_key(|c| {
            plan.iter()
                .position(|p| c.matches(p))
                .unwrap_or(usize::MAX)
        });
        clients
    }

    /// 第一个已注册的连接
    pub async fn connection(&self) -> Result<WsRpcConnection> {
        for client in self.ordered_clients().await {
            if let Some(conn) = client.connection().await {
                debug!("使用区域控制器连接: {}", client.url());
                return Ok(conn);
            }
        }
        Err(Error::Network("没有可用的区域控制器连接".to_string()))
    }

    pub async fn call_typed<Req, Resp>(&self, method: &str, request: &Req) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let conn = self.connection().await?;
        conn.call_typed(method, request, self.timeout)
            .await
            .map_err(Error::from)
    }
}
