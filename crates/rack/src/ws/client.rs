/// WebSocket 客户端
///
/// 每个区域控制器一条连接：注册、心跳、处理区域控制器下发的请求，断开后自动重连

use common::ws_rpc::client::codec;
use common::ws_rpc::{methods, MessageType, RegisterResponse, RpcMessage, RpcRouter, WsRpcConnection};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};

use super::handler::RackHandlers;
use crate::node::RackIdentity;

/// WebSocket 客户端状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    Registered,
}

/// 到单个区域控制器的客户端
pub struct RegionClient {
    url: String,
    identity: RackIdentity,
    router: RpcRouter,
    handlers: Arc<RackHandlers>,
    state: RwLock<ClientState>,
    /// 注册成功后可用
    connection: RwLock<Option<WsRpcConnection>>,
    /// 注册应答中的区域控制器 ID
    region_id: RwLock<Option<String>>,
    reconnect_interval: Duration,
    rpc_timeout: Duration,
}

impl RegionClient {
    pub fn new(
        url: impl Into<String>,
        identity: RackIdentity,
        router: RpcRouter,
        handlers: Arc<RackHandlers>,
        reconnect_interval: Duration,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            url: url.into(),
            identity,
            router,
            handlers,
            state: RwLock::new(ClientState::Disconnected),
            connection: RwLock::new(None),
            region_id: RwLock::new(None),
            reconnect_interval,
            rpc_timeout,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// RPC 计划中的条目可以是区域控制器 ID 或 URL
    pub fn matches(&self, entry: &str) -> bool {
        if entry == self.url {
            return true;
        }
        self.region_id
            .try_read()
            .map(|id| id.as_deref() == Some(entry))
            .unwrap_or(false)
    }

    pub async fn state(&self) -> ClientState {
        *self.state.read().await
    }

    pub async fn connection(&self) -> Option<WsRpcConnection> {
        self.connection
            .read()
            .await
            .clone()
            .filter(|conn| !conn.is_closed())
    }

    async fn set_state(&self, state: ClientState) {
        *self.state.write().await = state;
    }

    /// 启动客户端（连接并保持）
    pub async fn run(self: Arc<Self>) {
        loop {
            info!("尝试连接到区域控制器: {}", self.url);

            match self.connect_and_run().await {
                Ok(()) => info!("连接正常关闭: {}", self.url),
                Err(e) => error!("连接错误: url={}, error={}", self.url, e),
            }

            if let Some(conn) = self.connection.write().await.take() {
                conn.clear_pending().await;
            }
            self.set_state(ClientState::Disconnected).await;

            warn!("{:?} 后重新连接 {}", self.reconnect_interval, self.url);
            tokio::time::sleep(self.reconnect_interval).await;
        }
    }

    async fn connect_and_run(&self) -> anyhow::Result<()> {
        self.set_state(ClientState::Connecting).await;

        let (ws_stream, _) = connect_async(&self.url).await?;
        info!("✅ WebSocket 连接成功: {}", self.url);
        self.set_state(ClientState::Connected).await;

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (conn, mut outbound) = WsRpcConnection::new();

        // 发送任务
        let send_task = tokio::spawn(async move {
            while let Some(msg) = outbound.recv().await {
                let frame = match codec::encode(&msg) {
                    Ok(frame) => frame,
                    Err(e) => {
                        error!("序列化消息失败: {}", e);
                        continue;
                    }
                };
                if let Err(e) = ws_sender.send(frame).await {
                    error!("发送消息失败: {}", e);
                    break;
                }
            }
            debug!("发送任务结束");
        });

        // 接收任务：响应交给连接，请求与通知交给路由器
        let recv_conn = conn.clone();
        let router = self.router.clone();
        let recv_task = tokio::spawn(async move {
            while let Some(frame) = ws_receiver.next().await {
                let msg = match frame.map_err(|e| e.to_string()).and_then(|f| {
                    codec::decode(f).map_err(|e| e.to_string())
                }) {
                    Ok(Some(msg)) => msg,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!("连接读取结束: {}", e);
                        break;
                    }
                };
                Self::dispatch(msg, &recv_conn, &router).await;
            }
            debug!("接收任务结束");
        });

        // 发送注册请求
        let request = self.identity.register_request();
        let registered: Result<RegisterResponse, _> = conn
            .call_typed(methods::REGISTER, &request, self.rpc_timeout)
            .await;
        let response = match registered {
            Ok(response) if response.accepted => response,
            Ok(_) => {
                send_task.abort();
                recv_task.abort();
                anyhow::bail!("区域控制器拒绝注册");
            }
            Err(e) => {
                send_task.abort();
                recv_task.abort();
                anyhow::bail!("注册失败: {}", e);
            }
        };

        info!(
            "✅ 注册成功: region={}, system_id={}, vlans={}",
            response.region_id,
            self.identity.system_id(),
            response.dhcp.len()
        );
        *self.region_id.write().await = Some(response.region_id.clone());
        let heartbeat_interval = Duration::from_secs(response.heartbeat_interval.max(1));
        self.handlers.apply_registration(response).await;

        *self.connection.write().await = Some(conn.clone());
        self.set_state(ClientState::Registered).await;

        // 心跳任务
        let heartbeat_conn = conn.clone();
        let identity = self.identity.clone();
        let heartbeat_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(heartbeat_interval);
            loop {
                interval.tick().await;
                let payload = match serde_json::to_value(identity.heartbeat()) {
                    Ok(payload) => payload,
                    Err(e) => {
                        error!("序列化心跳失败: {}", e);
                        continue;
                    }
                };
                if heartbeat_conn.notify(methods::HEARTBEAT, payload).is_err() {
                    break;
                }
                debug!("发送心跳");
            }
        });

        // 等待任一任务完成
        tokio::select! {
            _ = send_task => debug!("发送任务已结束"),
            _ = recv_task => debug!("接收任务已结束"),
        }

        heartbeat_task.abort();
        Ok(())
    }

    async fn dispatch(msg: RpcMessage, conn: &WsRpcConnection, router: &RpcRouter) {
        match msg.message_type {
            MessageType::Response => {
                conn.handle_response(msg).await;
            }
            MessageType::Request => {
                // 每个请求独立处理，电源操作可能持续数十秒
                let conn = conn.clone();
                let router = router.clone();
                tokio::spawn(async move {
                    let response = router.handle_request(msg).await;
                    if let Err(e) = conn.send(response) {
                        error!("发送响应失败: {}", e);
                    }
                });
            }
            MessageType::Notification => {
                let router = router.clone();
                tokio::spawn(async move { router.handle_notification(msg).await });
            }
        }
    }
}
