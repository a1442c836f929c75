/// WebSocket 连接处理器
///
/// 处理与机架控制器的 WebSocket 连接：首帧必须是 register 请求，
/// 之后双向 RPC 复用同一连接。

use axum::extract::ws::{Message as AxumWsMessage, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use common::models::{
    FullLeaseSync, LeaseUpdate, LeaseUpdateAck, ReplicationState, VlanId,
};
use common::ws_rpc::{
    methods, FullSyncAck, GetBootMachineRequest, GetBootMachineResponse, HeartbeatNotification,
    PeerEnvelope, PeerPing, PeerPong, RegisterRequest, RpcRouter, WsRpcConnection,
};
use common::{Error, MessageType, Result, RpcError, RpcMessage};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::app_state::AppState;
use crate::services::ControllerService;

/// 等待注册请求的时长
const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);

/// WebSocket 升级处理器
pub async fn handle_rack_websocket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_rack_connection(socket, state))
}

/// 处理机架 WebSocket 连接
async fn handle_rack_connection(socket: WebSocket, state: AppState) {
    info!("新的机架 WebSocket 连接");
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let (system_id, hostname) = match wait_for_registration(&mut ws_sender, &mut ws_receiver, &state).await {
        Ok(identity) => identity,
        Err(e) => {
            error!("机架注册失败: {}", e);
            let _ = ws_sender.close().await;
            return;
        }
    };

    let (rpc, mut rx) = WsRpcConnection::new();
    let connection_id = state
        .rack_manager
        .register(&system_id, &hostname, rpc.clone())
        .await;
    let session = Arc::new(RackSession {
        state: state.clone(),
        system_id: system_id.clone(),
    });
    let router = session.router().await;

    // 消息发送任务
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = send_message(&mut ws_sender, &msg).await {
                error!("发送消息失败: {}", e);
                break;
            }
        }
        debug!("消息发送任务结束");
    });

    // 消息接收任务
    let recv_rpc = rpc.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(result) = ws_receiver.next().await {
            let msg = match result {
                Ok(AxumWsMessage::Close(_)) => break,
                Ok(msg) => msg,
                Err(e) => {
                    error!("接收消息错误: {}", e);
                    break;
                }
            };
            match parse_websocket_message(msg) {
                Ok(Some(rpc_msg)) => dispatch(rpc_msg, &recv_rpc, &router).await,
                Ok(None) => {}
                Err(e) => warn!("处理消息失败: {}", e),
            }
        }
        debug!("消息接收任务结束");
    });

    tokio::select! {
        _ = &mut send_task => {
            recv_task.abort();
        }
        _ = &mut recv_task => {
            send_task.abort();
        }
    }

    // 离线判定交给心跳超时，这里只移除连接
    state.rack_manager.unregister(&system_id, &connection_id).await;
    info!("机架连接已关闭: {}", system_id);
}

async fn dispatch(msg: RpcMessage, rpc: &WsRpcConnection, router: &RpcRouter) {
    debug!("收到消息: type={:?}, method={:?}, id={}", msg.message_type, msg.method, msg.id);
    match msg.message_type {
        MessageType::Response => {
            rpc.handle_response(msg).await;
        }
        MessageType::Request => {
            let rpc = rpc.clone();
            let router = router.clone();
            tokio::spawn(async move {
                let response = router.handle_request(msg).await;
                if let Err(e) = rpc.send(response) {
                    warn!("发送响应失败: {}", e);
                }
            });
        }
        MessageType::Notification => {
            let router = router.clone();
            tokio::spawn(async move { router.handle_notification(msg).await });
        }
    }
}

/// 等待并处理注册请求，返回 (system_id, hostname)
async fn wait_for_registration(
    sender: &mut SplitSink<WebSocket, AxumWsMessage>,
    receiver: &mut SplitStream<WebSocket>,
    state: &AppState,
) -> std::result::Result<(String, String), String> {
    let msg = match tokio::time::timeout(REGISTER_TIMEOUT, receiver.next()).await {
        Ok(Some(Ok(msg))) => msg,
        Ok(Some(Err(e))) => return Err(format!("接收注册消息错误: {}", e)),
        Ok(None) => return Err("连接已关闭".to_string()),
        Err(_) => return Err("等待注册消息超时".to_string()),
    };

    let rpc_msg = parse_websocket_message(msg)?.ok_or("期望收到注册请求")?;
    if rpc_msg.message_type != MessageType::Request
        || rpc_msg.method.as_deref() != Some(methods::REGISTER)
    {
        return Err(format!("期望 register 请求，收到: {:?}", rpc_msg.method));
    }

    let request: RegisterRequest = match rpc_msg.parse_payload() {
        Ok(request) => request,
        Err(e) => {
            let reply = RpcMessage::error_response(rpc_msg.id, e.clone());
            let _ = send_message(sender, &reply).await;
            return Err(format!("解析注册信息失败: {}", e));
        }
    };
    let identity = (request.system_id.clone(), request.hostname.clone());

    match ControllerService::new(state.clone()).register_rack(request).await {
        Ok(response) => {
            let payload = serde_json::to_value(&response).map_err(|e| e.to_string())?;
            send_message(sender, &RpcMessage::response(rpc_msg.id, payload)).await?;
            Ok(identity)
        }
        Err(e) => {
            let message = e.to_string();
            let reply = RpcMessage::error_response(rpc_msg.id, RpcError::from(e));
            let _ = send_message(sender, &reply).await;
            Err(message)
        }
    }
}

/// 解析 WebSocket 消息为 RPC 消息；控制帧返回 None
fn parse_websocket_message(ws_msg: AxumWsMessage) -> std::result::Result<Option<RpcMessage>, String> {
    match ws_msg {
        AxumWsMessage::Text(text) => RpcMessage::from_json(&text)
            .map(Some)
            .map_err(|e| format!("解析 JSON 失败: {}", e)),
        AxumWsMessage::Binary(data) => {
            let text = String::from_utf8(data).map_err(|e| format!("二进制转字符串失败: {}", e))?;
            RpcMessage::from_json(&text)
                .map(Some)
                .map_err(|e| format!("解析 JSON 失败: {}", e))
        }
        AxumWsMessage::Ping(_) | AxumWsMessage::Pong(_) => Ok(None),
        AxumWsMessage::Close(_) => Err("连接关闭".to_string()),
    }
}

/// 发送 RPC 消息
async fn send_message(
    sender: &mut SplitSink<WebSocket, AxumWsMessage>,
    msg: &RpcMessage,
) -> std::result::Result<(), String> {
    let json = msg.to_json().map_err(|e| format!("序列化消息失败: {}", e))?;
    sender
        .send(AxumWsMessage::Text(json))
        .await
        .map_err(|e| format!("发送 WebSocket 消息失败: {}", e))
}

// ============================================================================
// 机架发起的 RPC
// ============================================================================

/// 单个机架连接上的 RPC 处理
pub struct RackSession {
    state: AppState,
    /// 连接注册时的机架 ID
    system_id: String,
}

impl RackSession {
    pub async fn router(self: &Arc<Self>) -> RpcRouter {
        let router = RpcRouter::new();

        let session = self.clone();
        router
            .register_typed(methods::HEARTBEAT, move |req: HeartbeatNotification| {
                let session = session.clone();
                async move { session.heartbeat(req).await.map_err(RpcError::from) }
            })
            .await;

        let session = self.clone();
        router
            .register_typed(methods::RELAY_LEASE_UPDATE, move |req: PeerEnvelope<LeaseUpdate>| {
                let session = session.clone();
                async move { session.relay_lease_update(req).await.map_err(RpcError::from) }
            })
            .await;

        let session = self.clone();
        router
            .register_typed(methods::RELAY_FULL_SYNC, move |req: PeerEnvelope<FullLeaseSync>| {
                let session = session.clone();
                async move { session.relay_full_sync(req).await.map_err(RpcError::from) }
            })
            .await;

        let session = self.clone();
        router
            .register_typed(methods::RELAY_PEER_PING, move |req: PeerEnvelope<PeerPing>| {
                let session = session.clone();
                async move { session.relay_peer_ping(req).await.map_err(RpcError::from) }
            })
            .await;

        let session = self.clone();
        router
            .register_typed(methods::GET_BOOT_MACHINE, move |req: GetBootMachineRequest| {
                let session = session.clone();
                async move { Ok::<_, RpcError>(session.get_boot_machine(req).await) }
            })
            .await;

        router
    }

    async fn heartbeat(&self, notification: HeartbeatNotification) -> Result<()> {
        if notification.system_id != self.system_id {
            return Err(Error::InvalidArgument(format!(
                "心跳来自 {}，连接属于 {}",
                notification.system_id, self.system_id
            )));
        }
        ControllerService::new(self.state.clone())
            .heartbeat(notification)
            .await
    }

    /// 转发给目标机架；发送方必须是本连接的机架
    async fn relay<T, Resp>(&self, method: &str, envelope: &PeerEnvelope<T>) -> Result<Resp>
    where
        T: Serialize,
        Resp: DeserializeOwned,
    {
        if envelope.from != self.system_id {
            return Err(Error::InvalidArgument(format!(
                "中转消息来源 {} 与连接 {} 不符",
                envelope.from, self.system_id
            )));
        }
        let timeout = Duration::from_secs(self.state.membership.settings().await.max_response_delay);
        debug!("🔀 中转 {}: {} -> {}", method, envelope.from, envelope.to);
        self.state
            .rack_manager
            .call(&envelope.to, method, envelope, timeout)
            .await
    }

    async fn observe(&self, vlan_id: VlanId, replication: ReplicationState) {
        self.state.membership.mark_replication(vlan_id, replication).await;
    }

    async fn relay_lease_update(&self, envelope: PeerEnvelope<LeaseUpdate>) -> Result<LeaseUpdateAck> {
        let result = self.relay(methods::APPLY_LEASE_UPDATE, &envelope).await;
        if let Err(Error::PeerDiverged { vlan_id, .. }) = &result {
            self.observe(*vlan_id, ReplicationState::Diverged).await;
        }
        result
    }

    async fn relay_full_sync(&self, envelope: PeerEnvelope<FullLeaseSync>) -> Result<FullSyncAck> {
        let ack: FullSyncAck = self.relay(methods::APPLY_FULL_SYNC, &envelope).await?;
        self.observe(ack.vlan_id, ReplicationState::InSync).await;
        Ok(ack)
    }

    async fn relay_peer_ping(&self, envelope: PeerEnvelope<PeerPing>) -> Result<PeerPong> {
        self.relay(methods::PEER_PING, &envelope).await
    }

    async fn get_boot_machine(&self, request: GetBootMachineRequest) -> GetBootMachineResponse {
        let machine = self.state.machines.find_by_mac(&request.mac_address).await;
        if machine.is_none() {
            debug!("未登记的引导 MAC: {}", request.mac_address);
        }
        GetBootMachineResponse { machine }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::models::{Machine, MachineStatus, PowerType};

    fn session(state: &AppState, system_id: &str) -> Arc<RackSession> {
        Arc::new(RackSession {
            state: state.clone(),
            system_id: system_id.to_string(),
        })
    }

    fn full_sync(from: &str, to: &str) -> PeerEnvelope<FullLeaseSync> {
        PeerEnvelope {
            from: from.to_string(),
            to: to.to_string(),
            body: FullLeaseSync {
                vlan_id: 5,
                seq: 12,
                leases: vec![],
            },
        }
    }

    #[tokio::test]
    async fn test_relay_rejects_spoofed_sender() {
        let state = AppState::for_tests();
        let result = session(&state, "rack-1").relay_full_sync(full_sync("rack-3", "rack-2")).await;
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_relay_to_offline_rack() {
        let state = AppState::for_tests();
        let result = session(&state, "rack-1").relay_full_sync(full_sync("rack-1", "rack-2")).await;
        assert!(matches!(result, Err(Error::Network(_))));
    }

    #[tokio::test]
    async fn test_relay_full_sync_forwards_to_partner() {
        let state = AppState::for_tests();
        let (partner, mut outbound) = WsRpcConnection::new();
        state.rack_manager.register("rack-2", "r2", partner.clone()).await;

        tokio::spawn(async move {
            if let Some(msg) = outbound.recv().await {
                assert_eq!(msg.method.as_deref(), Some(methods::APPLY_FULL_SYNC));
                let envelope: PeerEnvelope<FullLeaseSync> = msg.parse_payload().unwrap();
                assert_eq!(envelope.from, "rack-1");
                let ack = FullSyncAck {
                    vlan_id: envelope.body.vlan_id,
                    merged: 0,
                    applied_seq: envelope.body.seq,
                };
                let reply = RpcMessage::response(msg.id.clone(), serde_json::to_value(ack).unwrap());
                partner.handle_response(reply).await;
            }
        });

        let ack = session(&state, "rack-1")
            .relay_full_sync(full_sync("rack-1", "rack-2"))
            .await
            .unwrap();
        assert_eq!(ack.vlan_id, 5);
        assert_eq!(ack.applied_seq, 12);
    }

    #[tokio::test]
    async fn test_get_boot_machine_by_mac() {
        let state = AppState::for_tests();
        let mac = "52:54:00:12:34:56".parse().unwrap();
        state
            .machines
            .insert(Machine {
                system_id: "m-1".to_string(),
                hostname: "node-1".to_string(),
                architecture: "amd64/generic".to_string(),
                status: MachineStatus::Deploying,
                boot_macs: vec![mac],
                power_type: PowerType::Ipmi,
                power_parameters: Default::default(),
                bmc_vlan_id: None,
            })
            .await;

        let session = session(&state, "rack-1");
        let found = session
            .get_boot_machine(GetBootMachineRequest { mac_address: mac })
            .await;
        assert_eq!(found.machine.map(|m| m.system_id), Some("m-1".to_string()));

        let missing = session
            .get_boot_machine(GetBootMachineRequest {
                mac_address: "52:54:00:00:00:01".parse().unwrap(),
            })
            .await;
        assert!(missing.machine.is_none());
    }

    #[tokio::test]
    async fn test_router_methods() {
        let state = AppState::for_tests();
        let methods = session(&state, "rack-1").router().await.list_methods().await;
        assert_eq!(
            methods,
            vec![
                "get_boot_machine",
                "heartbeat",
                "relay_full_sync",
                "relay_lease_update",
                "relay_peer_ping",
            ]
        );
    }
}
