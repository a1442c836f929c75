/// RPC 连接：请求/响应配对
///
/// 区域控制器与机架控制器两端都用它向对端发起请求。

use super::{MessageType, RpcError, RpcErrorCode, RpcMessage};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, warn};

type ResponseWaiter = oneshot::Sender<Result<RpcMessage, RpcError>>;

/// RPC 连接句柄，可廉价克隆
#[derive(Clone)]
pub struct WsRpcConnection {
    /// request_id -> 响应等待器
    pending_requests: Arc<RwLock<HashMap<String, ResponseWaiter>>>,
    sender: mpsc::UnboundedSender<RpcMessage>,
}

impl WsRpcConnection {
    /// 创建连接，返回的接收端由发送任务写入 WebSocket
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RpcMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = Self {
            pending_requests: Arc::new(RwLock::new(HashMap::new())),
            sender: tx,
        };
        (connection, rx)
    }

    /// 发送请求并等待响应
    pub async fn call(
        &self,
        method: impl Into<String>,
        payload: serde_json::Value,
        timeout: Duration,
    ) -> Result<RpcMessage, RpcError> {
        let msg = RpcMessage::request(method, payload);
        let request_id = msg.id.clone();

        let (tx, rx) = oneshot::channel();
        self.pending_requests
            .write()
            .await
            .insert(request_id.clone(), tx);

        if self.sender.send(msg).is_err() {
            self.pending_requests.write().await.remove(&request_id);
            return Err(RpcError::connection_closed());
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RpcError::connection_closed()),
            Err(_) => {
                self.pending_requests.write().await.remove(&request_id);
                Err(RpcError::timeout(format!("请求超时: {}", request_id)))
            }
        }
    }

    /// 带类型的请求
    pub async fn call_typed<Req, Resp>(
        &self,
        method: &str,
        request: &Req,
        timeout: Duration,
    ) -> Result<Resp, RpcError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let payload = serde_json::to_value(request)?;
        let response = self.call(method, payload, timeout).await?;
        response.parse_payload()
    }

    /// 发送通知（不等待响应）
    pub fn notify(&self, method: impl Into<String>, payload: serde_json::Value) -> Result<(), RpcError> {
        self.send(RpcMessage::notification(method, payload))
    }

    /// 直接发送一帧（响应等）
    pub fn send(&self, msg: RpcMessage) -> Result<(), RpcError> {
        self.sender
            .send(msg)
            .map_err(|_| RpcError::connection_closed())
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// 处理响应帧；返回 false 表示不是响应，需要交给路由器
    pub async fn handle_response(&self, msg: RpcMessage) -> bool {
        if msg.message_type != MessageType::Response {
            return false;
        }

        let waiter = self.pending_requests.write().await.remove(&msg.id);
        match waiter {
            Some(waiter) => {
                let result = match msg.to_rpc_error() {
                    Some(err) => Err(err),
                    None => Ok(msg),
                };
                let _ = waiter.send(result);
            }
            None => warn!("收到未预期的响应消息: {}", msg.id),
        }
        true
    }

    pub async fn pending_count(&self) -> usize {
        self.pending_requests.read().await.len()
    }

    /// 连接断开时唤醒所有等待者
    pub async fn clear_pending(&self) {
        let mut pending = self.pending_requests.write().await;
        for (id, waiter) in pending.drain() {
            debug!("清理待处理请求: {}", id);
            let _ = waiter.send(Err(RpcError::connection_closed()));
        }
    }
}

/// 帧编解码
pub mod codec {
    use super::*;

    pub fn encode(msg: &RpcMessage) -> Result<WsMessage, RpcError> {
        Ok(WsMessage::Text(msg.to_json()?))
    }

    /// Ping/Pong 等控制帧返回 `Ok(None)`
    pub fn decode(ws_msg: WsMessage) -> Result<Option<RpcMessage>, RpcError> {
        match ws_msg {
            WsMessage::Text(text) => Ok(Some(RpcMessage::from_json(&text)?)),
            WsMessage::Binary(data) => {
                let text = String::from_utf8(data).map_err(RpcError::serialization_error)?;
                Ok(Some(RpcMessage::from_json(&text)?))
            }
            WsMessage::Close(_) => Err(RpcError::connection_closed()),
            WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_call_resolves_on_response() {
        let (conn, mut rx) = WsRpcConnection::new();
        let peer = conn.clone();

        tokio::spawn(async move {
            let req = rx.recv().await.unwrap();
            peer.handle_response(RpcMessage::response(req.id, json!({"ok": true})))
                .await;
        });

        let resp = conn
            .call("peer_ping", json!({}), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(resp.payload.unwrap()["ok"], true);
        assert_eq!(conn.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_call_preserves_error_code() {
        let (conn, mut rx) = WsRpcConnection::new();
        let peer = conn.clone();

        tokio::spawn(async move {
            let req = rx.recv().await.unwrap();
            let err = RpcError::new(RpcErrorCode::OperationInProgress, "busy");
            peer.handle_response(RpcMessage::error_response(req.id, err)).await;
        });

        let err = conn
            .call("power_action", json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.code, RpcErrorCode::OperationInProgress);
    }

    #[tokio::test]
    async fn test_call_times_out_and_cleans_up() {
        let (conn, _rx) = WsRpcConnection::new();
        let err = conn
            .call("peer_ping", json!({}), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err.code, RpcErrorCode::Timeout);
        assert_eq!(conn.pending_count().await, 0);
    }
}
