/// RPC 方法路由器
///
/// 两端收到的 request / notification 都交给路由器分发。

use super::{RpcError, RpcMessage};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

type BoxFuture = Pin<Box<dyn Future<Output = Result<serde_json::Value, RpcError>> + Send>>;

/// 异步 RPC 方法处理器
pub type RpcHandler = Arc<dyn Fn(serde_json::Value) -> BoxFuture + Send + Sync>;

/// RPC 方法路由器
#[derive(Clone, Default)]
pub struct RpcRouter {
    handlers: Arc<RwLock<HashMap<String, RpcHandler>>>,
}

impl RpcRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册原始 JSON 处理器
    pub async fn register<F, Fut>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, RpcError>> + Send + 'static,
    {
        let handler: RpcHandler = Arc::new(move |payload| Box::pin(handler(payload)) as BoxFuture);
        self.handlers.write().await.insert(method.into(), handler);
    }

    /// 注册带类型的处理器，负载解析失败返回 INVALID_PARAMS
    pub async fn register_typed<Req, Resp, F, Fut>(&self, method: impl Into<String>, handler: F)
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, RpcError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.register(method, move |payload| {
            let handler = handler.clone();
            async move {
                let request: Req = serde_json::from_value(payload)
                    .map_err(|e| RpcError::invalid_params(e.to_string()))?;
                let response = handler(request).await?;
                Ok(serde_json::to_value(response)?)
            }
        })
        .await;
    }

    /// 处理请求，总是返回一帧响应
    pub async fn handle_request(&self, msg: RpcMessage) -> RpcMessage {
        let Some(method) = msg.method.clone() else {
            return RpcMessage::error_response(msg.id, RpcError::invalid_request("缺少方法名"));
        };

        info!("📨 [收到RPC请求] method={}, id={}", method, msg.id);

        match self.dispatch(&method, msg.payload.unwrap_or_default()).await {
            Ok(result) => {
                debug!("✅ [RPC处理成功] method={}, id={}", method, msg.id);
                RpcMessage::response(msg.id, result)
            }
            Err(err) => {
                warn!(
                    "❌ [RPC处理失败] method={}, id={}, code={}, error={}",
                    method,
                    msg.id,
                    err.code.as_str(),
                    err.message
                );
                RpcMessage::error_response(msg.id, err)
            }
        }
    }

    /// 处理通知，结果只记日志
    pub async fn handle_notification(&self, msg: RpcMessage) {
        let Some(method) = msg.method.clone() else {
            warn!("通知缺少方法名: {}", msg.id);
            return;
        };

        if let Err(err) = self.dispatch(&method, msg.payload.unwrap_or_default()).await {
            warn!("❌ [通知处理失败] method={}, error={}", method, err);
        }
    }

    async fn dispatch(
        &self,
        method: &str,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, RpcError> {
        let handler = self.handlers.read().await.get(method).cloned();
        match handler {
            Some(handler) => handler(payload).await,
            None => Err(RpcError::new(
                super::RpcErrorCode::MethodNotFound,
                format!("方法不存在: {}", method),
            )),
        }
    }

    pub async fn list_methods(&self) -> Vec<String> {
        let mut methods: Vec<String> = self.handlers.read().await.keys().cloned().collect();
        methods.sort();
        methods
    }
}
