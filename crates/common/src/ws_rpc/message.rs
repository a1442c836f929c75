/// WebSocket RPC 消息定义

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::{RpcError, RpcErrorCode};

/// RPC 消息类型
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// 请求消息（期望响应）
    Request,
    Response,
    /// 通知消息（不需要响应）
    Notification,
}

/// RPC 消息帧
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcMessage {
    pub id: String,

    #[serde(rename = "type")]
    pub message_type: MessageType,

    /// RPC 方法名（request/notification 时必需）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,

    /// 错误信息（仅 response 时可能有值）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorInfo>,
}

/// 线上错误信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcErrorInfo {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl RpcMessage {
    pub fn request(method: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: format!("req-{}", Uuid::new_v4()),
            message_type: MessageType::Request,
            method: Some(method.into()),
            payload: Some(payload),
            error: None,
        }
    }

    pub fn response(id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            message_type: MessageType::Response,
            method: None,
            payload: Some(payload),
            error: None,
        }
    }

    /// 由 `RpcError` 构造错误响应
    pub fn error_response(id: impl Into<String>, err: RpcError) -> Self {
        Self {
            id: id.into(),
            message_type: MessageType::Response,
            method: None,
            payload: None,
            error: Some(RpcErrorInfo {
                code: err.code.as_str().to_string(),
                message: err.message,
                details: err.details,
            }),
        }
    }

    pub fn notification(method: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: format!("notif-{}", Uuid::new_v4()),
            message_type: MessageType::Notification,
            method: Some(method.into()),
            payload: Some(payload),
            error: None,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn is_success(&self) -> bool {
        self.message_type == MessageType::Response && self.error.is_none()
    }

    pub fn is_error(&self) -> bool {
        self.message_type == MessageType::Response && self.error.is_some()
    }

    /// 错误响应还原为 `RpcError`
    pub fn to_rpc_error(&self) -> Option<RpcError> {
        self.error.as_ref().map(|info| RpcError {
            code: RpcErrorCode::from_code(&info.code),
            message: info.message.clone(),
            details: info.details.clone(),
        })
    }

    /// 将负载解析为具体类型
    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<T, RpcError> {
        let payload = self.payload.clone().unwrap_or(serde_json::Value::Null);
        serde_json::from_value(payload).map_err(|e| RpcError::invalid_params(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_message() {
        let msg = RpcMessage::request("configure_dhcp", json!({"vlan_id": 10}));
        assert_eq!(msg.message_type, MessageType::Request);
        assert_eq!(msg.method.as_deref(), Some("configure_dhcp"));
        assert!(msg.id.starts_with("req-"));
    }

    #[test]
    fn test_error_response_round_trips_code() {
        let msg = RpcMessage::error_response(
            "req-1",
            RpcError::new(RpcErrorCode::PowerTimeout, "BMC 无响应"),
        );
        assert!(msg.is_error());

        let parsed = RpcMessage::from_json(&msg.to_json().unwrap()).unwrap();
        let err = parsed.to_rpc_error().unwrap();
        assert_eq!(err.code, RpcErrorCode::PowerTimeout);
    }

    #[test]
    fn test_parse_payload_reports_invalid_params() {
        #[derive(Debug, Deserialize)]
        struct Ping {
            #[allow(dead_code)]
            vlan_id: i64,
        }

        let bad = RpcMessage::request("peer_ping", json!({"vlan": 1}));
        let err = bad.parse_payload::<Ping>().unwrap_err();
        assert_eq!(err.code, RpcErrorCode::InvalidParams);
    }
}
