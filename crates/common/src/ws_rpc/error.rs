/// WebSocket RPC 错误定义

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::Error;

/// RPC 错误码
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RpcErrorCode {
    // 通用错误
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    InternalError,
    Timeout,
    ConnectionClosed,
    SerializationError,
    NotFound,

    // 控制器
    RackOffline,
    IsPrimaryRack,

    // 租约 / DHCP
    NoAddressAvailable,
    LeaseNotFound,
    PeerDiverged,

    // 电源
    OperationInProgress,
    PowerTimeout,
    PowerFailed,
}

impl RpcErrorCode {
    const ALL: [RpcErrorCode; 16] = [
        Self::InvalidRequest,
        Self::MethodNotFound,
        Self::InvalidParams,
        Self::InternalError,
        Self::Timeout,
        Self::ConnectionClosed,
        Self::SerializationError,
        Self::NotFound,
        Self::RackOffline,
        Self::IsPrimaryRack,
        Self::NoAddressAvailable,
        Self::LeaseNotFound,
        Self::PeerDiverged,
        Self::OperationInProgress,
        Self::PowerTimeout,
        Self::PowerFailed,
    ];

    /// 转换为字符串码
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::MethodNotFound => "METHOD_NOT_FOUND",
            Self::InvalidParams => "INVALID_PARAMS",
            Self::InternalError => "INTERNAL_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::ConnectionClosed => "CONNECTION_CLOSED",
            Self::SerializationError => "SERIALIZATION_ERROR",
            Self::NotFound => "NOT_FOUND",

            Self::RackOffline => "RACK_OFFLINE",
            Self::IsPrimaryRack => "IS_PRIMARY_RACK",

            Self::NoAddressAvailable => "NO_ADDRESS_AVAILABLE",
            Self::LeaseNotFound => "LEASE_NOT_FOUND",
            Self::PeerDiverged => "PEER_DIVERGED",

            Self::OperationInProgress => "OPERATION_IN_PROGRESS",
            Self::PowerTimeout => "POWER_TIMEOUT",
            Self::PowerFailed => "POWER_FAILED",
        }
    }

    /// 从字符串码解析，未知码视为内部错误
    pub fn from_code(code: &str) -> Self {
        Self::ALL
            .iter()
            .find(|c| c.as_str() == code)
            .copied()
            .unwrap_or(Self::InternalError)
    }
}

impl fmt::Display for RpcErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// RPC 错误
#[derive(Debug, Clone)]
pub struct RpcError {
    pub code: RpcErrorCode,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl RpcError {
    pub fn new(code: RpcErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(
        code: RpcErrorCode,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            details: Some(details),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::InvalidRequest, message)
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::InvalidParams, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::Timeout, message)
    }

    pub fn connection_closed() -> Self {
        Self::new(RpcErrorCode::ConnectionClosed, "连接已关闭")
    }

    pub fn serialization_error(err: impl fmt::Display) -> Self {
        Self::new(
            RpcErrorCode::SerializationError,
            format!("序列化错误: {}", err),
        )
    }

    /// 机架控制器不在线
    pub fn rack_offline(system_id: impl Into<String>) -> Self {
        Self::new(
            RpcErrorCode::RackOffline,
            format!("机架控制器离线: {}", system_id.into()),
        )
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization_error(err)
    }
}

/// 领域错误转为线上错误码，结构化字段放进 details
impl From<Error> for RpcError {
    fn from(err: Error) -> Self {
        let message = err.to_string();
        match err {
            Error::NoAddressAvailable { subnet_id } => Self::with_details(
                RpcErrorCode::NoAddressAvailable,
                message,
                serde_json::json!({ "subnet_id": subnet_id }),
            ),
            Error::LeaseNotFound(_) => Self::new(RpcErrorCode::LeaseNotFound, message),
            Error::PeerDiverged {
                vlan_id,
                expected,
                received,
            } => Self::with_details(
                RpcErrorCode::PeerDiverged,
                message,
                serde_json::json!({ "vlan_id": vlan_id, "expected": expected, "received": received }),
            ),
            Error::IsPrimaryRack { system_id, vlans } => Self::with_details(
                RpcErrorCode::IsPrimaryRack,
                message,
                serde_json::json!({ "system_id": system_id, "vlans": vlans }),
            ),
            Error::OperationInProgress(_) => Self::new(RpcErrorCode::OperationInProgress, message),
            Error::PowerTimeout(_) => Self::new(RpcErrorCode::PowerTimeout, message),
            Error::PowerFailed(_) => Self::new(RpcErrorCode::PowerFailed, message),
            Error::NotFound(_) => Self::new(RpcErrorCode::NotFound, message),
            Error::InvalidArgument(_) => Self::new(RpcErrorCode::InvalidParams, message),
            Error::Serialization(_) => Self::new(RpcErrorCode::SerializationError, message),
            _ => Self::new(RpcErrorCode::InternalError, message),
        }
    }
}

/// 线上错误码还原为领域错误
impl From<RpcError> for Error {
    fn from(err: RpcError) -> Self {
        let details = err.details.clone().unwrap_or(serde_json::Value::Null);
        let int = |key: &str| details.get(key).and_then(|v| v.as_i64()).unwrap_or_default();
        let uint = |key: &str| details.get(key).and_then(|v| v.as_u64()).unwrap_or_default();

        match err.code {
            RpcErrorCode::NoAddressAvailable => Error::NoAddressAvailable {
                subnet_id: int("subnet_id"),
            },
            RpcErrorCode::LeaseNotFound => Error::LeaseNotFound(err.message),
            RpcErrorCode::PeerDiverged => Error::PeerDiverged {
                vlan_id: int("vlan_id"),
                expected: uint("expected"),
                received: uint("received"),
            },
            RpcErrorCode::OperationInProgress => Error::OperationInProgress(err.message),
            RpcErrorCode::PowerTimeout | RpcErrorCode::Timeout => Error::PowerTimeout(err.message),
            RpcErrorCode::PowerFailed => Error::PowerFailed(err.message),
            RpcErrorCode::NotFound => Error::NotFound(err.message),
            RpcErrorCode::InvalidParams => Error::InvalidArgument(err.message),
            RpcErrorCode::RackOffline | RpcErrorCode::ConnectionClosed => {
                Error::Network(err.message)
            }
            _ => Error::Internal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_lookup() {
        assert_eq!(
            RpcErrorCode::from_code("OPERATION_IN_PROGRESS"),
            RpcErrorCode::OperationInProgress
        );
        assert_eq!(RpcErrorCode::from_code("SOMETHING_ELSE"), RpcErrorCode::InternalError);
    }

    #[test]
    fn test_peer_diverged_keeps_sequence_numbers() {
        let rpc: RpcError = Error::PeerDiverged {
            vlan_id: 10,
            expected: 5,
            received: 8,
        }
        .into();
        assert_eq!(rpc.code, RpcErrorCode::PeerDiverged);

        match Error::from(rpc) {
            Error::PeerDiverged {
                vlan_id,
                expected,
                received,
            } => assert_eq!((vlan_id, expected, received), (10, 5, 8)),
            other => panic!("unexpected error: {other}"),
        }
    }
}
