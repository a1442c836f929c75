/// API 错误响应

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use common::Error;
use serde::Serialize;
use tracing::error;

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

#[derive(Debug)]
pub enum ApiError {
    Domain(Error),
    Validation(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Domain(err) => match err {
                Error::NotFound(_) | Error::LeaseNotFound(_) => StatusCode::NOT_FOUND,
                Error::InvalidArgument(_)
                | Error::OverlappingRange(_)
                | Error::UnknownSetting(_)
                | Error::Serialization(_) => StatusCode::BAD_REQUEST,
                Error::AlreadyExists(_)
                | Error::VersionConflict { .. }
                | Error::IsPrimaryRack { .. }
                | Error::OperationInProgress(_) => StatusCode::CONFLICT,
                Error::PowerTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
                Error::PowerFailed(_) | Error::Network(_) => StatusCode::BAD_GATEWAY,
                Error::NoAddressAvailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    fn details(&self) -> Option<serde_json::Value> {
        match self {
            ApiError::Domain(Error::IsPrimaryRack { system_id, vlans }) => {
                Some(serde_json::json!({ "system_id": system_id, "vlans": vlans }))
            }
            ApiError::Domain(Error::VersionConflict {
                entity,
                expected,
                actual,
            }) => Some(serde_json::json!({
                "entity": entity,
                "expected": expected,
                "actual": actual,
            })),
            _ => None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let details = self.details();
        let (code, message) = match &self {
            ApiError::Domain(err) => (err.code().to_string(), err.to_string()),
            ApiError::Validation(msg) => ("VALIDATION_ERROR".to_string(), msg.clone()),
        };
        if status.is_server_error() {
            error!("请求处理失败: {}", message);
        }

        let body = Json(ErrorResponse {
            error: code,
            message,
            details,
        });
        (status, body).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError::Domain(err)
    }
}

impl From<validator::ValidationErrors> for ApiError {
    fn from(err: validator::ValidationErrors) -> Self {
        ApiError::Validation(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let conflict = ApiError::from(Error::IsPrimaryRack {
            system_id: "rack-1".to_string(),
            vlans: vec![5],
        });
        assert_eq!(conflict.status(), StatusCode::CONFLICT);
        assert!(conflict.details().is_some());

        assert_eq!(
            ApiError::from(Error::PowerTimeout("m-1".to_string())).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            ApiError::from(Error::OverlappingRange("x".to_string())).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(Error::NotFound("vlan 9".to_string())).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::Validation("bad".to_string()).into_response().status(),
            StatusCode::BAD_REQUEST
        );
    }
}
