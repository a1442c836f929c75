/// Redfish 电源驱动
///
/// HTTPS REST：`/redfish/v1/Systems/{id}` 与 `ComputerSystem.Reset`

use async_trait::async_trait;
use common::models::{PowerParameters, PowerState, PowerType};
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use super::driver::{required, DriverError, DriverResult, PowerDriver};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

pub struct RedfishDriver {
    client: Client,
}

impl RedfishDriver {
    pub fn new() -> DriverResult<Self> {
        // BMC 通常使用自签名证书
        let client = Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| DriverError::Fatal(format!("创建 HTTP 客户端失败: {}", e)))?;
        Ok(Self { client })
    }

    fn base_url(params: &PowerParameters) -> DriverResult<String> {
        let address = required(params, "power_address")?;
        if address.starts_with("http://") || address.starts_with("https://") {
            Ok(address.trim_end_matches('/').to_string())
        } else {
            Ok(format!("https://{}", address))
        }
    }

    fn credentials(params: &PowerParameters) -> DriverResult<(&str, &str)> {
        Ok((required(params, "power_user")?, required(params, "power_pass")?))
    }

    /// 未指定 node_id 时取 Systems 集合的第一个成员
    async fn system_url(&self, params: &PowerParameters) -> DriverResult<String> {
        let base = Self::base_url(params)?;
        if let Some(node_id) = params.get("node_id").filter(|v| !v.is_empty()) {
            return Ok(format!("{}/redfish/v1/Systems/{}", base, node_id));
        }

        let collection = self
            .get_json(params, &format!("{}/redfish/v1/Systems", base))
            .await?;
        let member = first_member(&collection)?;
        Ok(format!("{}{}", base, member))
    }

    async fn get_json(&self, params: &PowerParameters, url: &str) -> DriverResult<Value> {
        let (user, pass) = Self::credentials(params)?;
        let response = self
            .client
            .get(url)
            .basic_auth(user, Some(pass))
            .send()
            .await
            .map_err(map_transport_error)?;
        check_status(response.status(), url)?;
        response
            .json::<Value>()
            .await
            .map_err(|e| DriverError::Fatal(format!("无效的 Redfish 响应: {}", e)))
    }

    async fn reset(&self, params: &PowerParameters, reset_type: &str) -> DriverResult<()> {
        let (user, pass) = Self::credentials(params)?;
        let url = format!(
            "{}/Actions/ComputerSystem.Reset",
            self.system_url(params).await?
        );
        debug!("Redfish reset: url={}, type={}", url, reset_type);

        let response = self
            .client
            .post(&url)
            .basic_auth(user, Some(pass))
            .json(&json!({ "ResetType": reset_type }))
            .send()
            .await
            .map_err(map_transport_error)?;
        check_status(response.status(), &url)
    }
}

fn map_transport_error(e: reqwest::Error) -> DriverError {
    if e.is_timeout() || e.is_connect() {
        DriverError::Transient(e.to_string())
    } else {
        DriverError::Fatal(e.to_string())
    }
}

fn check_status(status: StatusCode, url: &str) -> DriverResult<()> {
    if status.is_success() {
        Ok(())
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        Err(DriverError::Fatal(format!("BMC 认证失败: {} {}", status, url)))
    } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Err(DriverError::Transient(format!("BMC 返回 {}: {}", status, url)))
    } else {
        Err(DriverError::Fatal(format!("BMC 返回 {}: {}", status, url)))
    }
}

fn first_member(collection: &Value) -> DriverResult<String> {
    collection["Members"]
        .as_array()
        .and_then(|members| members.first())
        .and_then(|m| m["@odata.id"].as_str())
        .map(str::to_string)
        .ok_or_else(|| DriverError::Fatal("Redfish Systems 集合为空".to_string()))
}

fn parse_power_state(system: &Value) -> PowerState {
    match system["PowerState"].as_str() {
        Some("On") | Some("PoweringOff") => PowerState::On,
        Some("Off") | Some("PoweringOn") => PowerState::Off,
        _ => PowerState::Unknown,
    }
}

#[async_trait]
impl PowerDriver for RedfishDriver {
    async fn power_on(&self, params: &PowerParameters) -> DriverResult<()> {
        self.reset(params, "On").await
    }

    async fn power_off(&self, params: &PowerParameters) -> DriverResult<()> {
        self.reset(params, "ForceOff").await
    }

    async fn power_cycle(&self, params: &PowerParameters) -> DriverResult<()> {
        self.reset(params, "ForceRestart").await
    }

    async fn query_state(&self, params: &PowerParameters) -> DriverResult<PowerState> {
        let url = self.system_url(params).await?;
        let system = self.get_json(params, &url).await?;
        Ok(parse_power_state(&system))
    }

    fn power_type(&self) -> PowerType {
        PowerType::Redfish
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_system_resource() {
        assert_eq!(parse_power_state(&json!({"PowerState": "On"})), PowerState::On);
        assert_eq!(parse_power_state(&json!({"PowerState": "Off"})), PowerState::Off);
        assert_eq!(parse_power_state(&json!({})), PowerState::Unknown);
    }

    #[test]
    fn test_first_member() {
        let collection = json!({
            "Members": [{"@odata.id": "/redfish/v1/Systems/1"}]
        });
        assert_eq!(first_member(&collection).unwrap(), "/redfish/v1/Systems/1");
        assert!(first_member(&json!({"Members": []})).is_err());
    }

    #[test]
    fn test_status_classification() {
        assert!(check_status(StatusCode::NO_CONTENT, "u").is_ok());
        assert!(matches!(
            check_status(StatusCode::UNAUTHORIZED, "u"),
            Err(DriverError::Fatal(_))
        ));
        assert!(matches!(
            check_status(StatusCode::SERVICE_UNAVAILABLE, "u"),
            Err(DriverError::Transient(_))
        ));
    }

    #[test]
    fn test_base_url() {
        let mut params = PowerParameters::new();
        params.insert("power_address".into(), "10.0.1.7".into());
        assert_eq!(RedfishDriver::base_url(&params).unwrap(), "https://10.0.1.7");
        params.insert("power_address".into(), "http://bmc.local:8000/".into());
        assert_eq!(RedfishDriver::base_url(&params).unwrap(), "http://bmc.local:8000");
    }
}
