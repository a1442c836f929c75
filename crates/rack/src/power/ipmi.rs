/// IPMI 电源驱动
///
/// 通过 FreeIPMI 的 `ipmipower` 命令控制 BMC（UDP 623）

use async_trait::async_trait;
use common::models::{PowerParameters, PowerState, PowerType};
use tokio::process::Command;
use tracing::debug;

use super::driver::{
    required, run_command, DriverError, DriverResult, PowerDriver, COMMAND_TIMEOUT,
};

const DEFAULT_IPMI_DRIVER: &str = "LAN_2_0";

/// IPMI 驱动
pub struct IpmiDriver {
    binary: String,
}

impl IpmiDriver {
    pub fn new() -> Self {
        Self {
            binary: "ipmipower".to_string(),
        }
    }

    async fn run(&self, params: &PowerParameters, op: &str) -> DriverResult<String> {
        let address = required(params, "power_address")?;
        let user = params.get("power_user").map(String::as_str).unwrap_or("");
        let pass = params.get("power_pass").map(String::as_str).unwrap_or("");
        let driver = params
            .get("power_driver")
            .map(String::as_str)
            .unwrap_or(DEFAULT_IPMI_DRIVER);

        debug!("执行 ipmipower: host={}, op={}", address, op);

        let mut command = Command::new(&self.binary);
        command
            .arg("-h")
            .arg(address)
            .arg("-u")
            .arg(user)
            .arg("-p")
            .arg(pass)
            .arg("-D")
            .arg(driver)
            .arg(op);
        let output = run_command(command, COMMAND_TIMEOUT).await?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        let combined = format!("{}{}", stdout, stderr);

        classify_failure(&combined)?;
        if !output.status.success() {
            return Err(DriverError::Fatal(format!(
                "ipmipower 退出码 {:?}: {}",
                output.status.code(),
                combined.trim()
            )));
        }
        Ok(stdout)
    }
}

impl Default for IpmiDriver {
    fn default() -> Self {
        Self::new()
    }
}

/// ipmipower 在输出中报告错误，退出码不一定非零
fn classify_failure(output: &str) -> DriverResult<()> {
    let lower = output.to_lowercase();
    if lower.contains("connection timeout") || lower.contains("bmc busy") {
        return Err(DriverError::Transient(output.trim().to_string()));
    }
    for fatal in [
        "password invalid",
        "username invalid",
        "privilege level insufficient",
        "invalid hostname",
        "ipmi 2.0 unavailable",
    ] {
        if lower.contains(fatal) {
            return Err(DriverError::Fatal(output.trim().to_string()));
        }
    }
    Ok(())
}

/// `host: on` / `host: off`
fn parse_state(output: &str) -> DriverResult<PowerState> {
    let state = output
        .lines()
        .filter_map(|line| line.rsplit_once(':').map(|(_, s)| s.trim().to_lowercase()))
        .find(|s| !s.is_empty());

    match state.as_deref() {
        Some("on") => Ok(PowerState::On),
        Some("off") => Ok(PowerState::Off),
        _ => Err(DriverError::Fatal(format!(
            "无法解析 ipmipower 输出: {}",
            output.trim()
        ))),
    }
}

#[async_trait]
impl PowerDriver for IpmiDriver {
    async fn power_on(&self, params: &PowerParameters) -> DriverResult<()> {
        self.run(params, "--on").await.map(|_| ())
    }

    async fn power_off(&self, params: &PowerParameters) -> DriverResult<()> {
        self.run(params, "--off").await.map(|_| ())
    }

    async fn query_state(&self, params: &PowerParameters) -> DriverResult<PowerState> {
        let output = self.run(params, "--stat").await?;
        parse_state(&output)
    }

    fn power_type(&self) -> PowerType {
        PowerType::Ipmi
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stat_output() {
        assert_eq!(parse_state("10.0.1.5: on\n").unwrap(), PowerState::On);
        assert_eq!(parse_state("10.0.1.5: off\n").unwrap(), PowerState::Off);
        assert!(parse_state("garbage").is_err());
    }

    #[test]
    fn test_classify_failures() {
        assert!(classify_failure("10.0.1.5: ok").is_ok());
        assert!(matches!(
            classify_failure("10.0.1.5: connection timeout"),
            Err(DriverError::Transient(_))
        ));
        assert!(matches!(
            classify_failure("10.0.1.5: password invalid"),
            Err(DriverError::Fatal(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_address_is_fatal() {
        let driver = IpmiDriver::new();
        let err = driver.query_state(&PowerParameters::new()).await.unwrap_err();
        assert!(matches!(err, DriverError::Fatal(_)));
    }
}
