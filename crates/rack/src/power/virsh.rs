/// virsh 电源驱动
///
/// 通过 virsh CLI 控制 libvirt 虚拟机，`power_address` 为连接 URI

use async_trait::async_trait;
use common::models::{PowerParameters, PowerState, PowerType};
use tokio::process::Command;
use tracing::debug;

use super::driver::{
    required, run_command, DriverError, DriverResult, PowerDriver, COMMAND_TIMEOUT,
};

pub struct VirshDriver;

impl VirshDriver {
    pub fn new() -> Self {
        Self
    }

    async fn run(&self, params: &PowerParameters, op: &str) -> DriverResult<String> {
        let uri = required(params, "power_address")?;
        let domain = required(params, "power_id")?;
        debug!("执行 virsh: uri={}, op={}, domain={}", uri, op, domain);

        let mut command = Command::new("virsh");
        command.arg("-c").arg(uri).arg(op).arg(domain);
        let output = run_command(command, COMMAND_TIMEOUT).await?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if output.status.success() {
            return Ok(stdout);
        }

        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        Err(classify_error(&stderr))
    }
}

impl Default for VirshDriver {
    fn default() -> Self {
        Self::new()
    }
}

fn classify_error(stderr: &str) -> DriverError {
    let lower = stderr.to_lowercase();
    if lower.contains("failed to connect") || lower.contains("unable to connect") {
        DriverError::Transient(stderr.trim().to_string())
    } else {
        DriverError::Fatal(stderr.trim().to_string())
    }
}

fn is_already(stderr: &DriverError, marker: &str) -> bool {
    matches!(stderr, DriverError::Fatal(msg) if msg.to_lowercase().contains(marker))
}

fn parse_domstate(output: &str) -> PowerState {
    match output.trim() {
        "running" | "paused" | "in shutdown" | "pmsuspended" => PowerState::On,
        "shut off" | "crashed" => PowerState::Off,
        _ => PowerState::Unknown,
    }
}

#[async_trait]
impl PowerDriver for VirshDriver {
    async fn power_on(&self, params: &PowerParameters) -> DriverResult<()> {
        match self.run(params, "start").await {
            Ok(_) => Ok(()),
            Err(e) if is_already(&e, "already active") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn power_off(&self, params: &PowerParameters) -> DriverResult<()> {
        match self.run(params, "destroy").await {
            Ok(_) => Ok(()),
            Err(e) if is_already(&e, "not running") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn query_state(&self, params: &PowerParameters) -> DriverResult<PowerState> {
        let output = self.run(params, "domstate").await?;
        Ok(parse_domstate(&output))
    }

    fn power_type(&self) -> PowerType {
        PowerType::Virsh
    }
}
