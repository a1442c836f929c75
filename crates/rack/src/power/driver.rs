/// 电源驱动抽象层
///
/// 每种 `power_type` 一个实现，由 PowerManager 分发

use async_trait::async_trait;
use common::models::{PowerParameters, PowerState, PowerType};
use std::process::Output;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

/// 单条外部命令的执行上限，需低于区域控制器的电源超时
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(20);

/// 驱动错误
///
/// Transient 会按退避计划重试，Fatal 直接返回。
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("BMC 暂时不可达: {0}")]
    Transient(String),

    #[error("{0}")]
    Fatal(String),
}

pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// 电源驱动 Trait
#[async_trait]
pub trait PowerDriver: Send + Sync + 'static {
    async fn power_on(&self, params: &PowerParameters) -> DriverResult<()>;

    async fn power_off(&self, params: &PowerParameters) -> DriverResult<()>;

    /// 没有原生重启的驱动：先关再开
    async fn power_cycle(&self, params: &PowerParameters) -> DriverResult<()> {
        self.power_off(params).await?;
        self.power_on(params).await
    }

    async fn query_state(&self, params: &PowerParameters) -> DriverResult<PowerState>;

    fn power_type(&self) -> PowerType;
}

/// 读取必填参数
pub fn required<'a>(params: &'a PowerParameters, key: &str) -> DriverResult<&'a str> {
    params
        .get(key)
        .map(String::as_str)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| DriverError::Fatal(format!("缺少电源参数: {}", key)))
}

/// 执行外部命令；超时后子进程随 future 一起被杀掉
pub async fn run_command(mut command: Command, limit: Duration) -> DriverResult<Output> {
    command.kill_on_drop(true);
    let program = command.as_std().get_program().to_string_lossy().into_owned();

    match tokio::time::timeout(limit, command.output()).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) => Err(DriverError::Fatal(format!("无法执行 {}: {}", program, e))),
        Err(_) => Err(DriverError::Transient(format!(
            "{} 在 {:?} 内没有返回",
            program, limit
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_parameter() {
        let mut params = PowerParameters::new();
        params.insert("power_address".into(), "10.0.1.5".into());
        params.insert("power_user".into(), "".into());

        assert_eq!(required(&params, "power_address").unwrap(), "10.0.1.5");
        assert!(matches!(required(&params, "power_user"), Err(DriverError::Fatal(_))));
        assert!(matches!(required(&params, "power_pass"), Err(DriverError::Fatal(_))));
    }

    #[tokio::test]
    async fn test_hung_command_is_killed_as_transient() {
        let mut command = Command::new("sleep");
        command.arg("30");
        let started = std::time::Instant::now();
        let err = run_command(command, Duration::from_millis(100)).await.unwrap_err();

        assert!(matches!(err, DriverError::Transient(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_missing_binary_is_fatal() {
        let command = Command::new("/nonexistent/ipmipower");
        let err = run_command(command, COMMAND_TIMEOUT).await.unwrap_err();
        assert!(matches!(err, DriverError::Fatal(_)));
    }
}
