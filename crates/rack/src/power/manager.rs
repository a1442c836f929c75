/// 电源管理器
///
/// 按 power_type 分发到驱动；执行动作后查询确认状态。
/// 暂时性错误按退避计划重试，用尽后返回 PowerTimeout。
/// 同一台机器同时只执行一个变更动作。

use common::models::{PowerAction, PowerParameters, PowerState, PowerType};
use common::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::driver::{DriverError, DriverResult, PowerDriver};
use super::ipmi::IpmiDriver;
use super::manual::ManualDriver;
use super::redfish::RedfishDriver;
use super::virsh::VirshDriver;

/// 默认退避：1s, 2s, 4s
pub const DEFAULT_BACKOFF: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
];

pub struct PowerManager {
    drivers: HashMap<PowerType, Arc<dyn PowerDriver>>,
    backoff: Vec<Duration>,
    /// 正在执行变更动作的机器
    busy: Mutex<HashSet<String>>,
}

/// 释放时移出 busy 集合，调用方被取消时同样生效
struct BusyGuard<'a> {
    busy: &'a Mutex<HashSet<String>>,
    machine_id: String,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.busy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.machine_id);
    }
}

impl PowerManager {
    /// 注册全部内置驱动
    pub fn new() -> Result<Self> {
        let redfish = RedfishDriver::new().map_err(|e| Error::Internal(e.to_string()))?;
        let drivers: Vec<Arc<dyn PowerDriver>> = vec![
            Arc::new(IpmiDriver::new()),
            Arc::new(redfish),
            Arc::new(VirshDriver::new()),
            Arc::new(ManualDriver),
        ];
        Ok(Self::with_drivers(drivers))
    }

    pub fn with_drivers(drivers: Vec<Arc<dyn PowerDriver>>) -> Self {
        Self {
            drivers: drivers.into_iter().map(|d| (d.power_type(), d)).collect(),
            backoff: DEFAULT_BACKOFF.to_vec(),
            busy: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_backoff(mut self, backoff: Vec<Duration>) -> Self {
        self.backoff = backoff;
        self
    }

    fn driver(&self, power_type: PowerType) -> Result<Arc<dyn PowerDriver>> {
        self.drivers.get(&power_type).cloned().ok_or_else(|| {
            Error::InvalidArgument(format!("不支持的电源类型: {}", power_type.as_str()))
        })
    }

    fn claim(&self, machine_id: &str) -> Result<BusyGuard<'_>> {
        let mut busy = self.busy.lock().unwrap_or_else(PoisonError::into_inner);
        if !busy.insert(machine_id.to_string()) {
            warn!("⚠️ 拒绝电源操作，上一个动作仍在执行: machine={}", machine_id);
            return Err(Error::OperationInProgress(machine_id.to_string()));
        }
        Ok(BusyGuard {
            busy: &self.busy,
            machine_id: machine_id.to_string(),
        })
    }

    /// 执行电源动作并返回确认后的状态
    pub async fn execute(
        &self,
        machine_id: &str,
        action: PowerAction,
        power_type: PowerType,
        params: &PowerParameters,
    ) -> Result<PowerState> {
        let driver = self.driver(power_type)?;
        let _guard = match action {
            PowerAction::Query => None,
            _ => Some(self.claim(machine_id)?),
        };
        info!(
            "⚡ 电源操作: machine={}, action={}, type={}",
            machine_id,
            action,
            power_type.as_str()
        );

        let expected = match action {
            PowerAction::Query => None,
            PowerAction::On => {
                self.with_retry(machine_id, "on", || driver.power_on(params)).await?;
                Some(PowerState::On)
            }
            PowerAction::Off => {
                self.with_retry(machine_id, "off", || driver.power_off(params)).await?;
                Some(PowerState::Off)
            }
            PowerAction::Cycle => {
                self.with_retry(machine_id, "cycle", || driver.power_cycle(params))
                    .await?;
                Some(PowerState::On)
            }
        };

        let state = self
            .with_retry(machine_id, "query", || driver.query_state(params))
            .await?;

        match expected {
            Some(expected) if state != expected && state != PowerState::Unknown => {
                warn!(
                    "电源状态未生效: machine={}, expected={:?}, actual={:?}",
                    machine_id, expected, state
                );
                Err(Error::PowerFailed(format!(
                    "{}: 期望 {:?}, 实际 {:?}",
                    machine_id, expected, state
                )))
            }
            _ => {
                info!("✅ 电源操作完成: machine={}, state={:?}", machine_id, state);
                Ok(state)
            }
        }
    }

    async fn with_retry<T, F, Fut>(&self, machine_id: &str, op: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = DriverResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(DriverError::Fatal(msg)) => {
                    return Err(Error::PowerFailed(format!("{}: {}", machine_id, msg)));
                }
                Err(DriverError::Transient(msg)) => {
                    let Some(delay) = self.backoff.get(attempt) else {
                        warn!(
                            "⏰ BMC 无响应，放弃: machine={}, op={}, attempts={}",
                            machine_id,
                            op,
                            attempt + 1
                        );
                        return Err(Error::PowerTimeout(format!("{}: {}", machine_id, msg)));
                    };
                    debug!(
                        "BMC 暂时不可达，{:?} 后重试: machine={}, op={}, error={}",
                        delay, machine_id, op, msg
                    );
                    tokio::time::sleep(*delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// 记录调用序列；前 `failures` 次调用返回 `error`
    struct ScriptedDriver {
        calls: Mutex<Vec<&'static str>>,
        failures: Mutex<usize>,
        error: DriverError,
        state: Mutex<PowerState>,
    }

    impl ScriptedDriver {
        fn new(failures: usize, error: DriverError) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                failures: Mutex::new(failures),
                error,
                state: Mutex::new(PowerState::Off),
            })
        }

        fn step(&self, name: &'static str) -> DriverResult<()> {
            self.calls.lock().unwrap().push(name);
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(self.error.clone());
            }
            Ok(())
        }

        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PowerDriver for ScriptedDriver {
        async fn power_on(&self, _params: &PowerParameters) -> DriverResult<()> {
            self.step("on")?;
            *self.state.lock().unwrap() = PowerState::On;
            Ok(())
        }

        async fn power_off(&self, _params: &PowerParameters) -> DriverResult<()> {
            self.step("off")?;
            *self.state.lock().unwrap() = PowerState::Off;
            Ok(())
        }

        async fn query_state(&self, _params: &PowerParameters) -> DriverResult<PowerState> {
            self.step("query")?;
            Ok(*self.state.lock().unwrap())
        }

        fn power_type(&self) -> PowerType {
            PowerType::Ipmi
        }
    }

    fn manager(driver: Arc<ScriptedDriver>) -> PowerManager {
        PowerManager::with_drivers(vec![driver]).with_backoff(vec![Duration::from_millis(1); 3])
    }

    #[tokio::test]
    async fn test_transient_error_is_retried() {
        let driver = ScriptedDriver::new(2, DriverError::Transient("timeout".into()));
        let state = manager(driver.clone())
            .execute("m1", PowerAction::On, PowerType::Ipmi, &PowerParameters::new())
            .await
            .unwrap();

        assert_eq!(state, PowerState::On);
        assert_eq!(driver.calls(), vec!["on", "on", "on", "query"]);
    }

    #[tokio::test]
    async fn test_unreachable_bmc_times_out_after_schedule() {
        let driver = ScriptedDriver::new(usize::MAX, DriverError::Transient("timeout".into()));
        let err = manager(driver.clone())
            .execute("m1", PowerAction::Off, PowerType::Ipmi, &PowerParameters::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::PowerTimeout(_)));
        assert_eq!(driver.calls().len(), 4);
    }

    #[tokio::test]
    async fn test_fatal_error_is_not_retried() {
        let driver = ScriptedDriver::new(1, DriverError::Fatal("password invalid".into()));
        let err = manager(driver.clone())
            .execute("m1", PowerAction::On, PowerType::Ipmi, &PowerParameters::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::PowerFailed(_)));
        assert_eq!(driver.calls(), vec!["on"]);
    }

    #[tokio::test]
    async fn test_cycle_is_off_then_on() {
        let driver = ScriptedDriver::new(0, DriverError::Fatal(String::new()));
        let state = manager(driver.clone())
            .execute("m1", PowerAction::Cycle, PowerType::Ipmi, &PowerParameters::new())
            .await
            .unwrap();

        assert_eq!(state, PowerState::On);
        assert_eq!(driver.calls(), vec!["off", "on", "query"]);
    }

    #[tokio::test]
    async fn test_unsupported_power_type() {
        let driver = ScriptedDriver::new(0, DriverError::Fatal(String::new()));
        let err = manager(driver)
            .execute("m1", PowerAction::Query, PowerType::Redfish, &PowerParameters::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    /// 开机动作阻塞到测试放行
    struct GatedDriver {
        entered: tokio::sync::Notify,
        gate: tokio::sync::Semaphore,
    }

    #[async_trait]
    impl PowerDriver for GatedDriver {
        async fn power_on(&self, _params: &PowerParameters) -> DriverResult<()> {
            self.entered.notify_one();
            self.gate.acquire().await.unwrap().forget();
            Ok(())
        }

        async fn power_off(&self, _params: &PowerParameters) -> DriverResult<()> {
            Ok(())
        }

        async fn query_state(&self, _params: &PowerParameters) -> DriverResult<PowerState> {
            Ok(PowerState::Unknown)
        }

        fn power_type(&self) -> PowerType {
            PowerType::Ipmi
        }
    }

    #[tokio::test]
    async fn test_one_change_per_machine_at_a_time() {
        let driver = Arc::new(GatedDriver {
            entered: tokio::sync::Notify::new(),
            gate: tokio::sync::Semaphore::new(0),
        });
        let manager = Arc::new(PowerManager::with_drivers(vec![driver.clone()]));
        let params = PowerParameters::new();

        let first = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .execute("m1", PowerAction::On, PowerType::Ipmi, &PowerParameters::new())
                    .await
            })
        };
        driver.entered.notified().await;

        let err = manager
            .execute("m1", PowerAction::Off, PowerType::Ipmi, &params)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::OperationInProgress(_)));
        // 查询与其他机器不受影响
        manager
            .execute("m1", PowerAction::Query, PowerType::Ipmi, &params)
            .await
            .unwrap();
        manager
            .execute("m2", PowerAction::Off, PowerType::Ipmi, &params)
            .await
            .unwrap();

        driver.gate.add_permits(1);
        assert_eq!(first.await.unwrap().unwrap(), PowerState::Unknown);

        // 被取消的动作同样释放
        let second = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .execute("m1", PowerAction::On, PowerType::Ipmi, &PowerParameters::new())
                    .await
            })
        };
        driver.entered.notified().await;
        second.abort();
        assert!(second.await.unwrap_err().is_cancelled());

        driver.gate.add_permits(1);
        manager
            .execute("m1", PowerAction::On, PowerType::Ipmi, &params)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_manual_driver_reports_unknown() {
        let manager = PowerManager::with_drivers(vec![Arc::new(ManualDriver)]);
        let state = manager
            .execute("m1", PowerAction::On, PowerType::Manual, &PowerParameters::new())
            .await
            .unwrap();
        assert_eq!(state, PowerState::Unknown);
    }
}
