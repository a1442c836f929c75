/// 手动电源驱动：只记录日志，由操作员执行

use async_trait::async_trait;
use common::models::{PowerParameters, PowerState, PowerType};
use tracing::info;

use super::driver::{DriverResult, PowerDriver};

pub struct ManualDriver;

#[async_trait]
impl PowerDriver for ManualDriver {
    async fn power_on(&self, _params: &PowerParameters) -> DriverResult<()> {
        info!("🔌 手动电源: 请操作员开机");
        Ok(())
    }

    async fn power_off(&self, _params: &PowerParameters) -> DriverResult<()> {
        info!("🔌 手动电源: 请操作员关机");
        Ok(())
    }

    async fn query_state(&self, _params: &PowerParameters) -> DriverResult<PowerState> {
        Ok(PowerState::Unknown)
    }

    fn power_type(&self) -> PowerType {
        PowerType::Manual
    }
}
