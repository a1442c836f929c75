/// 电源控制
///
/// 机架控制器代区域控制器操作 BMC

pub mod driver;
pub mod ipmi;
pub mod manager;
pub mod manual;
pub mod redfish;
pub mod virsh;

pub use driver::{DriverError, PowerDriver};
pub use manager::PowerManager;
