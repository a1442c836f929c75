/// 网络引导模块

pub mod methods;
pub mod router;

pub use methods::BootMethod;
pub use router::{BootInstructions, BootPurpose, BootRouter, BootSource, MachineDirectory};
