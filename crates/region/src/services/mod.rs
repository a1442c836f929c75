pub mod controller_service;
pub mod machine_service;
pub mod membership;
pub mod power_coordinator;
pub mod settings_service;
pub mod topology_service;

pub use controller_service::ControllerService;
pub use machine_service::{MachineCache, MachineService};
pub use membership::ControllerMembership;
pub use power_coordinator::PowerCoordinator;
pub use settings_service::SettingsService;
pub use topology_service::TopologyService;
