/// 租约管理模块

pub mod checkpoint;
pub mod store;

pub use checkpoint::LeaseCheckpoint;
pub use store::{EventOrigin, LeaseEvent, LeaseEventKind, LeaseStore, LeaseTimers};
