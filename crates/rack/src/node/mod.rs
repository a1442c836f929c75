/// 机架控制器身份
///
/// 注册与心跳时上报给区域控制器的信息

use chrono::Utc;
use common::models::{ControllerRole, ControllerService, VlanId};
use common::ws_rpc::{HeartbeatNotification, RegisterRequest};
use std::collections::BTreeSet;

/// 机架身份信息
#[derive(Debug, Clone)]
pub struct RackIdentity {
    system_id: String,
    hostname: String,
    role: ControllerRole,
    services: BTreeSet<ControllerService>,
    vlans: BTreeSet<VlanId>,
}

impl RackIdentity {
    pub fn new(
        system_id: impl Into<String>,
        hostname: impl Into<String>,
        role: ControllerRole,
        vlans: impl IntoIterator<Item = VlanId>,
    ) -> Self {
        let mut services = BTreeSet::new();
        if role.is_rack() {
            services.insert(ControllerService::Dhcp);
            services.insert(ControllerService::PowerControlAgent);
        }
        Self {
            system_id: system_id.into(),
            hostname: hostname.into(),
            role,
            services,
            vlans: vlans.into_iter().collect(),
        }
    }

    pub fn system_id(&self) -> &str {
        &self.system_id
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn register_request(&self) -> RegisterRequest {
        RegisterRequest {
            system_id: self.system_id.clone(),
            hostname: self.hostname.clone(),
            role: self.role,
            services: self.services.clone(),
            vlans: self.vlans.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn heartbeat(&self) -> HeartbeatNotification {
        HeartbeatNotification {
            system_id: self.system_id.clone(),
            timestamp: Utc::now().timestamp(),
            vlans: self.vlans.clone(),
        }
    }
}

/// 本机主机名
pub fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rack_identity_reports_services() {
        let identity = RackIdentity::new("abc123", "rack-1", ControllerRole::Rack, [10, 20]);
        let req = identity.register_request();

        assert_eq!(req.system_id, "abc123");
        assert!(req.services.contains(&ControllerService::Dhcp));
        assert!(req.services.contains(&ControllerService::PowerControlAgent));
        assert_eq!(req.vlans.into_iter().collect::<Vec<_>>(), vec![10, 20]);
        assert_eq!(identity.heartbeat().system_id, "abc123");
    }
}
