/// 电源操作协调器
///
/// 每台机器同一时刻最多一个进行中的电源操作：
/// - 变更操作（on/off/cycle）进行中时，新的变更请求立即返回 `OperationInProgress`
/// - 查询在变更进行中时等待其结束（默认 30 秒）再查询
/// - 查询进行中时，新的查询共享同一结果
///
/// 操作在独立任务中执行，调用方断开不会留下悬挂的进行中记录。

use async_trait::async_trait;
use chrono::Utc;
use common::models::{
    Machine, PowerAction, PowerOperation, PowerOperationStatus, PowerState,
};
use common::ws_rpc::PowerActionRequest;
use common::{Error, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::membership::ControllerMembership;

/// 每台机器保留的历史操作条数
const HISTORY_LIMIT: usize = 50;

/// 把电源操作发送到机架控制器
#[async_trait]
pub trait PowerDispatcher: Send + Sync {
    async fn dispatch(&self, rack_id: &str, request: PowerActionRequest) -> Result<PowerState>;
}

struct InFlight {
    action: PowerAction,
    done: watch::Receiver<Option<PowerOperation>>,
}

pub struct PowerCoordinator {
    membership: Arc<ControllerMembership>,
    dispatcher: Arc<dyn PowerDispatcher>,
    inflight: Mutex<HashMap<String, InFlight>>,
    history: RwLock<HashMap<String, VecDeque<PowerOperation>>>,
}

/// 已结束的操作转换为调用结果
fn outcome(op: PowerOperation) -> Result<PowerOperation> {
    match op.status {
        PowerOperationStatus::TimedOut => Err(Error::PowerTimeout(
            op.error.unwrap_or_else(|| op.machine_id.clone()),
        )),
        PowerOperationStatus::Failed => Err(Error::PowerFailed(
            op.error.unwrap_or_else(|| op.machine_id.clone()),
        )),
        _ => Ok(op),
    }
}

async fn wait_done(mut done: watch::Receiver<Option<PowerOperation>>) -> Option<PowerOperation> {
    loop {
        if let Some(op) = done.borrow().clone() {
            return Some(op);
        }
        if done.changed().await.is_err() {
            return done.borrow().clone();
        }
    }
}

impl PowerCoordinator {
    pub fn new(membership: Arc<ControllerMembership>, dispatcher: Arc<dyn PowerDispatcher>) -> Self {
        Self {
            membership,
            dispatcher,
            inflight: Mutex::new(HashMap::new()),
            history: RwLock::new(HashMap::new()),
        }
    }

    /// 机器的历史操作，最新的在前
    pub async fn history(&self, machine_id: &str) -> Vec<PowerOperation> {
        self.history
            .read()
            .await
            .get(machine_id)
            .map(|ops| ops.iter().rev().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn in_flight(&self, machine_id: &str) -> Option<PowerAction> {
        self.inflight.lock().await.get(machine_id).map(|f| f.action)
    }

    async fn record(&self, op: &PowerOperation) {
        let mut history = self.history.write().await;
        let ops = history.entry(op.machine_id.clone()).or_default();
        match ops.iter_mut().find(|o| o.id == op.id) {
            Some(existing) => *existing = op.clone(),
            None => {
                ops.push_back(op.clone());
                while ops.len() > HISTORY_LIMIT {
                    ops.pop_front();
                }
            }
        }
    }

    /// 请求电源操作
    pub async fn request_power(
        self: &Arc<Self>,
        machine: &Machine,
        action: PowerAction,
    ) -> Result<PowerOperation> {
        let settings = self.membership.settings().await;
        let query_wait = settings.power_query_wait();

        loop {
            let mut inflight = self.inflight.lock().await;
            let Some(current) = inflight.get(&machine.system_id) else {
                let done = self.start(&mut inflight, machine, action, settings.power_timeout());
                drop(inflight);
                return match wait_done(done).await {
                    Some(op) => outcome(op),
                    None => Err(Error::Internal("电源操作任务异常结束".to_string())),
                };
            };

            if action.is_change() {
                warn!(
                    "机器 {} 已有电源操作 {} 进行中，拒绝 {}",
                    machine.system_id, current.action, action
                );
                return Err(Error::OperationInProgress(machine.system_id.clone()));
            }

            let done = current.done.clone();
            let sharing = !current.action.is_change();
            drop(inflight);

            if sharing {
                debug!("共享进行中的查询结果: machine={}", machine.system_id);
                return match wait_done(done).await {
                    Some(op) => outcome(op),
                    None => Err(Error::Internal("电源操作任务异常结束".to_string())),
                };
            }

            // 等待变更结束后重新查询
            debug!("查询等待进行中的变更: machine={}", machine.system_id);
            if tokio::time::timeout(query_wait, wait_done(done)).await.is_err() {
                return Err(Error::OperationInProgress(machine.system_id.clone()));
            }
        }
    }

    /// 登记进行中操作并启动执行任务
    fn start(
        self: &Arc<Self>,
        inflight: &mut HashMap<String, InFlight>,
        machine: &Machine,
        action: PowerAction,
        timeout: Duration,
    ) -> watch::Receiver<Option<PowerOperation>> {
        let (tx, rx) = watch::channel(None);
        inflight.insert(
            machine.system_id.clone(),
            InFlight {
                action,
                done: rx.clone(),
            },
        );

        let this = self.clone();
        let machine = machine.clone();
        tokio::spawn(async move {
            let op = this.execute(&machine, action, timeout).await;
            this.inflight.lock().await.remove(&machine.system_id);
            tx.send_replace(Some(op));
        });
        rx
    }

    async fn execute(&self, machine: &Machine, action: PowerAction, timeout: Duration) -> PowerOperation {
        let mut op = PowerOperation {
            id: Uuid::new_v4().to_string(),
            machine_id: machine.system_id.clone(),
            action,
            rack_id: None,
            status: PowerOperationStatus::Pending,
            power_state: None,
            error: None,
            created_at: Utc::now(),
            finished_at: None,
        };

        let Some(rack_id) = self.membership.power_owner(&machine.system_id).await else {
            op.status = PowerOperationStatus::Failed;
            op.error = Some(format!("机器 {} 没有可用的电源控制机架", machine.system_id));
            op.finished_at = Some(Utc::now());
            self.record(&op).await;
            return op;
        };

        op.rack_id = Some(rack_id.clone());
        op.status = PowerOperationStatus::InFlight;
        self.record(&op).await;
        info!(
            "⚡ 下发电源操作: machine={}, action={}, rack={}, op={}",
            machine.system_id, action, rack_id, op.id
        );

        let request = PowerActionRequest {
            machine_id: machine.system_id.clone(),
            action,
            power_type: machine.power_type,
            parameters: machine.power_parameters.clone(),
        };
        let result = tokio::time::timeout(timeout, self.dispatcher.dispatch(&rack_id, request)).await;

        match result {
            Ok(Ok(state)) => {
                op.status = PowerOperationStatus::Succeeded;
                op.power_state = Some(state);
                info!(
                    "✅ 电源操作完成: machine={}, action={}, state={:?}",
                    machine.system_id, action, state
                );
            }
            Ok(Err(Error::PowerTimeout(msg))) => {
                op.status = PowerOperationStatus::TimedOut;
                op.error = Some(msg);
            }
            Ok(Err(e)) => {
                op.status = PowerOperationStatus::Failed;
                op.error = Some(e.to_string());
            }
            Err(_) => {
                op.status = PowerOperationStatus::TimedOut;
                op.error = Some(format!("{:?} 内未完成", timeout));
            }
        }
        if op.status != PowerOperationStatus::Succeeded {
            warn!(
                "❌ 电源操作失败: machine={}, action={}, status={:?}, error={:?}",
                machine.system_id, action, op.status, op.error
            );
        }

        op.finished_at = Some(Utc::now());
        self.record(&op).await;
        op
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::models::{ControllerNode, ControllerRole, MachineStatus, PowerType};
    use common::settings::ClusterSettings;
    use common::SubnetRegistry;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SlowRack {
        delay: Duration,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PowerDispatcher for SlowRack {
        async fn dispatch(&self, _rack_id: &str, request: PowerActionRequest) -> Result<PowerState> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(match request.action {
                PowerAction::Off => PowerState::Off,
                _ => PowerState::On,
            })
        }
    }

    fn machine() -> Machine {
        Machine {
            system_id: "m-1".to_string(),
            hostname: "node-1".to_string(),
            architecture: "amd64/generic".to_string(),
            status: MachineStatus::Ready,
            boot_macs: vec![],
            power_type: PowerType::Manual,
            power_parameters: Default::default(),
            bmc_vlan_id: None,
        }
    }

    async fn setup(delay: Duration, power_timeout: u64) -> (Arc<PowerCoordinator>, Arc<SlowRack>) {
        let settings = ClusterSettings {
            power_timeout,
            ..Default::default()
        };
        let membership = Arc::new(ControllerMembership::new(Arc::new(SubnetRegistry::new()), settings));
        membership
            .register(ControllerNode {
                system_id: "rack-1".to_string(),
                hostname: "rack-1".to_string(),
                role: ControllerRole::Rack,
                rpc_endpoint: None,
                services: Default::default(),
                vlans: Default::default(),
                last_heartbeat: Utc::now(),
                online: true,
            })
            .await
            .unwrap();
        membership.register_machine("m-1", None).await.unwrap();

        let rack = Arc::new(SlowRack {
            delay,
            calls: AtomicUsize::new(0),
        });
        (Arc::new(PowerCoordinator::new(membership, rack.clone())), rack)
    }

    #[tokio::test]
    async fn test_concurrent_change_rejected() {
        let (coordinator, _) = setup(Duration::from_millis(300), 60).await;
        let m = machine();

        let first = {
            let coordinator = coordinator.clone();
            let m = m.clone();
            tokio::spawn(async move { coordinator.request_power(&m, PowerAction::On).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = coordinator.request_power(&m, PowerAction::Off).await;
        assert!(matches!(second, Err(Error::OperationInProgress(_))));

        let op = first.await.unwrap().unwrap();
        assert_eq!(op.status, PowerOperationStatus::Succeeded);
        assert_eq!(op.power_state, Some(PowerState::On));
        assert_eq!(op.rack_id.as_deref(), Some("rack-1"));
        assert!(coordinator.in_flight("m-1").await.is_none());
    }

    #[tokio::test]
    async fn test_query_waits_for_change() {
        let (coordinator, rack) = setup(Duration::from_millis(200), 60).await;
        let m = machine();

        let change = {
            let coordinator = coordinator.clone();
            let m = m.clone();
            tokio::spawn(async move { coordinator.request_power(&m, PowerAction::Off).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let query = coordinator.request_power(&m, PowerAction::Query).await.unwrap();
        assert_eq!(query.action, PowerAction::Query);
        assert!(change.await.unwrap().is_ok());
        // 变更一次，查询一次
        assert_eq!(rack.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrent_queries_share_result() {
        let (coordinator, rack) = setup(Duration::from_millis(200), 60).await;
        let m = machine();

        let a = {
            let coordinator = coordinator.clone();
            let m = m.clone();
            tokio::spawn(async move { coordinator.request_power(&m, PowerAction::Query).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let b = coordinator.request_power(&m, PowerAction::Query).await.unwrap();
        let a = a.await.unwrap().unwrap();

        assert_eq!(a.id, b.id);
        assert_eq!(rack.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_marks_timed_out() {
        let (coordinator, _) = setup(Duration::from_secs(5), 1).await;
        let m = machine();

        let result = coordinator.request_power(&m, PowerAction::On).await;
        assert!(matches!(result, Err(Error::PowerTimeout(_))));

        let history = coordinator.history("m-1").await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, PowerOperationStatus::TimedOut);
        assert!(coordinator.in_flight("m-1").await.is_none());
    }

    #[tokio::test]
    async fn test_no_owner_fails() {
        let (coordinator, _) = setup(Duration::from_millis(1), 60).await;
        let mut m = machine();
        m.system_id = "unregistered".to_string();

        let result = coordinator.request_power(&m, PowerAction::On).await;
        assert!(matches!(result, Err(Error::PowerFailed(_))));
    }
}
