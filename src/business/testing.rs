//! Recording collaborators for controller tests

use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::sync::NodeDeps;
use crate::config::NodeConfig;
use crate::core::{
    AuditEvent, HandlerId, NodeId, NodeParams, NodeStatus, PanelApi, ProxyEngine, TlsMaterial,
    TrafficAggregator, TrafficCallback, TrafficReport, UserEntry, UserId,
};
use crate::error::{ControllerError, Result};

pub(crate) fn params(node_id: NodeId) -> NodeParams {
    NodeParams {
        node_id,
        protocol: "trojan".to_string(),
        listen_ip: "0.0.0.0".to_string(),
        port: 443,
        tls: false,
        server_name: None,
        network: None,
        network_settings: BTreeMap::new(),
        speed_limit: 0,
        rules: vec![],
    }
}

/// Node config whose periodic tasks never tick during a test
pub(crate) fn node_config(id: NodeId) -> NodeConfig {
    let mut config = NodeConfig::new(id, "http://panel.test", "token");
    config.node_sync_interval = Duration::from_secs(3600);
    config.user_sync_interval = Duration::from_secs(3600);
    config.traffic_report_interval = Duration::from_secs(3600);
    config.retry_attempts = 1;
    config.retry_backoff = Duration::from_millis(1);
    config
}

pub(crate) fn deps(panel: &Arc<MockPanel>, engine: &Arc<MockEngine>) -> NodeDeps {
    NodeDeps {
        panel: Arc::clone(panel) as Arc<dyn PanelApi>,
        engine: Arc::clone(engine) as Arc<dyn ProxyEngine>,
        certs: None,
        traffic: Arc::new(TrafficAggregator::new()),
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Default)]
pub(crate) struct MockPanel {
    /// `None` makes node fetches fail
    pub params: Mutex<Option<NodeParams>>,
    pub users: Mutex<Vec<UserEntry>>,
    pub fail_users: AtomicU32,
    pub fail_traffic: AtomicU32,
    pub user_fetch_delay: Mutex<Duration>,
    pub node_fetches: AtomicU32,
    pub traffic_reports: Mutex<Vec<TrafficReport>>,
    pub statuses: Mutex<Vec<NodeStatus>>,
    pub audit_events: Mutex<Vec<AuditEvent>>,
}

impl MockPanel {
    pub(crate) fn new(params: NodeParams, users: Vec<UserEntry>) -> Arc<Self> {
        let panel = Self::default();
        *lock(&panel.params) = Some(params);
        *lock(&panel.users) = users;
        Arc::new(panel)
    }

    pub(crate) fn set_params(&self, params: Option<NodeParams>) {
        *lock(&self.params) = params;
    }

    pub(crate) fn set_users(&self, users: Vec<UserEntry>) {
        *lock(&self.users) = users;
    }

    pub(crate) fn traffic_reports(&self) -> Vec<TrafficReport> {
        lock(&self.traffic_reports).clone()
    }

    pub(crate) fn audit_events(&self) -> Vec<AuditEvent> {
        lock(&self.audit_events).clone()
    }

    pub(crate) fn statuses(&self) -> Vec<NodeStatus> {
        lock(&self.statuses).clone()
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl PanelApi for MockPanel {
    async fn fetch_node_info(&self, _node_id: NodeId) -> Result<NodeParams> {
        self.node_fetches.fetch_add(1, Ordering::SeqCst);
        lock(&self.params)
            .clone()
            .ok_or_else(|| ControllerError::Fetch("panel unreachable".to_string()))
    }

    async fn fetch_user_list(&self, _node_id: NodeId) -> Result<Vec<UserEntry>> {
        let delay = *lock(&self.user_fetch_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if Self::take_failure(&self.fail_users) {
            return Err(ControllerError::Fetch("panel unreachable".to_string()));
        }
        Ok(lock(&self.users).clone())
    }

    async fn report_user_traffic(&self, _node_id: NodeId, traffic: &TrafficReport) -> Result<()> {
        if Self::take_failure(&self.fail_traffic) {
            return Err(ControllerError::Fetch("report rejected".to_string()));
        }
        lock(&self.traffic_reports).push(traffic.clone());
        Ok(())
    }

    async fn report_node_status(&self, _node_id: NodeId, status: &NodeStatus) -> Result<()> {
        lock(&self.statuses).push(status.clone());
        Ok(())
    }

    async fn report_audit_events(&self, _node_id: NodeId, events: &[AuditEvent]) -> Result<()> {
        lock(&self.audit_events).extend_from_slice(events);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum EngineCall {
    Register { node_id: NodeId, port: u16, tls: bool },
    Deregister(HandlerId),
    AddUser(HandlerId, UserId),
    RemoveUser(HandlerId, UserId),
}

pub(crate) struct MockEngine {
    calls: Mutex<Vec<EngineCall>>,
    next_handler: AtomicU64,
    pub fail_register: AtomicBool,
    pub fail_add: Mutex<HashSet<UserId>>,
    callbacks: Mutex<Vec<TrafficCallback>>,
}

impl MockEngine {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            next_handler: AtomicU64::new(1),
            fail_register: AtomicBool::new(false),
            fail_add: Mutex::new(HashSet::new()),
            callbacks: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn calls(&self) -> Vec<EngineCall> {
        lock(&self.calls).clone()
    }

    pub(crate) fn take_calls(&self) -> Vec<EngineCall> {
        std::mem::take(&mut *lock(&self.calls))
    }

    /// Simulate the data plane reporting bytes
    pub(crate) fn emit(&self, user_id: UserId, node_id: NodeId, upload: u64, download: u64) {
        for cb in lock(&self.callbacks).iter() {
            cb(user_id, node_id, upload, download);
        }
    }

    pub(crate) fn subscribers(&self) -> usize {
        lock(&self.callbacks).len()
    }
}

#[async_trait]
impl ProxyEngine for MockEngine {
    async fn register_inbound(
        &self,
        node_id: NodeId,
        params: &NodeParams,
        tls: Option<&TlsMaterial>,
    ) -> Result<HandlerId> {
        if self.fail_register.load(Ordering::SeqCst) {
            return Err(ControllerError::Engine("port in use".to_string()));
        }
        lock(&self.calls).push(EngineCall::Register {
            node_id,
            port: params.port,
            tls: tls.is_some(),
        });
        Ok(self.next_handler.fetch_add(1, Ordering::SeqCst))
    }

    async fn deregister_inbound(&self, handler: HandlerId) -> Result<()> {
        lock(&self.calls).push(EngineCall::Deregister(handler));
        Ok(())
    }

    async fn add_user(&self, handler: HandlerId, user: &UserEntry) -> Result<()> {
        if lock(&self.fail_add).contains(&user.id) {
            return Err(ControllerError::Engine(format!("cannot add user {}", user.id)));
        }
        lock(&self.calls).push(EngineCall::AddUser(handler, user.id));
        Ok(())
    }

    async fn remove_user(&self, handler: HandlerId, user_id: UserId) -> Result<()> {
        lock(&self.calls).push(EngineCall::RemoveUser(handler, user_id));
        Ok(())
    }

    fn subscribe_traffic_stats(&self, callback: TrafficCallback) {
        lock(&self.callbacks).push(callback);
    }
}
