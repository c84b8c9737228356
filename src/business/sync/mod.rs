//! Per-node synchronization engine
//!
//! A `NodeController` keeps one node's inbound, user list and accounting in
//! line with the panel:
//! - node sync rebuilds the inbound when the panel's params change
//! - user sync diffs the panel's user list against what the engine holds
//! - traffic report drains this node's counters and reports them
//!
//! It is also the admission point for new connections (audit rules first,
//! then the limiter).

mod live_state;
mod retry;
mod tasks;


pub use live_state::{LiveState, UserDiff};
pub use retry::RetryPolicy;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::watch;

use self::tasks::{format_bytes, SyncTasksHandle};
use super::cert::CertManager;
use crate::config::NodeConfig;
use crate::core::{
    load_audit_file, AuditAction, AuditEvent, AuditMatcher, CertProvider, ConnectionId, Denied,
    HandlerId, Limiter, NodeId, NodeParams, NodeStatus, PanelApi, ProxyEngine, Target, TlsMaterial,
    TrafficAggregator, UserId, UserLimits,
};
use crate::error::{ControllerError, Result};
use crate::logger::log;

/// Audit events kept between two reports; older ones are dropped first
const MAX_PENDING_AUDIT_EVENTS: usize = 10_000;

/// Collaborators handed to every node controller
#[derive(Clone)]
pub struct NodeDeps {
    pub panel: Arc<dyn PanelApi>,
    pub engine: Arc<dyn ProxyEngine>,
    pub certs: Option<Arc<dyn CertProvider>>,
    pub traffic: Arc<TrafficAggregator>,
}

/// Lifecycle of a node controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Stopped => "stopped",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Outcome of one user sync pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserSyncSummary {
    pub added: usize,
    pub removed: usize,
    pub updated: usize,
    pub failed: usize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn get_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Synchronization engine of one node
pub struct NodeController {
    config: NodeConfig,
    panel: Arc<dyn PanelApi>,
    engine: Arc<dyn ProxyEngine>,
    traffic: Arc<TrafficAggregator>,
    certs: CertManager,
    retry: RetryPolicy,
    limiter: Limiter,
    audit: ArcSwap<AuditMatcher>,
    local_rules: ArcSwap<Vec<String>>,
    /// Serializes node sync, user sync and bans
    live: tokio::sync::Mutex<LiveState>,
    lifecycle: Mutex<LifecycleState>,
    shutdown: watch::Sender<bool>,
    tasks: tokio::sync::Mutex<Option<SyncTasksHandle>>,
    /// user -> ban expiry
    bans: DashMap<UserId, Instant>,
    audit_events: Mutex<Vec<AuditEvent>>,
    registered: AtomicUsize,
    listener_up: AtomicBool,
    started_at: Mutex<Instant>,
    hostname: String,
}

impl NodeController {
    pub fn new(config: NodeConfig, deps: NodeDeps) -> Self {
        let (shutdown, _) = watch::channel(true);
        Self {
            certs: CertManager::new(config.id, config.cert.clone(), deps.certs),
            retry: RetryPolicy::from_config(&config),
            limiter: Limiter::new(config.device_idle_grace),
            panel: deps.panel,
            engine: deps.engine,
            traffic: deps.traffic,
            audit: ArcSwap::from_pointee(AuditMatcher::default()),
            local_rules: ArcSwap::from_pointee(Vec::new()),
            live: tokio::sync::Mutex::new(LiveState::default()),
            lifecycle: Mutex::new(LifecycleState::Stopped),
            shutdown,
            tasks: tokio::sync::Mutex::new(None),
            bans: DashMap::new(),
            audit_events: Mutex::new(Vec::new()),
            registered: AtomicUsize::new(0),
            listener_up: AtomicBool::new(false),
            started_at: Mutex::new(Instant::now()),
            hostname: get_hostname(),
            config,
        }
    }

    pub fn id(&self) -> NodeId {
        self.config.id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn state(&self) -> LifecycleState {
        *lock(&self.lifecycle)
    }

    /// Limiter of this node, for `consume`/`throttle` on the data path
    pub fn limiter(&self) -> &Limiter {
        &self.limiter
    }

    /// Currently active audit rules
    pub fn audit_matcher(&self) -> Arc<AuditMatcher> {
        self.audit.load_full()
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    fn stop_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Users currently held in live state, sorted
    pub async fn registered_users(&self) -> Vec<UserId> {
        let mut ids: Vec<UserId> = self.live.lock().await.users.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Current inbound handler, if the node is built
    pub async fn handler(&self) -> Option<HandlerId> {
        self.live.lock().await.handler
    }

    /// Start the node: load local audit rules, run an initial sync and spawn
    /// the periodic tasks.
    ///
    /// Initial sync failures are not fatal; the node starts stale and the
    /// next tick retries.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = lock(&self.lifecycle);
            if *state != LifecycleState::Stopped {
                return Err(ControllerError::Other(format!(
                    "node {} is {}",
                    self.id(),
                    *state
                )));
            }
            *state = LifecycleState::Starting;
        }

        self.shutdown.send_replace(false);
        self.limiter.reopen();
        self.traffic.register_node(self.id());
        *lock(&self.started_at) = Instant::now();

        if let Err(e) = self.load_local_rules().await {
            self.shutdown.send_replace(true);
            self.traffic.remove_node(self.id());
            *lock(&self.lifecycle) = LifecycleState::Stopped;
            return Err(e);
        }

        log::info!(
            node_id = self.id(),
            api = %self.config.api,
            protocol = %self.config.protocol,
            "Starting node"
        );

        if let Err(e) = self.sync_node().await {
            log::warn!(node_id = self.id(), error = %e, "Initial node sync failed, retrying on next tick");
        }
        if let Err(e) = self.sync_users().await {
            log::warn!(node_id = self.id(), error = %e, "Initial user sync failed, retrying on next tick");
        }

        {
            let mut state = lock(&self.lifecycle);
            if *state != LifecycleState::Starting {
                // stop() ran while we were syncing
                return Err(ControllerError::Cancelled);
            }
            *state = LifecycleState::Running;
        }

        let handle = tasks::spawn(self);
        *self.tasks.lock().await = Some(handle);

        log::info!(node_id = self.id(), "Node started");
        Ok(())
    }

    async fn load_local_rules(&self) -> Result<()> {
        let rules = match &self.config.audit_file {
            Some(path) => load_audit_file(path).await?,
            None => Vec::new(),
        };
        let matcher = AuditMatcher::from_lines(&rules)?;
        log::debug!(node_id = self.id(), rules = matcher.len(), "Local audit rules loaded");
        self.audit.store(Arc::new(matcher));
        self.local_rules.store(Arc::new(rules));
        Ok(())
    }

    /// Stop the node.
    ///
    /// Admissions are denied first, then the inbound is deregistered and
    /// limiter state released, then the periodic tasks are joined (the
    /// traffic task flushes one last report on its way out).
    pub async fn stop(&self) {
        {
            let mut state = lock(&self.lifecycle);
            match *state {
                LifecycleState::Stopped | LifecycleState::Stopping => return,
                _ => *state = LifecycleState::Stopping,
            }
        }
        log::info!(node_id = self.id(), "Stopping node");

        self.limiter.close();
        self.shutdown.send_replace(true);

        {
            let mut live = self.live.lock().await;
            if let Some(handler) = live.handler.take() {
                if let Err(e) = self.engine.deregister_inbound(handler).await {
                    log::warn!(node_id = self.id(), handler = handler, error = %e, "Failed to deregister inbound");
                }
            }
            live.reset();
            self.publish(&live);
        }
        self.limiter.clear();
        self.bans.clear();

        let handle = self.tasks.lock().await.take();
        if let Some(handle) = handle {
            handle.join(self.id()).await;
        }
        self.traffic.remove_node(self.id());

        *lock(&self.lifecycle) = LifecycleState::Stopped;
        log::info!(node_id = self.id(), "Node stopped");
    }

    fn publish(&self, live: &LiveState) {
        self.registered.store(live.users.len(), Ordering::Relaxed);
        self.listener_up.store(live.handler.is_some(), Ordering::Relaxed);
    }

    /// Fetch node params and rebuild the inbound when they changed, the last
    /// rebuild failed or the certificate was renewed. Returns whether a
    /// rebuild happened.
    pub async fn sync_node(&self) -> Result<bool> {
        let node_id = self.id();
        let mut shutdown = self.shutdown_signal();
        let params = self
            .retry
            .run("fetch_node_info", &mut shutdown, || self.panel.fetch_node_info(node_id))
            .await?;
        if self.stop_requested() {
            return Err(ControllerError::Cancelled);
        }

        let hash = params.structural_hash();
        let current = self.live.lock().await.is_current(&hash);
        if current && !self.certs.renewal_due(&params) {
            log::debug!(node_id = node_id, "Node params unchanged");
            return Ok(false);
        }

        let tls = match self.certs.material(&params).await {
            Ok(tls) => tls,
            Err(e) => {
                if !current {
                    let mut live = self.live.lock().await;
                    live.mark_stale();
                }
                return Err(e);
            }
        };

        let mut live = self.live.lock().await;
        if self.stop_requested() {
            return Err(ControllerError::Cancelled);
        }
        if live.is_current(&hash) && live.tls == tls {
            return Ok(false);
        }

        let result = self.rebuild(&mut live, params, hash, tls).await;
        if result.is_err() {
            live.mark_stale();
        }
        self.publish(&live);
        result.map(|_| true)
    }

    async fn rebuild(
        &self,
        live: &mut LiveState,
        params: NodeParams,
        hash: String,
        tls: Option<TlsMaterial>,
    ) -> Result<()> {
        let node_id = self.id();
        let local = self.local_rules.load_full();
        let matcher = AuditMatcher::from_lines(local.iter().chain(params.rules.iter()))?;

        if let Some(handler) = live.handler {
            self.engine.deregister_inbound(handler).await?;
            live.handler = None;
            log::debug!(node_id = node_id, handler = handler, "Old inbound deregistered");
        }

        let handler = self
            .engine
            .register_inbound(node_id, &params, tls.as_ref())
            .await?;
        live.handler = Some(handler);

        let mut failed = Vec::new();
        for user in live.users.values() {
            if let Err(e) = self.engine.add_user(handler, user).await {
                log::warn!(node_id = node_id, user_id = user.id, error = %e, "Failed to re-add user");
                failed.push(user.id);
            }
        }
        // Dropped from live state so the next user sync adds them again
        for user_id in &failed {
            live.users.remove(user_id);
            self.limiter.remove_user(*user_id);
        }

        self.limiter.set_node_limit(params.speed_limit);
        log::info!(
            node_id = node_id,
            handler = handler,
            protocol = %params.protocol,
            port = params.port,
            tls = tls.is_some(),
            users = live.users.len(),
            rules = matcher.len(),
            "Inbound rebuilt"
        );
        self.audit.store(Arc::new(matcher));

        live.params_hash = Some(hash);
        live.params = Some(params);
        live.tls = tls;
        live.stale = false;
        Ok(())
    }

    /// Fetch the user list and reconcile it with live state
    pub async fn sync_users(&self) -> Result<UserSyncSummary> {
        let node_id = self.id();
        let mut shutdown = self.shutdown_signal();
        let users = self
            .retry
            .run("fetch_user_list", &mut shutdown, || self.panel.fetch_user_list(node_id))
            .await?;
        if self.stop_requested() {
            return Err(ControllerError::Cancelled);
        }

        let mut live = self.live.lock().await;
        if self.stop_requested() {
            return Err(ControllerError::Cancelled);
        }

        let now = Instant::now();
        let desired = users
            .iter()
            .filter(|u| u.enabled && !self.is_banned_at(u.id, now));
        let diff = live.diff(desired);
        let summary = self.apply_diff(&mut live, diff).await;
        self.publish(&live);

        log::user_sync(
            node_id,
            live.users.len(),
            summary.added,
            summary.removed,
            summary.updated,
            summary.failed,
        );
        Ok(summary)
    }

    async fn apply_diff(&self, live: &mut LiveState, diff: UserDiff) -> UserSyncSummary {
        let node_id = self.id();
        let handler = live.handler;
        let mut summary = UserSyncSummary::default();

        for user_id in diff.removed {
            if let Some(h) = handler {
                if let Err(e) = self.engine.remove_user(h, user_id).await {
                    log::warn!(node_id = node_id, user_id = user_id, error = %e, "Failed to remove user");
                    summary.failed += 1;
                    continue;
                }
            }
            live.users.remove(&user_id);
            self.limiter.remove_user(user_id);
            summary.removed += 1;
        }

        for user in diff.replaced {
            if let Some(h) = handler {
                if let Err(e) = self.engine.remove_user(h, user.id).await {
                    log::warn!(node_id = node_id, user_id = user.id, error = %e, "Failed to remove user for credential change");
                    summary.failed += 1;
                    continue;
                }
                if let Err(e) = self.engine.add_user(h, &user).await {
                    log::warn!(node_id = node_id, user_id = user.id, error = %e, "Failed to re-add user after credential change");
                    live.users.remove(&user.id);
                    self.limiter.remove_user(user.id);
                    summary.failed += 1;
                    continue;
                }
            }
            self.limiter.set_limits(user.id, UserLimits::from(&user));
            live.users.insert(user.id, user);
            summary.updated += 1;
        }

        for user in diff.updated {
            self.limiter.set_limits(user.id, UserLimits::from(&user));
            live.users.insert(user.id, user);
            summary.updated += 1;
        }

        for user in diff.added {
            if let Some(h) = handler {
                if let Err(e) = self.engine.add_user(h, &user).await {
                    log::warn!(node_id = node_id, user_id = user.id, error = %e, "Failed to add user");
                    summary.failed += 1;
                    continue;
                }
            }
            self.limiter.set_limits(user.id, UserLimits::from(&user));
            live.users.insert(user.id, user);
            summary.added += 1;
        }

        summary
    }

    /// Drain this node's counters and report them with the node status.
    ///
    /// A failed traffic report loses that interval: the counters were
    /// already drained and the next report only carries new bytes.
    pub async fn report_traffic(&self) -> Result<()> {
        let node_id = self.id();
        let report = self.traffic.drain(node_id);
        let status = self.status();

        let events = std::mem::take(&mut *lock(&self.audit_events));
        if !events.is_empty() {
            if let Err(e) = self.panel.report_audit_events(node_id, &events).await {
                log::warn!(node_id = node_id, events = events.len(), error = %e, "Failed to report audit events");
            }
        }

        if let Err(e) = self.panel.report_node_status(node_id, &status).await {
            log::warn!(node_id = node_id, error = %e, "Failed to report node status");
        }

        if report.is_empty() {
            return Ok(());
        }

        let users = report.len();
        let upload: u64 = report.values().map(|d| d.upload).sum();
        let download: u64 = report.values().map(|d| d.download).sum();
        if let Err(e) = self.panel.report_user_traffic(node_id, &report).await {
            log::warn!(
                node_id = node_id,
                users = users,
                upload = %format_bytes(upload),
                download = %format_bytes(download),
                error = %e,
                "Traffic report failed, interval dropped"
            );
            return Err(e);
        }
        log::info!(
            node_id = node_id,
            users = users,
            upload = %format_bytes(upload),
            download = %format_bytes(download),
            "Traffic reported"
        );
        Ok(())
    }

    /// Status snapshot sent with each traffic report
    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            hostname: self.hostname.clone(),
            online_users: self.limiter.online_users(),
            registered_users: self.registered.load(Ordering::Relaxed),
            listener_up: self.listener_up.load(Ordering::Relaxed),
            uptime_secs: lock(&self.started_at).elapsed().as_secs(),
        }
    }

    /// Drop idle limiter buckets and expired bans
    pub fn sweep(&self) {
        let evicted = self.limiter.evict_idle();
        let now = Instant::now();
        let before = self.bans.len();
        self.bans.retain(|_, until| *until > now);
        let expired = before.saturating_sub(self.bans.len());
        if evicted > 0 || expired > 0 {
            log::debug!(node_id = self.id(), evicted = evicted, bans_expired = expired, "Sweep finished");
        }
    }

    fn is_banned_at(&self, user_id: UserId, now: Instant) -> bool {
        self.bans.get(&user_id).is_some_and(|until| *until > now)
    }

    /// Whether the user is currently banned by an audit block
    pub fn is_banned(&self, user_id: UserId) -> bool {
        self.is_banned_at(user_id, Instant::now())
    }

    /// Admit a new connection: audit rules first, then the limiter.
    /// Without a source address only the device cap applies.
    pub async fn on_connection(
        &self,
        user_id: UserId,
        conn_id: ConnectionId,
        target: &Target,
        protocol: &str,
    ) -> std::result::Result<(), Denied> {
        self.admit(user_id, conn_id, None, target, protocol).await
    }

    /// Admit a new connection from `peer`, also applying the user's IP cap
    pub async fn on_connection_from(
        &self,
        user_id: UserId,
        conn_id: ConnectionId,
        peer: IpAddr,
        target: &Target,
        protocol: &str,
    ) -> std::result::Result<(), Denied> {
        self.admit(user_id, conn_id, Some(peer), target, protocol).await
    }

    async fn admit(
        &self,
        user_id: UserId,
        conn_id: ConnectionId,
        peer: Option<IpAddr>,
        target: &Target,
        protocol: &str,
    ) -> std::result::Result<(), Denied> {
        let node_id = self.id();
        if self.state() != LifecycleState::Running {
            return Err(Denied::NodeStopped);
        }
        if self.is_banned(user_id) {
            log::denied(node_id, user_id, Denied::Blocked);
            return Err(Denied::Blocked);
        }

        let matcher = self.audit.load_full();
        if let Some(rule) = matcher.find(target, protocol) {
            let action = rule.action();
            if action != AuditAction::Allow {
                let target_text = target.to_string();
                log::audit(node_id, user_id, &target_text, action, rule.text());
                self.push_audit_event(AuditEvent {
                    user_id,
                    target: target_text,
                    protocol: protocol.to_string(),
                    action,
                    rule: rule.text().to_string(),
                    timestamp: crate::core::model::unix_now(),
                });
            }
            if action == AuditAction::Block {
                self.ban_user(user_id).await;
                log::denied(node_id, user_id, Denied::Blocked);
                return Err(Denied::Blocked);
            }
        }

        let admitted = match peer {
            Some(ip) => self.limiter.allow_from(user_id, conn_id, ip),
            None => self.limiter.allow(user_id, conn_id),
        };
        admitted.inspect_err(|reason| {
            log::denied(node_id, user_id, *reason);
        })
    }

    /// Release a connection admitted by `on_connection`
    pub fn on_disconnect(&self, user_id: UserId, conn_id: ConnectionId) {
        self.limiter.release(user_id, conn_id);
    }

    fn push_audit_event(&self, event: AuditEvent) {
        let mut events = lock(&self.audit_events);
        if events.len() >= MAX_PENDING_AUDIT_EVENTS {
            events.remove(0);
        }
        events.push(event);
    }

    /// Remove a user from the engine and limiter for `ban_duration`
    pub async fn ban_user(&self, user_id: UserId) {
        let node_id = self.id();
        self.bans
            .insert(user_id, Instant::now() + self.config.ban_duration);
        self.limiter.remove_user(user_id);

        let mut live = self.live.lock().await;
        if live.users.contains_key(&user_id) {
            match live.handler {
                Some(handler) => match self.engine.remove_user(handler, user_id).await {
                    Ok(()) => {
                        live.users.remove(&user_id);
                    }
                    Err(e) => {
                        // Still banned; user sync retries the removal
                        log::warn!(node_id = node_id, user_id = user_id, error = %e, "Failed to remove banned user");
                    }
                },
                None => {
                    live.users.remove(&user_id);
                }
            }
            self.publish(&live);
        }

        log::info!(
            node_id = node_id,
            user_id = user_id,
            duration_secs = self.config.ban_duration.as_secs(),
            "User banned"
        );
    }
}
