//! Collaborator traits
//!
//! The controller never talks to a panel, a proxy engine or a certificate
//! issuer directly. Each node controller is handed capability objects
//! implementing these traits.

use async_trait::async_trait;
use std::sync::Arc;

use super::model::{
    AuditEvent, CertMethod, NodeParams, NodeStatus, TlsMaterial, TrafficReport, UserEntry,
};
use crate::error::Result;

/// User ID type used throughout the system.
/// Unique within a node, not globally.
pub type UserId = i64;

/// Panel node identifier
pub type NodeId = u32;

/// Identifier of one live connection, assigned by the proxy engine
pub type ConnectionId = u64;

/// Identifier of an inbound handler registered with the proxy engine
pub type HandlerId = u64;

/// Traffic stats callback: (user, node, upload, download)
pub type TrafficCallback = Arc<dyn Fn(UserId, NodeId, u64, u64) + Send + Sync>;

/// Remote panel data interface
///
/// Any error is treated uniformly as "sync failed, retry later".
#[async_trait]
pub trait PanelApi: Send + Sync {
    /// Fetch node parameters
    async fn fetch_node_info(&self, node_id: NodeId) -> Result<NodeParams>;

    /// Fetch the authoritative user list
    async fn fetch_user_list(&self, node_id: NodeId) -> Result<Vec<UserEntry>>;

    /// Report per-user traffic for one interval
    async fn report_user_traffic(&self, node_id: NodeId, traffic: &TrafficReport) -> Result<()>;

    /// Report node status (online users etc.)
    async fn report_node_status(&self, node_id: NodeId, status: &NodeStatus) -> Result<()>;

    /// Report audit rule hits. Panels without an audit endpoint ignore them.
    async fn report_audit_events(&self, _node_id: NodeId, _events: &[AuditEvent]) -> Result<()> {
        Ok(())
    }
}

/// Proxy engine registration interface
#[async_trait]
pub trait ProxyEngine: Send + Sync {
    /// Register an inbound listener for a node
    async fn register_inbound(
        &self,
        node_id: NodeId,
        params: &NodeParams,
        tls: Option<&TlsMaterial>,
    ) -> Result<HandlerId>;

    /// Tear down an inbound listener and every connection on it
    async fn deregister_inbound(&self, handler: HandlerId) -> Result<()>;

    /// Authorize a user on a handler
    async fn add_user(&self, handler: HandlerId, user: &UserEntry) -> Result<()>;

    /// Revoke a user on a handler, dropping their connections
    async fn remove_user(&self, handler: HandlerId, user_id: UserId) -> Result<()>;

    /// Receive per-connection byte counts
    fn subscribe_traffic_stats(&self, callback: TrafficCallback);
}

/// Certificate acquisition interface
#[async_trait]
pub trait CertProvider: Send + Sync {
    /// Obtain a currently valid certificate for `domain`
    async fn obtain_certificate(&self, domain: &str, method: CertMethod) -> Result<TlsMaterial>;
}
