//! Core controller building blocks
//!
//! This module contains the leaf components every node controller uses:
//! - Per-user speed/device limiting
//! - Traffic accounting
//! - Connection audit rules
//! - Collaborator traits and the shared data model

pub mod audit;
pub mod hooks;
pub mod limiter;
pub mod model;
pub mod traffic;

pub use audit::{load_audit_file, AuditAction, AuditMatcher, AuditRule, Host, Target};
pub use hooks::{
    CertProvider, ConnectionId, HandlerId, NodeId, PanelApi, ProxyEngine, TrafficCallback, UserId,
};
pub use limiter::{Denied, Limiter, UserLimits, DEFAULT_IDLE_GRACE};
pub use model::{
    AuditEvent, CertMethod, NodeParams, NodeStatus, TlsMaterial, TrafficDelta, TrafficReport,
    UserEntry,
};
pub use traffic::TrafficAggregator;
