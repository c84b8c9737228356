//! Data model shared between the sync engine and its collaborators

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha224};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use super::audit::AuditAction;
use super::hooks::{NodeId, UserId};

fn default_listen_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_true() -> bool {
    true
}

/// Node parameters as delivered by the panel.
///
/// Everything in here is part of the structural hash: any change, including
/// audit rules, triggers a full rebuild of the node's inbound.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeParams {
    pub node_id: NodeId,
    /// Protocol tag understood by the proxy engine (e.g. "trojan", "vmess")
    pub protocol: String,
    #[serde(default = "default_listen_ip")]
    pub listen_ip: String,
    pub port: u16,
    /// Whether the listener terminates TLS
    #[serde(default)]
    pub tls: bool,
    /// SNI / certificate domain
    #[serde(default)]
    pub server_name: Option<String>,
    /// Transport: tcp, ws, grpc ...
    #[serde(default)]
    pub network: Option<String>,
    /// Transport-specific settings (path, service name, headers ...)
    #[serde(default)]
    pub network_settings: BTreeMap<String, String>,
    /// Aggregate node speed limit in bytes/sec, 0 = unlimited
    #[serde(default)]
    pub speed_limit: u64,
    /// Audit rules pushed by the panel, appended after local rules
    #[serde(default)]
    pub rules: Vec<String>,
}

impl NodeParams {
    /// SHA-224 over the canonical JSON encoding, hex encoded
    pub fn structural_hash(&self) -> String {
        let encoded = serde_json::to_vec(self).unwrap_or_default();
        let mut hasher = Sha224::new();
        hasher.update(&encoded);
        hex::encode(hasher.finalize())
    }

    /// Domain to request a certificate for
    pub fn cert_domain(&self) -> Option<&str> {
        self.server_name.as_deref().filter(|s| !s.is_empty())
    }
}

/// One panel-managed account authorized on a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserEntry {
    pub id: UserId,
    /// Protocol-specific secret (uuid / password)
    #[serde(alias = "uuid", alias = "password")]
    pub credential: String,
    /// Bytes/sec, 0 = unlimited
    #[serde(default)]
    pub speed_limit: u64,
    /// Max concurrent connections, 0 = unlimited
    #[serde(default)]
    pub device_limit: u32,
    /// Max distinct source IPs, 0 = unlimited
    #[serde(default)]
    pub ip_limit: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl UserEntry {
    pub fn new(id: UserId, credential: impl Into<String>) -> Self {
        Self {
            id,
            credential: credential.into(),
            speed_limit: 0,
            device_limit: 0,
            ip_limit: 0,
            enabled: true,
        }
    }

    pub fn with_limits(mut self, speed_limit: u64, device_limit: u32) -> Self {
        self.speed_limit = speed_limit;
        self.device_limit = device_limit;
        self
    }

    pub fn with_ip_limit(mut self, ip_limit: u32) -> Self {
        self.ip_limit = ip_limit;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// How TLS material for a node is acquired
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CertMethod {
    /// No certificate configured
    #[default]
    None,
    /// Static certificate/key files
    File,
    /// Automated issuance, HTTP-01 challenge
    Http,
    /// Automated issuance, DNS-01 challenge
    Dns,
}

impl CertMethod {
    /// Whether material comes from the certificate collaborator
    pub fn is_automated(&self) -> bool {
        matches!(self, CertMethod::Http | CertMethod::Dns)
    }
}

impl fmt::Display for CertMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CertMethod::None => "none",
            CertMethod::File => "file",
            CertMethod::Http => "http",
            CertMethod::Dns => "dns",
        };
        f.write_str(s)
    }
}

/// PEM-encoded certificate chain and private key
#[derive(Clone, PartialEq, Eq)]
pub struct TlsMaterial {
    pub cert_pem: String,
    pub key_pem: String,
    /// Certificate expiry when the issuer reports it
    pub expires_at: Option<SystemTime>,
}

impl fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("cert_pem_len", &self.cert_pem.len())
            .field("key_pem", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Traffic delta for one user since the last report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TrafficDelta {
    pub upload: u64,
    pub download: u64,
}

impl TrafficDelta {
    pub fn is_zero(&self) -> bool {
        self.upload == 0 && self.download == 0
    }
}

/// Per-user traffic drained from the aggregator
pub type TrafficReport = HashMap<UserId, TrafficDelta>;

/// Node status reported alongside traffic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub hostname: String,
    /// Users with at least one active connection
    pub online_users: usize,
    /// Users currently registered on the listener
    pub registered_users: usize,
    /// Whether the listener is currently registered with the engine
    pub listener_up: bool,
    pub uptime_secs: u64,
}

/// One audit rule hit, buffered and reported to the panel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub user_id: UserId,
    pub target: String,
    pub protocol: String,
    pub action: AuditAction,
    pub rule: String,
    pub timestamp: u64,
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
