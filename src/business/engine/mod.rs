//! In-process proxy engine registry
//!
//! `RegistryEngine` is the bundled `ProxyEngine`: the node controller
//! registers inbounds and users with it, and a data plane embedding it
//! authenticates clients, tracks connections and feeds traffic back.

mod connection;

pub use connection::ConnectionManager;

use async_trait::async_trait;
use dashmap::DashMap;
use rustls::ServerConfig;
use sha2::{Digest, Sha224};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;

use super::cert::build_server_config;
use crate::core::{
    ConnectionId, HandlerId, NodeId, NodeParams, ProxyEngine, TlsMaterial, TrafficCallback,
    UserEntry, UserId,
};
use crate::error::{ControllerError, Result};
use crate::logger::log;

/// Credential hash as carried in Trojan-style handshakes
pub type CredentialHex = [u8; 56];

/// Hash password using SHA224
fn hash_password(password: &str) -> [u8; 28] {
    let mut hasher = Sha224::new();
    hasher.update(password.as_bytes());
    let result = hasher.finalize();
    let mut hash = [0u8; 28];
    hash.copy_from_slice(&result);
    hash
}

/// Convert password to hex (56 bytes)
pub fn password_to_hex(password: &str) -> CredentialHex {
    let hash = hash_password(password);
    let hex_string = hex::encode(hash);
    let mut hex_bytes: CredentialHex = [0u8; 56];
    hex_bytes.copy_from_slice(hex_string.as_bytes());
    hex_bytes
}

/// One registered inbound
struct Inbound {
    node_id: NodeId,
    params: NodeParams,
    tls: Option<Arc<ServerConfig>>,
    /// credential hex -> user
    users: DashMap<CredentialHex, UserId>,
    /// user -> credential hex
    credentials: DashMap<UserId, CredentialHex>,
}

impl Inbound {
    fn remove_user(&self, user_id: UserId) -> bool {
        match self.credentials.remove(&user_id) {
            Some((_, hex)) => {
                self.users.remove_if(&hex, |_, id| *id == user_id);
                true
            }
            None => false,
        }
    }
}

/// Handler registry shared between the controller and a data plane
pub struct RegistryEngine {
    next_handler: AtomicU64,
    inbounds: DashMap<HandlerId, Arc<Inbound>>,
    connections: ConnectionManager,
    subscribers: RwLock<Vec<TrafficCallback>>,
}

impl Default for RegistryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryEngine {
    pub fn new() -> Self {
        Self {
            next_handler: AtomicU64::new(1),
            inbounds: DashMap::new(),
            connections: ConnectionManager::new(),
            subscribers: RwLock::new(Vec::new()),
        }
    }

    fn inbound(&self, handler: HandlerId) -> Result<Arc<Inbound>> {
        self.inbounds
            .get(&handler)
            .map(|i| Arc::clone(i.value()))
            .ok_or_else(|| ControllerError::Engine(format!("unknown handler {}", handler)))
    }

    /// Params an inbound was registered with
    pub fn params(&self, handler: HandlerId) -> Option<NodeParams> {
        self.inbounds.get(&handler).map(|i| i.params.clone())
    }

    /// rustls config for a TLS inbound
    pub fn tls_config(&self, handler: HandlerId) -> Option<Arc<ServerConfig>> {
        self.inbounds.get(&handler).and_then(|i| i.tls.clone())
    }

    /// Handler currently serving a node
    pub fn handler_for_node(&self, node_id: NodeId) -> Option<HandlerId> {
        self.inbounds
            .iter()
            .find(|i| i.node_id == node_id)
            .map(|i| *i.key())
    }

    pub fn handler_count(&self) -> usize {
        self.inbounds.len()
    }

    pub fn user_count(&self, handler: HandlerId) -> usize {
        self.inbounds
            .get(&handler)
            .map(|i| i.credentials.len())
            .unwrap_or(0)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.connection_count()
    }

    /// Look up the user owning a credential hash
    pub fn authenticate(&self, handler: HandlerId, credential: &CredentialHex) -> Option<UserId> {
        let inbound = self.inbounds.get(&handler)?;
        let user = inbound.users.get(credential).map(|u| *u);
        user
    }

    /// Look up the user owning a plain credential
    pub fn authenticate_password(&self, handler: HandlerId, password: &str) -> Option<UserId> {
        self.authenticate(handler, &password_to_hex(password))
    }

    /// Track a new connection of an authorized user.
    ///
    /// The token is cancelled when the user is removed or the inbound torn
    /// down; the data plane must call `close_connection` afterwards.
    pub fn open_connection(
        &self,
        handler: HandlerId,
        user_id: UserId,
        peer_addr: String,
    ) -> Result<(ConnectionId, CancellationToken)> {
        let inbound = self.inbound(handler)?;
        if !inbound.credentials.contains_key(&user_id) {
            return Err(ControllerError::Engine(format!(
                "user {} not authorized on handler {}",
                user_id, handler
            )));
        }
        Ok(self.connections.register(handler, user_id, peer_addr))
    }

    pub fn close_connection(&self, conn_id: ConnectionId) {
        self.connections.unregister(conn_id);
    }

    /// Report bytes moved by a connection to every subscriber
    pub fn record_traffic(&self, conn_id: ConnectionId, upload: u64, download: u64) {
        let Some((handler, user_id)) = self.connections.owner(conn_id) else {
            return;
        };
        let Some(node_id) = self.inbounds.get(&handler).map(|i| i.node_id) else {
            return;
        };
        let subscribers = self.subscribers.read().unwrap_or_else(|e| e.into_inner());
        for callback in subscribers.iter() {
            callback(user_id, node_id, upload, download);
        }
    }
}

#[async_trait]
impl ProxyEngine for RegistryEngine {
    async fn register_inbound(
        &self,
        node_id: NodeId,
        params: &NodeParams,
        tls: Option<&TlsMaterial>,
    ) -> Result<HandlerId> {
        let tls = match (params.tls, tls) {
            (true, Some(material)) => Some(build_server_config(material)?),
            (true, None) => {
                return Err(ControllerError::Engine(format!(
                    "node {} requires TLS but no certificate was provided",
                    node_id
                )))
            }
            (false, _) => None,
        };

        let conflict = self.inbounds.iter().any(|i| {
            i.node_id != node_id && i.params.port == params.port && i.params.listen_ip == params.listen_ip
        });
        if conflict {
            return Err(ControllerError::Engine(format!(
                "{}:{} already in use",
                params.listen_ip, params.port
            )));
        }

        let handler = self.next_handler.fetch_add(1, Ordering::Relaxed);
        self.inbounds.insert(
            handler,
            Arc::new(Inbound {
                node_id,
                params: params.clone(),
                tls,
                users: DashMap::new(),
                credentials: DashMap::new(),
            }),
        );
        log::info!(
            node_id = node_id,
            handler = handler,
            listen = %format!("{}:{}", params.listen_ip, params.port),
            protocol = %params.protocol,
            "Inbound registered"
        );
        Ok(handler)
    }

    async fn deregister_inbound(&self, handler: HandlerId) -> Result<()> {
        match self.inbounds.remove(&handler) {
            Some((_, inbound)) => {
                let kicked = self.connections.kick_handler(handler);
                log::info!(
                    node_id = inbound.node_id,
                    handler = handler,
                    kicked = kicked,
                    "Inbound deregistered"
                );
            }
            None => {
                log::debug!(handler = handler, "Deregister of unknown handler ignored");
            }
        }
        Ok(())
    }

    async fn add_user(&self, handler: HandlerId, user: &UserEntry) -> Result<()> {
        let inbound = self.inbound(handler)?;
        let hex = password_to_hex(&user.credential);

        if let Some(owner) = inbound.users.get(&hex).map(|u| *u) {
            if owner != user.id {
                return Err(ControllerError::Engine(format!(
                    "credential of user {} already used by user {}",
                    user.id, owner
                )));
            }
        }

        // A changed credential invalidates sessions opened with the old one
        if let Some(old) = inbound.credentials.get(&user.id).map(|c| *c) {
            if old != hex {
                inbound.remove_user(user.id);
                self.connections.kick_user(handler, user.id);
            }
        }

        inbound.users.insert(hex, user.id);
        inbound.credentials.insert(user.id, hex);
        Ok(())
    }

    async fn remove_user(&self, handler: HandlerId, user_id: UserId) -> Result<()> {
        let inbound = self.inbound(handler)?;
        if inbound.remove_user(user_id) {
            let kicked = self.connections.kick_user(handler, user_id);
            if kicked > 0 {
                log::info!(handler = handler, user_id = user_id, kicked = kicked, "User removed and kicked");
            }
        }
        Ok(())
    }

    fn subscribe_traffic_stats(&self, callback: TrafficCallback) {
        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(callback);
    }
}
