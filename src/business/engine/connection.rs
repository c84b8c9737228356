//! Live connections of the registry engine
//!
//! Tracks which handler and user every connection belongs to so that user
//! removal and inbound teardown can kick them.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core::{ConnectionId, HandlerId, UserId};

type UserKey = (HandlerId, UserId);

#[derive(Debug, Clone)]
struct ConnectionInfo {
    handler: HandlerId,
    user_id: UserId,
    #[allow(dead_code)]
    peer_addr: String,
    #[allow(dead_code)]
    connected_at: Instant,
}

#[derive(Debug)]
struct ActiveConnection {
    info: ConnectionInfo,
    cancel_token: CancellationToken,
}

/// Active connections with kick-off capability
#[derive(Debug, Clone)]
pub struct ConnectionManager {
    next_conn_id: Arc<AtomicU64>,
    connections: Arc<DashMap<ConnectionId, ActiveConnection>>,
    /// (handler, user) -> connection ids, for quick kick lookup
    user_connections: Arc<DashMap<UserKey, Vec<ConnectionId>>>,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            next_conn_id: Arc::new(AtomicU64::new(1)),
            connections: Arc::new(DashMap::new()),
            user_connections: Arc::new(DashMap::new()),
        }
    }

    /// Register a new connection and return its ID and cancellation token
    pub fn register(
        &self,
        handler: HandlerId,
        user_id: UserId,
        peer_addr: String,
    ) -> (ConnectionId, CancellationToken) {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let cancel_token = CancellationToken::new();

        let conn = ActiveConnection {
            info: ConnectionInfo {
                handler,
                user_id,
                peer_addr,
                connected_at: Instant::now(),
            },
            cancel_token: cancel_token.clone(),
        };

        self.connections.insert(conn_id, conn);
        self.user_connections
            .entry((handler, user_id))
            .or_default()
            .push(conn_id);

        (conn_id, cancel_token)
    }

    /// Owner of a connection
    pub fn owner(&self, conn_id: ConnectionId) -> Option<(HandlerId, UserId)> {
        self.connections
            .get(&conn_id)
            .map(|c| (c.info.handler, c.info.user_id))
    }

    /// Unregister a connection
    pub fn unregister(&self, conn_id: ConnectionId) {
        if let Some((_, conn)) = self.connections.remove(&conn_id) {
            let key = (conn.info.handler, conn.info.user_id);
            // remove_if_mut holds the shard lock for the whole check, so a
            // concurrent register() can't push into the Vec in between
            self.user_connections.remove_if_mut(&key, |_, conn_ids| {
                conn_ids.retain(|&id| id != conn_id);
                conn_ids.is_empty()
            });
        }
    }

    /// Cancel every connection of a user on one handler
    pub fn kick_user(&self, handler: HandlerId, user_id: UserId) -> usize {
        let mut kicked = 0;
        if let Some(conn_ids) = self.user_connections.get(&(handler, user_id)) {
            for &conn_id in conn_ids.iter() {
                if let Some(conn) = self.connections.get(&conn_id) {
                    conn.cancel_token.cancel();
                    kicked += 1;
                }
            }
        }
        kicked
    }

    /// Cancel every connection on a handler
    pub fn kick_handler(&self, handler: HandlerId) -> usize {
        let mut kicked = 0;
        for conn in self.connections.iter() {
            if conn.info.handler == handler {
                conn.cancel_token.cancel();
                kicked += 1;
            }
        }
        kicked
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Number of (handler, user) pairs with active connections
    pub fn user_count(&self) -> usize {
        self.user_connections.len()
    }
}
