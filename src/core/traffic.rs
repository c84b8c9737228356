//! Per-user traffic accounting
//!
//! Counters are partitioned per node, then per user, each user holding its
//! own atomics. Recording never takes a lock wider than one DashMap shard.
//! Only registered nodes accumulate; bytes for any other node are dropped.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::hooks::{NodeId, TrafficCallback, UserId};
use super::model::{TrafficDelta, TrafficReport};

#[derive(Debug, Default)]
struct UserCounters {
    upload: AtomicU64,
    download: AtomicU64,
}

impl UserCounters {
    fn is_zero(&self) -> bool {
        self.upload.load(Ordering::Relaxed) == 0 && self.download.load(Ordering::Relaxed) == 0
    }
}

type NodeCounters = DashMap<UserId, UserCounters>;

/// Traffic aggregator shared by every node controller
#[derive(Debug, Default)]
pub struct TrafficAggregator {
    nodes: DashMap<NodeId, Arc<NodeCounters>>,
}

impl TrafficAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start accumulating for a node. Re-registering keeps pending counters.
    pub fn register_node(&self, node_id: NodeId) {
        self.nodes.entry(node_id).or_default();
    }

    /// Whether `record` accepts bytes for this node
    pub fn is_registered(&self, node_id: NodeId) -> bool {
        self.nodes.contains_key(&node_id)
    }

    /// Add bytes for a user on a registered node
    pub fn record(&self, user_id: UserId, node_id: NodeId, upload: u64, download: u64) {
        if upload == 0 && download == 0 {
            return;
        }
        let Some(node) = self.nodes.get(&node_id).map(|n| Arc::clone(n.value())) else {
            return;
        };
        let counters = node.entry(user_id).or_default();
        if upload > 0 {
            counters.upload.fetch_add(upload, Ordering::Relaxed);
        }
        if download > 0 {
            counters.download.fetch_add(download, Ordering::Relaxed);
        }
    }

    /// Read and zero every counter of a node.
    ///
    /// Each counter is swapped to zero, so a concurrent `record` lands either
    /// in this drain or in the next one.
    pub fn drain(&self, node_id: NodeId) -> TrafficReport {
        let Some(node) = self.nodes.get(&node_id).map(|n| Arc::clone(n.value())) else {
            return TrafficReport::new();
        };

        let mut report = TrafficReport::with_capacity(node.len());
        for entry in node.iter() {
            let delta = TrafficDelta {
                upload: entry.upload.swap(0, Ordering::AcqRel),
                download: entry.download.swap(0, Ordering::AcqRel),
            };
            if !delta.is_zero() {
                report.insert(*entry.key(), delta);
            }
        }

        // Drop zeroed entries; retain holds the shard lock so a racing
        // record either re-creates the entry or is seen as non-zero here
        node.retain(|_, counters| !counters.is_zero());

        report
    }

    /// Peek at a user's counters without clearing them
    pub fn get(&self, node_id: NodeId, user_id: UserId) -> Option<TrafficDelta> {
        let node = self.nodes.get(&node_id)?;
        let counters = node.get(&user_id)?;
        Some(TrafficDelta {
            upload: counters.upload.load(Ordering::Relaxed),
            download: counters.download.load(Ordering::Relaxed),
        })
    }

    /// Forget a node's counters and stop accepting its bytes
    pub fn remove_node(&self, node_id: NodeId) {
        self.nodes.remove(&node_id);
    }

    /// Users with pending traffic on a node
    pub fn user_count(&self, node_id: NodeId) -> usize {
        self.nodes.get(&node_id).map(|n| n.len()).unwrap_or(0)
    }

    /// Callback suitable for `ProxyEngine::subscribe_traffic_stats`
    pub fn callback(self: &Arc<Self>) -> TrafficCallback {
        let aggregator = Arc::clone(self);
        Arc::new(move |user_id, node_id, upload, download| {
            aggregator.record(user_id, node_id, upload, download)
        })
    }
}
