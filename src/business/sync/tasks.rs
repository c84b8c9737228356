//! Periodic tasks of a running node

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use super::NodeController;
use crate::core::NodeId;
use crate::logger::log;

/// How long `shutdown` waits for each task
const TASK_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Format bytes into human-readable string (KB, MB, GB)
pub(crate) fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2}GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2}MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2}KB", bytes as f64 / KB as f64)
    } else {
        format!("{}B", bytes)
    }
}

/// Handle for the spawned sync tasks
pub(crate) struct SyncTasksHandle {
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl SyncTasksHandle {
    /// Wait for every task to observe the stop signal
    pub(crate) async fn join(self, node_id: NodeId) {
        for (name, handle) in self.handles {
            match tokio::time::timeout(TASK_STOP_TIMEOUT, handle).await {
                Ok(Ok(())) => {
                    log::debug!(node_id = node_id, task = name, "Sync task stopped");
                }
                Ok(Err(e)) => {
                    log::warn!(node_id = node_id, task = name, error = %e, "Sync task panicked");
                }
                Err(_) => {
                    log::warn!(node_id = node_id, task = name, "Sync task shutdown timeout");
                }
            }
        }
    }
}

/// Spawn node sync, user sync and traffic report.
///
/// The first tick of each task fires one period after start; the initial
/// sync runs inline in `NodeController::start`. Tasks exit as soon as the
/// stop signal is set, including when it was set before they were spawned.
pub(crate) fn spawn(node: &Arc<NodeController>) -> SyncTasksHandle {
    let config = node.config();
    let handles = vec![
        (
            "node_sync",
            spawn_periodic(node, config.node_sync_interval, |n| async move {
                if let Err(e) = n.sync_node().await {
                    log::warn!(node_id = n.id(), error = %e, "Node sync failed");
                }
            }),
        ),
        (
            "user_sync",
            spawn_periodic(node, config.user_sync_interval, |n| async move {
                if let Err(e) = n.sync_users().await {
                    log::warn!(node_id = n.id(), error = %e, "User sync failed");
                }
            }),
        ),
        ("traffic_report", spawn_traffic_task(node, config.traffic_report_interval)),
    ];
    SyncTasksHandle { handles }
}

/// Resolves once the stop signal is set or its sender is gone
async fn stopped(shutdown_rx: &mut watch::Receiver<bool>) {
    let _ = shutdown_rx.wait_for(|stop| *stop).await;
}

fn spawn_periodic<F, Fut>(node: &Arc<NodeController>, period: Duration, tick: F) -> JoinHandle<()>
where
    F: Fn(Arc<NodeController>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    let node = Arc::clone(node);
    let mut shutdown_rx: watch::Receiver<bool> = node.shutdown_signal();

    tokio::spawn(async move {
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    tick(Arc::clone(&node)).await;
                }
                _ = stopped(&mut shutdown_rx) => {
                    break;
                }
            }
        }
    })
}

fn spawn_traffic_task(node: &Arc<NodeController>, period: Duration) -> JoinHandle<()> {
    let node = Arc::clone(node);
    let mut shutdown_rx = node.shutdown_signal();

    tokio::spawn(async move {
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    // Failures are logged inside and never retried
                    let _ = node.report_traffic().await;
                    node.sweep();
                }
                _ = stopped(&mut shutdown_rx) => {
                    log::debug!(node_id = node.id(), "Traffic task shutting down");
                    // Final report before shutdown
                    let _ = node.report_traffic().await;
                    break;
                }
            }
        }
    })
}
