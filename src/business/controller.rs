//! Controller: owns every node controller of the process
//!
//! Startup builds one `NodeController` per configured node. Hot reload is an
//! ordered stop of every node followed by a start from the new configuration;
//! if the new configuration cannot be started, the previous one is brought
//! back.

use std::sync::Arc;
use tokio::sync::Mutex;

use super::panel::HttpPanel;
use super::sync::{NodeController, NodeDeps};
use crate::config::{ControllerConfig, NodeConfig};
use crate::core::{load_audit_file, CertProvider, NodeId, PanelApi, ProxyEngine, TrafficAggregator};
use crate::error::{ControllerError, Result};
use crate::logger::log;

/// Builds the panel client of a node
pub trait PanelConnector: Send + Sync {
    fn connect(&self, config: &NodeConfig) -> Result<Arc<dyn PanelApi>>;
}

/// Connects every node to its panel over HTTP
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpPanelConnector;

impl PanelConnector for HttpPanelConnector {
    fn connect(&self, config: &NodeConfig) -> Result<Arc<dyn PanelApi>> {
        Ok(Arc::new(HttpPanel::new(config)?))
    }
}

#[derive(Default)]
struct Running {
    nodes: Vec<Arc<NodeController>>,
    config: Option<ControllerConfig>,
}

pub struct Controller {
    engine: Arc<dyn ProxyEngine>,
    certs: Option<Arc<dyn CertProvider>>,
    panels: Arc<dyn PanelConnector>,
    traffic: Arc<TrafficAggregator>,
    running: Mutex<Running>,
}

impl Controller {
    pub fn new(
        engine: Arc<dyn ProxyEngine>,
        certs: Option<Arc<dyn CertProvider>>,
        panels: Arc<dyn PanelConnector>,
    ) -> Self {
        let traffic = Arc::new(TrafficAggregator::new());
        engine.subscribe_traffic_stats(traffic.callback());
        Self {
            engine,
            certs,
            panels,
            traffic,
            running: Mutex::new(Running::default()),
        }
    }

    /// Shared traffic counters of all nodes
    pub fn traffic(&self) -> &Arc<TrafficAggregator> {
        &self.traffic
    }

    /// Start every node of `config`
    ///
    /// If one node fails to start, the ones already started are stopped again.
    pub async fn start(&self, config: &ControllerConfig) -> Result<()> {
        let mut running = self.running.lock().await;
        if !running.nodes.is_empty() {
            return Err(ControllerError::Other(
                "controller is already running".to_string(),
            ));
        }
        self.start_locked(&mut running, config).await
    }

    /// Stop every node
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        Self::stop_locked(&mut running).await;
        running.config = None;
    }

    /// Replace the running configuration
    ///
    /// Audit files of the new configuration are checked before anything is
    /// stopped; a configuration that fails this check leaves the running
    /// nodes untouched.
    pub async fn reload(&self, config: ControllerConfig) -> Result<()> {
        config.validate()?;
        for node in &config.nodes {
            if let Some(path) = &node.audit_file {
                load_audit_file(path).await?;
            }
        }

        let mut running = self.running.lock().await;
        let previous = running.config.take();
        Self::stop_locked(&mut running).await;

        match self.start_locked(&mut running, &config).await {
            Ok(()) => {
                log::info!(nodes = running.nodes.len(), "Configuration reloaded");
                Ok(())
            }
            Err(e) => {
                log::error!(error = %e, "Failed to start new configuration, restoring previous one");
                if let Some(previous) = previous {
                    if let Err(restore) = self.start_locked(&mut running, &previous).await {
                        log::error!(error = %restore, "Failed to restore previous configuration");
                    }
                }
                Err(e)
            }
        }
    }

    pub async fn node(&self, id: NodeId) -> Option<Arc<NodeController>> {
        let running = self.running.lock().await;
        running.nodes.iter().find(|n| n.id() == id).cloned()
    }

    /// IDs of the running nodes, in configuration order
    pub async fn node_ids(&self) -> Vec<NodeId> {
        let running = self.running.lock().await;
        running.nodes.iter().map(|n| n.id()).collect()
    }

    async fn start_locked(&self, running: &mut Running, config: &ControllerConfig) -> Result<()> {
        config.validate()?;

        let mut started: Vec<Arc<NodeController>> = Vec::with_capacity(config.nodes.len());
        for node_config in &config.nodes {
            let result = match self.panels.connect(node_config) {
                Ok(panel) => {
                    let deps = NodeDeps {
                        panel,
                        engine: Arc::clone(&self.engine),
                        certs: self.certs.clone(),
                        traffic: Arc::clone(&self.traffic),
                    };
                    let node = Arc::new(NodeController::new(node_config.clone(), deps));
                    node.start().await.map(|()| node)
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(node) => started.push(node),
                Err(e) => {
                    log::error!(node_id = node_config.id, error = %e, "Failed to start node");
                    for node in started.iter().rev() {
                        node.stop().await;
                    }
                    return Err(e);
                }
            }
        }

        running.nodes = started;
        running.config = Some(config.clone());
        Ok(())
    }

    async fn stop_locked(running: &mut Running) {
        let nodes = std::mem::take(&mut running.nodes);
        for node in nodes.iter().rev() {
            node.stop().await;
        }
    }
}
