//! Business logic implementations
//!
//! - `sync`: per-node synchronization engine and admission control
//! - `controller`: owns all node controllers, hot reload
//! - `panel`: HTTP panel client
//! - `engine`: in-process handler registry for the data plane
//! - `cert`: certificate loading and renewal
//! - `watch`: config file watcher

pub mod cert;
pub mod controller;
pub mod engine;
pub mod panel;
pub mod sync;
pub mod watch;

#[cfg(test)]
pub(crate) mod testing;

pub use cert::{CertManager, DirCertProvider};
pub use controller::{Controller, HttpPanelConnector, PanelConnector};
pub use engine::{password_to_hex, RegistryEngine};
pub use panel::HttpPanel;
pub use sync::{LifecycleState, NodeController, NodeDeps, UserSyncSummary};
pub use watch::ConfigWatcher;
