//! Panel-driven node controller
//!
//! Reads the node list from the config file, starts one sync engine per node
//! and hot-reloads when the file changes.

// Use mimalloc as the global allocator for better performance
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use panda_node::business::{ConfigWatcher, Controller, DirCertProvider, HttpPanelConnector, RegistryEngine};
use panda_node::config::{CliArgs, ControllerConfig};
use panda_node::core::{CertProvider, ProxyEngine};
use panda_node::logger::{self, log, resolve_log_level};

/// How long shutdown waits for the config watcher
const WATCHER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

async fn wait_for_signal() -> std::io::Result<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => Ok("SIGINT"),
            _ = sigterm.recv() => Ok("SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        Ok("Ctrl-C")
    }
}

async fn next_change(changes: &mut Option<mpsc::Receiver<()>>) -> Option<()> {
    match changes {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn reload(controller: &Controller, path: &Path, cert_dir: &Path) {
    let config = match ControllerConfig::load(path) {
        Ok(config) => config,
        Err(e) => {
            log::error!(error = %e, "Invalid config file, keeping running configuration");
            return;
        }
    };
    if config.cert_dir != cert_dir {
        log::warn!(
            cert_dir = %config.cert_dir.display(),
            "cert_dir changed, restart to apply"
        );
    }
    log::info!(nodes = config.nodes.len(), "Reloading configuration");
    if let Err(e) = controller.reload(config).await {
        log::error!(error = %e, "Reload failed");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Reqwest and rustls share the ring provider
    let _ = rustls::crypto::ring::default_provider().install_default();

    let cli = CliArgs::parse_args();
    cli.validate()?;

    let config = ControllerConfig::load(&cli.config_file)?;
    logger::init_logger(resolve_log_level(
        cli.log_mode.as_deref(),
        config.log.level.as_deref(),
    ));

    log::info!(
        config = %cli.config_file.display(),
        nodes = config.nodes.len(),
        "Starting node controller"
    );

    let engine = Arc::new(RegistryEngine::new());
    let certs = Arc::new(DirCertProvider::new(&config.cert_dir));
    let controller = Controller::new(
        engine as Arc<dyn ProxyEngine>,
        Some(certs as Arc<dyn CertProvider>),
        Arc::new(HttpPanelConnector),
    );
    controller.start(&config).await?;
    let cert_dir = config.cert_dir.clone();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (mut changes, watcher) = if cli.no_watch {
        (None, None)
    } else {
        let (rx, handle) = ConfigWatcher::new(&cli.config_file, cli.watch_interval)
            .await
            .spawn(shutdown_rx)?;
        (Some(rx), Some(handle))
    };

    let signal = wait_for_signal();
    tokio::pin!(signal);

    let result = loop {
        tokio::select! {
            res = &mut signal => {
                match res {
                    Ok(name) => {
                        log::info!("{} received, shutting down...", name);
                        break Ok(());
                    }
                    Err(e) => {
                        log::error!(error = %e, "Failed to listen for shutdown signals");
                        break Err(e.into());
                    }
                }
            }
            Some(()) = next_change(&mut changes) => {
                reload(&controller, &cli.config_file, &cert_dir).await;
            }
        }
    };

    shutdown_tx.send_replace(true);
    if let Some(handle) = watcher {
        if tokio::time::timeout(WATCHER_STOP_TIMEOUT, handle).await.is_err() {
            log::warn!("Config watcher shutdown timeout");
        }
    }

    controller.stop().await;
    log::info!("All nodes stopped");
    result
}
