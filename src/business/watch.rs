//! Config file watcher
//!
//! Filesystem events on the config file are debounced with
//! `notify-debouncer-mini`. A change is a new SHA-224 digest of the contents,
//! so events that leave the file as it was are dropped.

use notify::RecursiveMode;
use notify_debouncer_mini::{new_debouncer, DebounceEventResult};
use sha2::{Digest, Sha224};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::{ControllerError, Result};
use crate::logger::log;

type Digest224 = [u8; 28];

async fn digest(path: &Path) -> Result<Digest224> {
    let content = tokio::fs::read(path).await?;
    Ok(Sha224::digest(&content).into())
}

/// Detects content changes of one file
pub struct ConfigWatcher {
    path: PathBuf,
    debounce: Duration,
    last: Option<Digest224>,
}

impl ConfigWatcher {
    /// Watch `path`, taking its current contents as the baseline
    pub async fn new(path: impl Into<PathBuf>, debounce: Duration) -> Self {
        let path = path.into();
        let last = digest(&path).await.ok();
        Self {
            path,
            debounce,
            last,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the contents changed since the last call
    ///
    /// Always hashes the file. An unreadable file is an error and keeps the
    /// previous baseline, so restoring the same contents is not reported as
    /// a change.
    pub async fn check(&mut self) -> Result<bool> {
        let current = digest(&self.path).await?;
        let changed = self.last != Some(current);
        self.last = Some(current);
        Ok(changed)
    }

    /// Editors often replace the file by rename, so the parent directory is
    /// watched and events are filtered by file name.
    fn watch_target(&self) -> Result<(PathBuf, OsString)> {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .ok_or_else(|| {
                ControllerError::Config(format!("Not a file path: {}", self.path.display()))
            })?;
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        Ok((dir, name))
    }

    /// Watch until `shutdown` flips, sending one message per detected change
    pub fn spawn(
        mut self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(mpsc::Receiver<()>, JoinHandle<()>)> {
        let (dir, name) = self.watch_target()?;
        let (event_tx, mut events) = mpsc::unbounded_channel();

        let mut debouncer = new_debouncer(self.debounce, move |res: DebounceEventResult| {
            let _ = event_tx.send(res);
        })
        .map_err(|e| ControllerError::Config(format!("Failed to create file watcher: {}", e)))?;
        debouncer
            .watcher()
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| {
                ControllerError::Config(format!("Failed to watch {}: {}", dir.display(), e))
            })?;

        let (tx, rx) = mpsc::channel(1);
        let handle = tokio::spawn(async move {
            // Dropping the debouncer stops the OS watch
            let _debouncer = debouncer;

            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    res = events.recv() => {
                        let Some(res) = res else { break };
                        match res {
                            Ok(batch) => {
                                if !batch.iter().any(|e| e.path.file_name() == Some(name.as_os_str())) {
                                    continue;
                                }
                            }
                            Err(e) => {
                                log::warn!(path = %self.path.display(), error = %e, "Config watch error");
                                continue;
                            }
                        }
                        match self.check().await {
                            Ok(true) => {
                                log::info!(path = %self.path.display(), "Config file changed");
                                if tx.send(()).await.is_err() {
                                    break;
                                }
                            }
                            Ok(false) => {}
                            Err(e) => {
                                log::warn!(path = %self.path.display(), error = %e, "Failed to read config file");
                            }
                        }
                    }
                    res = shutdown.changed() => {
                        if res.is_err() {
                            break;
                        }
                    }
                }
            }
            log::debug!(path = %self.path.display(), "Config watcher stopped");
        });
        Ok((rx, handle))
    }
}
