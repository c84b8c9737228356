//! Configuration for the node controller
//!
//! CLI arguments (with `X_PANDA_NODE_` environment fallbacks) point at a TOML
//! file describing the managed nodes. The file is re-read on hot reload.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use serde::{Deserialize, Deserializer};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::{CertMethod, NodeId};

/// Parse duration string (e.g., "60s", "2m", "1h") or plain seconds
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    if let Ok(d) = humantime::parse_duration(s) {
        return Ok(d);
    }
    s.trim().parse::<u64>().map(Duration::from_secs).map_err(|_| {
        format!(
            "Invalid duration '{}'. Use formats like '60s', '2m', '1h' or plain seconds",
            s
        )
    })
}

fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Secs(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
        Raw::Text(text) => parse_duration(&text).map_err(serde::de::Error::custom),
    }
}

/// Default config file location
pub const DEFAULT_CONFIG_FILE: &str = "/etc/panda-node/config.toml";

/// Default directory where an external ACME client keeps issued certificates
pub const DEFAULT_CERT_DIR: &str = "/etc/panda-node/certs";

/// CLI arguments
///
/// Supports environment variables with X_PANDA_NODE_ prefix
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Panel-driven node controller for proxy listeners")]
#[command(rename_all = "snake_case")]
pub struct CliArgs {
    /// TOML config file describing the managed nodes
    #[arg(
        short = 'c',
        long = "config_file",
        env = "X_PANDA_NODE_CONFIG_FILE",
        default_value = DEFAULT_CONFIG_FILE
    )]
    pub config_file: PathBuf,

    /// Log mode: trace, debug, info, warn, error (overrides [log] level)
    #[arg(long = "log_mode", env = "X_PANDA_NODE_LOG_MODE")]
    pub log_mode: Option<String>,

    /// Debounce window for config file change events (e.g. "2s")
    #[arg(long = "watch_interval", env = "X_PANDA_NODE_WATCH_INTERVAL", default_value = "2s", value_parser = parse_duration)]
    pub watch_interval: Duration,

    /// Disable hot reload on config file change
    #[arg(long = "no_watch", env = "X_PANDA_NODE_NO_WATCH", default_value_t = false)]
    pub no_watch: bool,
}

impl CliArgs {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    pub fn validate(&self) -> Result<()> {
        if !self.config_file.exists() {
            return Err(anyhow!(
                "Config file not found: {}",
                self.config_file.display()
            ));
        }
        if !self.no_watch && self.watch_interval.is_zero() {
            return Err(anyhow!("watch_interval must be greater than 0"));
        }
        Ok(())
    }
}

fn default_protocol() -> String {
    "trojan".to_string()
}

fn default_node_sync_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_user_sync_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_traffic_report_interval() -> Duration {
    Duration::from_secs(100)
}

fn default_api_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_backoff() -> Duration {
    Duration::from_secs(1)
}

fn default_device_idle_grace() -> Duration {
    Duration::from_secs(60)
}

fn default_ban_duration() -> Duration {
    Duration::from_secs(600)
}

fn default_renew_interval() -> Duration {
    Duration::from_secs(24 * 3600)
}

fn default_cert_dir() -> PathBuf {
    PathBuf::from(DEFAULT_CERT_DIR)
}

/// `[log]` section
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogSection {
    pub level: Option<String>,
}

/// `[nodes.cert]` section
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct CertConfig {
    #[serde(default)]
    pub mode: CertMethod,
    /// Overrides the panel's server name
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub cert_file: Option<PathBuf>,
    #[serde(default)]
    pub key_file: Option<PathBuf>,
    /// Re-obtain automated certificates this often when the issuer reports no expiry
    #[serde(default = "default_renew_interval", deserialize_with = "deserialize_duration")]
    pub renew_interval: Duration,
}

impl Default for CertConfig {
    fn default() -> Self {
        Self {
            mode: CertMethod::None,
            domain: None,
            cert_file: None,
            key_file: None,
            renew_interval: default_renew_interval(),
        }
    }
}

/// One managed node (`[[nodes]]`)
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct NodeConfig {
    /// Node ID from the panel
    pub id: NodeId,
    /// Panel base URL
    pub api: String,
    /// Panel API token
    pub token: String,
    /// Protocol tag sent to the panel
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default = "default_node_sync_interval", deserialize_with = "deserialize_duration")]
    pub node_sync_interval: Duration,
    #[serde(default = "default_user_sync_interval", deserialize_with = "deserialize_duration")]
    pub user_sync_interval: Duration,
    #[serde(default = "default_traffic_report_interval", deserialize_with = "deserialize_duration")]
    pub traffic_report_interval: Duration,
    /// Panel request timeout
    #[serde(default = "default_api_timeout", deserialize_with = "deserialize_duration")]
    pub api_timeout: Duration,
    /// Attempts per fetch within one tick
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// First retry delay, doubled on each attempt
    #[serde(default = "default_retry_backoff", deserialize_with = "deserialize_duration")]
    pub retry_backoff: Duration,
    /// Idle limiter buckets are dropped after this long
    #[serde(default = "default_device_idle_grace", deserialize_with = "deserialize_duration")]
    pub device_idle_grace: Duration,
    /// How long an audit block keeps the user off this node
    #[serde(default = "default_ban_duration", deserialize_with = "deserialize_duration")]
    pub ban_duration: Duration,
    /// YAML file with local audit rules
    #[serde(default)]
    pub audit_file: Option<PathBuf>,
    #[serde(default)]
    pub cert: CertConfig,
}

impl NodeConfig {
    /// Minimal config with defaults, mostly for tests and embedding
    pub fn new(id: NodeId, api: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            id,
            api: api.into(),
            token: token.into(),
            protocol: default_protocol(),
            node_sync_interval: default_node_sync_interval(),
            user_sync_interval: default_user_sync_interval(),
            traffic_report_interval: default_traffic_report_interval(),
            api_timeout: default_api_timeout(),
            retry_attempts: default_retry_attempts(),
            retry_backoff: default_retry_backoff(),
            device_idle_grace: default_device_idle_grace(),
            ban_duration: default_ban_duration(),
            audit_file: None,
            cert: CertConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.id == 0 {
            return Err(anyhow!("Node ID must be a positive integer"));
        }
        if self.api.trim().is_empty() {
            return Err(anyhow!("node {}: api is required", self.id));
        }
        for (name, value) in [
            ("node_sync_interval", self.node_sync_interval),
            ("user_sync_interval", self.user_sync_interval),
            ("traffic_report_interval", self.traffic_report_interval),
            ("api_timeout", self.api_timeout),
        ] {
            if value.is_zero() {
                return Err(anyhow!("node {}: {} must be greater than 0", self.id, name));
            }
        }
        if self.retry_attempts == 0 {
            return Err(anyhow!("node {}: retry_attempts must be at least 1", self.id));
        }
        if self.cert.mode == CertMethod::File
            && (self.cert.cert_file.is_none() || self.cert.key_file.is_none())
        {
            return Err(anyhow!(
                "node {}: cert mode 'file' requires cert_file and key_file",
                self.id
            ));
        }
        Ok(())
    }
}

/// Whole config file
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ControllerConfig {
    #[serde(default)]
    pub log: LogSection,
    /// Directory with `<domain>.crt` / `<domain>.key` for automated cert modes
    #[serde(default = "default_cert_dir")]
    pub cert_dir: PathBuf,
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
}

impl ControllerConfig {
    /// Parse and validate TOML content
    pub fn parse(content: &str) -> Result<Self> {
        let config: ControllerConfig = toml::from_str(content).context("TOML parse error")?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a config file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(anyhow!("At least one [[nodes]] entry is required"));
        }
        let mut seen = HashSet::new();
        for node in &self.nodes {
            node.validate()?;
            if !seen.insert(node.id) {
                return Err(anyhow!("Duplicate node id {}", node.id));
            }
        }
        Ok(())
    }
}
