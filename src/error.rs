use std::io;
use thiserror::Error;

/// Unified error type for the node controller
#[derive(Error, Debug)]
pub enum ControllerError {
    /// Panel unreachable or returned a bad response
    #[error("Fetch error: {0}")]
    Fetch(String),

    /// Proxy engine rejected a registration or user operation
    #[error("Engine error: {0}")]
    Engine(String),

    /// Certificate issuance or loading failed
    #[error("Certificate error: {0}")]
    Cert(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Node stop requested while the operation was in flight
    #[error("Operation cancelled: node stopping")]
    Cancelled,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Anything else
    #[error("{0}")]
    Other(String),
}

impl ControllerError {
    /// Whether this error only means "try again next tick"
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ControllerError::Fetch(_) | ControllerError::Engine(_) | ControllerError::Cert(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ControllerError>;

impl From<anyhow::Error> for ControllerError {
    fn from(err: anyhow::Error) -> Self {
        ControllerError::Other(err.to_string())
    }
}

impl From<toml::de::Error> for ControllerError {
    fn from(err: toml::de::Error) -> Self {
        ControllerError::Config(format!("TOML parse error: {}", err))
    }
}

impl From<serde_yaml::Error> for ControllerError {
    fn from(err: serde_yaml::Error) -> Self {
        ControllerError::Config(format!("YAML parse error: {}", err))
    }
}

impl From<reqwest::Error> for ControllerError {
    fn from(err: reqwest::Error) -> Self {
        ControllerError::Fetch(err.to_string())
    }
}
