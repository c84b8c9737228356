use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Parse a log level, case-insensitive
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "trace" => Some(LogLevel::Trace),
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" | "warning" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Pick the level: explicit CLI value first, then `[log] level` in the config file
pub fn resolve_log_level(cli_level: Option<&str>, config_level: Option<&str>) -> LogLevel {
    cli_level
        .and_then(LogLevel::parse)
        .or_else(|| config_level.and_then(LogLevel::parse))
        .unwrap_or_default()
}

fn build_filter(level: LogLevel) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "panda_node={level},panda_node_r={level},warn",
            level = level.as_str()
        ))
    })
}

/// Install the global subscriber. `RUST_LOG` overrides `level`.
pub fn init_logger(level: LogLevel) {
    tracing_subscriber::registry()
        .with(build_filter(level))
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_file(false)
                .with_line_number(true)
                .with_ansi(true)
                .compact(),
        )
        .init();
}

pub mod log {
    pub use tracing::{debug, error, info, warn};

    use crate::core::{AuditAction, Denied, NodeId, UserId};

    /// Record a finished user sync pass
    pub fn user_sync(node_id: NodeId, total: usize, added: usize, removed: usize, updated: usize, failed: usize) {
        if added > 0 || removed > 0 || updated > 0 || failed > 0 {
            info!(
                node_id = node_id,
                total = total,
                added = added,
                removed = removed,
                updated = updated,
                failed = failed,
                "Users synchronized"
            );
        } else {
            debug!(node_id = node_id, total = total, "Users unchanged");
        }
    }

    /// Record an audit hit
    pub fn audit(node_id: NodeId, user_id: UserId, target: &str, action: AuditAction, rule: &str) {
        match action {
            AuditAction::Block => {
                warn!(node_id = node_id, user_id = user_id, target = target, rule = rule, "Audit block")
            }
            AuditAction::Log => {
                info!(node_id = node_id, user_id = user_id, target = target, rule = rule, "Audit hit")
            }
            AuditAction::Allow => {}
        }
    }

    /// Record a refused admission
    pub fn denied(node_id: NodeId, user_id: UserId, reason: Denied) {
        debug!(node_id = node_id, user_id = user_id, reason = %reason, "Connection denied");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_parse() {
        assert_eq!(LogLevel::parse("DEBUG"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::parse("warning"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse("verbose"), None);
    }

    #[test]
    fn test_resolve_log_level_precedence() {
        assert_eq!(resolve_log_level(Some("error"), Some("debug")), LogLevel::Error);
        assert_eq!(resolve_log_level(None, Some("debug")), LogLevel::Debug);
        assert_eq!(resolve_log_level(Some("bogus"), Some("trace")), LogLevel::Trace);
        assert_eq!(resolve_log_level(None, None), LogLevel::Info);
    }
}
