//! Connection audit rules
//!
//! Rules use the same inline shape as listener ACLs:
//!
//! ```yaml
//! audit:
//!   inline:
//!     - block(suffix:torrent-tracker.example)
//!     - log(keyword:speedtest, tcp)
//!     - block(cidr:10.0.0.0/8)
//!     - block(all, udp/25)
//! ```
//!
//! Rules are evaluated in order and the first match wins. No match allows.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use super::hooks::UserId;
use crate::error::{ControllerError, Result};
use crate::logger::log;

/// Outcome of evaluating a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditAction {
    Allow,
    Log,
    Block,
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AuditAction::Allow => "allow",
            AuditAction::Log => "log",
            AuditAction::Block => "block",
        };
        f.write_str(s)
    }
}

/// Destination host of a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Host {
    Domain(String),
    Ip(IpAddr),
}

/// Destination of a connection as reported by the proxy engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: Host,
    pub port: u16,
}

impl Target {
    pub fn domain(domain: &str, port: u16) -> Self {
        Self {
            host: Host::Domain(normalize_domain(domain)),
            port,
        }
    }

    pub fn ip(ip: IpAddr, port: u16) -> Self {
        Self {
            host: Host::Ip(ip),
            port,
        }
    }

    /// Parse `host:port`, `[v6]:port`, a bare IP or a bare domain (port 0)
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.is_empty() {
            return None;
        }
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Some(Self::ip(addr.ip(), addr.port()));
        }
        if let Ok(ip) = s.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
            return Some(Self::ip(ip, 0));
        }
        match s.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().ok()?;
                if host.is_empty() {
                    return None;
                }
                Some(Self::domain(host, port))
            }
            None => Some(Self::domain(s, 0)),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            Host::Domain(d) => write!(f, "{}:{}", d, self.port),
            Host::Ip(IpAddr::V6(ip)) => write!(f, "[{}]:{}", ip, self.port),
            Host::Ip(ip) => write!(f, "{}:{}", ip, self.port),
        }
    }
}

fn normalize_domain(domain: &str) -> String {
    domain.trim().trim_end_matches('.').to_ascii_lowercase()
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum HostMatcher {
    All,
    Domain(String),
    Suffix(String),
    Keyword(String),
    Ip(IpAddr),
    Cidr(IpAddr, u8),
}

impl HostMatcher {
    fn parse(s: &str) -> std::result::Result<Self, String> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("all") || s == "*" {
            return Ok(HostMatcher::All);
        }
        let (kind, value) = match s.split_once(':') {
            // IPv6 literals contain ':' too, only split on known prefixes
            Some((kind, value))
                if matches!(
                    kind.to_ascii_lowercase().as_str(),
                    "domain" | "full" | "suffix" | "keyword" | "ip" | "cidr"
                ) =>
            {
                (kind.to_ascii_lowercase(), value.trim())
            }
            _ => return Self::parse_bare(s),
        };
        if value.is_empty() {
            return Err(format!("empty pattern in '{}'", s));
        }
        match kind.as_str() {
            "domain" | "full" => Ok(HostMatcher::Domain(normalize_domain(value))),
            "suffix" => Ok(HostMatcher::Suffix(
                normalize_domain(value).trim_start_matches('.').to_string(),
            )),
            "keyword" => Ok(HostMatcher::Keyword(value.to_ascii_lowercase())),
            "ip" => value
                .parse::<IpAddr>()
                .map(HostMatcher::Ip)
                .map_err(|e| format!("invalid ip '{}': {}", value, e)),
            _ => parse_cidr(value),
        }
    }

    fn parse_bare(s: &str) -> std::result::Result<Self, String> {
        if s.contains('/') {
            return parse_cidr(s);
        }
        if let Ok(ip) = s.parse::<IpAddr>() {
            return Ok(HostMatcher::Ip(ip));
        }
        if s.is_empty() {
            return Err("empty pattern".to_string());
        }
        Ok(HostMatcher::Suffix(
            normalize_domain(s).trim_start_matches('.').to_string(),
        ))
    }

    fn matches(&self, host: &Host) -> bool {
        match (self, host) {
            (HostMatcher::All, _) => true,
            (HostMatcher::Domain(d), Host::Domain(h)) => h == d,
            (HostMatcher::Suffix(s), Host::Domain(h)) => {
                h == s || (h.len() > s.len() && h.ends_with(s.as_str()) && h.as_bytes()[h.len() - s.len() - 1] == b'.')
            }
            (HostMatcher::Keyword(k), Host::Domain(h)) => h.contains(k.as_str()),
            (HostMatcher::Ip(ip), Host::Ip(h)) => ip == h,
            (HostMatcher::Cidr(net, prefix), Host::Ip(h)) => cidr_contains(net, *prefix, h),
            _ => false,
        }
    }
}

fn parse_cidr(s: &str) -> std::result::Result<HostMatcher, String> {
    let (addr, prefix) = s
        .split_once('/')
        .ok_or_else(|| format!("invalid cidr '{}'", s))?;
    let addr: IpAddr = addr
        .trim()
        .parse()
        .map_err(|e| format!("invalid cidr address '{}': {}", addr, e))?;
    let prefix: u8 = prefix
        .trim()
        .parse()
        .map_err(|e| format!("invalid cidr prefix '{}': {}", prefix, e))?;
    let max = if addr.is_ipv4() { 32 } else { 128 };
    if prefix > max {
        return Err(format!("cidr prefix {} out of range for {}", prefix, addr));
    }
    Ok(HostMatcher::Cidr(addr, prefix))
}

fn cidr_contains(net: &IpAddr, prefix: u8, ip: &IpAddr) -> bool {
    match (net, ip) {
        (IpAddr::V4(net), IpAddr::V4(ip)) => {
            if prefix == 0 {
                return true;
            }
            let mask = u32::MAX << (32 - prefix as u32);
            (u32::from(*net) & mask) == (u32::from(*ip) & mask)
        }
        (IpAddr::V6(net), IpAddr::V6(ip)) => {
            if prefix == 0 {
                return true;
            }
            let mask = u128::MAX << (128 - prefix as u32);
            (u128::from(*net) & mask) == (u128::from(*ip) & mask)
        }
        _ => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Protocol {
    Any,
    Tcp,
    Udp,
}

impl Protocol {
    fn parse(s: &str) -> std::result::Result<Self, String> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "*" | "all" => Ok(Protocol::Any),
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(format!("unknown protocol '{}'", other)),
        }
    }

    fn matches(&self, tag: &str) -> bool {
        match self {
            Protocol::Any => true,
            Protocol::Tcp => tag.eq_ignore_ascii_case("tcp"),
            Protocol::Udp => tag.eq_ignore_ascii_case("udp"),
        }
    }
}

/// One parsed audit rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRule {
    action: AuditAction,
    host: HostMatcher,
    protocol: Protocol,
    port: Option<u16>,
    text: String,
}

impl AuditRule {
    /// Parse `action(pattern[, proto[/port]])`
    pub fn parse(line: &str) -> Result<Self> {
        let text = line.trim();
        let invalid = |reason: String| {
            ControllerError::Config(format!("invalid audit rule '{}': {}", text, reason))
        };

        let open = text
            .find('(')
            .ok_or_else(|| invalid("expected action(...)".to_string()))?;
        if !text.ends_with(')') {
            return Err(invalid("missing closing ')'".to_string()));
        }
        let action = match text[..open].trim().to_ascii_lowercase().as_str() {
            "allow" | "direct" => AuditAction::Allow,
            "log" => AuditAction::Log,
            "block" | "reject" => AuditAction::Block,
            other => return Err(invalid(format!("unknown action '{}'", other))),
        };

        let inner = &text[open + 1..text.len() - 1];
        let mut parts = inner.splitn(3, ',');
        let pattern = parts.next().unwrap_or_default();
        let proto_spec = parts.next().unwrap_or_default();
        if parts.next().is_some() {
            return Err(invalid("too many arguments".to_string()));
        }

        let host = HostMatcher::parse(pattern).map_err(invalid)?;
        let (protocol, port) = match proto_spec.trim().split_once('/') {
            Some((proto, port)) => {
                let port = port
                    .trim()
                    .parse::<u16>()
                    .map_err(|e| invalid(format!("invalid port '{}': {}", port, e)))?;
                (Protocol::parse(proto).map_err(invalid)?, Some(port))
            }
            None => (Protocol::parse(proto_spec).map_err(invalid)?, None),
        };

        Ok(Self {
            action,
            host,
            protocol,
            port,
            text: text.to_string(),
        })
    }

    pub fn action(&self) -> AuditAction {
        self.action
    }

    /// Rule as written
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn matches(&self, target: &Target, protocol: &str) -> bool {
        self.protocol.matches(protocol)
            && self.port.map_or(true, |p| p == target.port)
            && self.host.matches(&target.host)
    }
}

/// Ordered rule set, immutable once built
#[derive(Debug, Clone, Default)]
pub struct AuditMatcher {
    rules: Vec<AuditRule>,
}

impl AuditMatcher {
    pub fn new(rules: Vec<AuditRule>) -> Self {
        Self { rules }
    }

    /// Parse rule lines, skipping blanks and `#` comments
    pub fn from_lines<I, S>(lines: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut rules = Vec::new();
        for line in lines {
            let line = line.as_ref().trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            rules.push(AuditRule::parse(line)?);
        }
        Ok(Self { rules })
    }

    /// First matching rule, if any
    pub fn find(&self, target: &Target, protocol: &str) -> Option<&AuditRule> {
        self.rules.iter().find(|r| r.matches(target, protocol))
    }

    /// Decide what to do with a new connection
    pub fn evaluate(&self, user_id: UserId, target: &Target, protocol: &str) -> AuditAction {
        match self.find(target, protocol) {
            Some(rule) => {
                log::debug!(
                    user_id = user_id,
                    target = %target,
                    protocol = protocol,
                    rule = rule.text(),
                    action = %rule.action(),
                    "Audit rule matched"
                );
                rule.action()
            }
            None => AuditAction::Allow,
        }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Audit rule file (YAML)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default)]
    pub audit: AuditRules,
}

/// Audit rules section
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditRules {
    /// Inline rules (list of rule strings)
    #[serde(default)]
    pub inline: Vec<String>,
}

/// Load rule lines from a YAML file
pub async fn load_audit_file(path: &Path) -> Result<Vec<String>> {
    let content = tokio::fs::read_to_string(path).await.map_err(|e| {
        ControllerError::Config(format!(
            "failed to read audit file {}: {}",
            path.display(),
            e
        ))
    })?;
    let config: AuditConfig = serde_yaml::from_str(&content)?;
    // Validate early so a bad file is reported at load time
    AuditMatcher::from_lines(&config.audit.inline)?;
    Ok(config.audit.inline)
}
