//! HTTP panel client
//!
//! Talks JSON to a panel gateway that already speaks the controller's data
//! model. Every request carries the node token as a `token` query parameter.
//!
//! | Operation | Request |
//! |---|---|
//! | node info | `GET  {api}/api/v1/node/{id}` -> `NodeParams` |
//! | user list | `GET  {api}/api/v1/node/{id}/users` -> `{"users": [UserEntry]}` |
//! | traffic | `POST {api}/api/v1/node/{id}/traffic` <- `{"traffic": [..]}` |
//! | status | `POST {api}/api/v1/node/{id}/status` <- `NodeStatus` |
//! | audit | `POST {api}/api/v1/node/{id}/audit` <- `{"events": [AuditEvent]}` |

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::NodeConfig;
use crate::core::{
    AuditEvent, NodeId, NodeParams, NodeStatus, PanelApi, TrafficReport, UserEntry, UserId,
};
use crate::error::{ControllerError, Result};
use crate::logger::log;

/// Longest response body quoted in an error
const MAX_ERROR_BODY: usize = 256;

#[derive(Debug, Deserialize)]
struct UserListResponse {
    #[serde(default)]
    users: Vec<UserEntry>,
}

/// One user's traffic in a report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserTraffic {
    pub user_id: UserId,
    pub upload: u64,
    pub download: u64,
}

#[derive(Debug, Serialize)]
struct TrafficRequest<'a> {
    traffic: &'a [UserTraffic],
}

#[derive(Debug, Serialize)]
struct AuditRequest<'a> {
    events: &'a [AuditEvent],
}

/// Flatten a report into a list sorted by user id
pub fn traffic_entries(report: &TrafficReport) -> Vec<UserTraffic> {
    let mut entries: Vec<UserTraffic> = report
        .iter()
        .map(|(user_id, delta)| UserTraffic {
            user_id: *user_id,
            upload: delta.upload,
            download: delta.download,
        })
        .collect();
    entries.sort_by_key(|e| e.user_id);
    entries
}

/// JSON-over-HTTP `PanelApi`
pub struct HttpPanel {
    http: reqwest::Client,
    base_url: String,
    token: String,
    protocol: String,
}

impl HttpPanel {
    pub fn new(config: &NodeConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.api_timeout)
            .connect_timeout(config.api_timeout)
            .user_agent(concat!("panda-node/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ControllerError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self::with_client(http, config))
    }

    /// Wrap an existing client
    pub fn with_client(http: reqwest::Client, config: &NodeConfig) -> Self {
        Self {
            http,
            base_url: config.api.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            protocol: config.protocol.clone(),
        }
    }

    fn url(&self, node_id: NodeId, suffix: &str) -> String {
        if suffix.is_empty() {
            format!("{}/api/v1/node/{}", self.base_url, node_id)
        } else {
            format!("{}/api/v1/node/{}/{}", self.base_url, node_id, suffix)
        }
    }

    fn query(&self) -> [(&'static str, &str); 2] {
        [("token", self.token.as_str()), ("protocol", self.protocol.as_str())]
    }

    async fn get<T: DeserializeOwned>(&self, node_id: NodeId, suffix: &str) -> Result<T> {
        let url = self.url(node_id, suffix);
        log::debug!(node_id = node_id, url = %url, "GET");
        let resp = self.http.get(&url).query(&self.query()).send().await?;
        let resp = Self::check(resp).await?;
        resp.json::<T>()
            .await
            .map_err(|e| ControllerError::Fetch(format!("invalid response from {}: {}", url, e)))
    }

    async fn post<B: Serialize + ?Sized>(&self, node_id: NodeId, suffix: &str, body: &B) -> Result<()> {
        let url = self.url(node_id, suffix);
        log::debug!(node_id = node_id, url = %url, "POST");
        let resp = self
            .http
            .post(&url)
            .query(&self.query())
            .json(body)
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let mut body = resp.text().await.unwrap_or_default();
        if body.len() > MAX_ERROR_BODY {
            let mut end = MAX_ERROR_BODY;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            body.truncate(end);
        }
        Err(ControllerError::Fetch(format!("HTTP {}: {}", status, body.trim())))
    }
}

#[async_trait]
impl PanelApi for HttpPanel {
    async fn fetch_node_info(&self, node_id: NodeId) -> Result<NodeParams> {
        let params: NodeParams = self.get(node_id, "").await?;
        if params.node_id != node_id {
            return Err(ControllerError::Fetch(format!(
                "panel returned params for node {} instead of {}",
                params.node_id, node_id
            )));
        }
        Ok(params)
    }

    async fn fetch_user_list(&self, node_id: NodeId) -> Result<Vec<UserEntry>> {
        let resp: UserListResponse = self.get(node_id, "users").await?;
        Ok(resp.users)
    }

    async fn report_user_traffic(&self, node_id: NodeId, traffic: &TrafficReport) -> Result<()> {
        let entries = traffic_entries(traffic);
        self.post(node_id, "traffic", &TrafficRequest { traffic: &entries })
            .await
    }

    async fn report_node_status(&self, node_id: NodeId, status: &NodeStatus) -> Result<()> {
        self.post(node_id, "status", status).await
    }

    async fn report_audit_events(&self, node_id: NodeId, events: &[AuditEvent]) -> Result<()> {
        self.post(node_id, "audit", &AuditRequest { events }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{AuditAction, TrafficDelta};
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{body_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn setup() -> (MockServer, HttpPanel) {
        let server = MockServer::start().await;
        let mut config = NodeConfig::new(3, format!("{}/", server.uri()), "secret");
        config.api_timeout = Duration::from_secs(2);
        let panel = HttpPanel::new(&config).unwrap();
        (server, panel)
    }

    #[tokio::test]
    async fn test_fetch_node_info() {
        let (server, panel) = setup().await;

        Mock::given(method("GET"))
            .and(path("/api/v1/node/3"))
            .and(query_param("token", "secret"))
            .and(query_param("protocol", "trojan"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "node_id": 3,
                "protocol": "trojan",
                "port": 443,
                "tls": true,
                "server_name": "n3.example.com",
                "rules": ["block(all, udp/25)"]
            })))
            .mount(&server)
            .await;

        let params = panel.fetch_node_info(3).await.unwrap();
        assert_eq!(params.port, 443);
        assert!(params.tls);
        assert_eq!(params.listen_ip, "0.0.0.0");
        assert_eq!(params.cert_domain(), Some("n3.example.com"));
        assert_eq!(params.rules.len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_node_info_wrong_node() {
        let (server, panel) = setup().await;

        Mock::given(method("GET"))
            .and(path("/api/v1/node/3"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "node_id": 4,
                "protocol": "trojan",
                "port": 443
            })))
            .mount(&server)
            .await;

        assert!(matches!(
            panel.fetch_node_info(3).await,
            Err(ControllerError::Fetch(_))
        ));
    }

    #[tokio::test]
    async fn test_fetch_user_list() {
        let (server, panel) = setup().await;

        Mock::given(method("GET"))
            .and(path("/api/v1/node/3/users"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "users": [
                    {"id": 1, "uuid": "u-1", "speed_limit": 1000, "device_limit": 2},
                    {"id": 2, "password": "p-2", "enabled": false},
                    {"id": 3, "credential": "c-3"}
                ]
            })))
            .mount(&server)
            .await;

        let users = panel.fetch_user_list(3).await.unwrap();
        assert_eq!(users.len(), 3);
        assert_eq!(users[0], UserEntry::new(1, "u-1").with_limits(1000, 2));
        assert_eq!(users[1], UserEntry::new(2, "p-2").disabled());
        assert_eq!(users[2], UserEntry::new(3, "c-3"));
    }

    #[tokio::test]
    async fn test_http_error_is_fetch_error() {
        let (server, panel) = setup().await;

        Mock::given(method("GET"))
            .and(path("/api/v1/node/3/users"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad token"))
            .mount(&server)
            .await;

        let err = panel.fetch_user_list(3).await.unwrap_err();
        assert!(matches!(err, ControllerError::Fetch(_)));
        assert!(err.to_string().contains("401"));
        assert!(err.to_string().contains("bad token"));
    }

    #[tokio::test]
    async fn test_invalid_json_is_fetch_error() {
        let (server, panel) = setup().await;

        Mock::given(method("GET"))
            .and(path("/api/v1/node/3"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        assert!(matches!(
            panel.fetch_node_info(3).await,
            Err(ControllerError::Fetch(_))
        ));
    }

    #[tokio::test]
    async fn test_report_user_traffic() {
        let (server, panel) = setup().await;

        Mock::given(method("POST"))
            .and(path("/api/v1/node/3/traffic"))
            .and(query_param("token", "secret"))
            .and(body_json(json!({
                "traffic": [
                    {"user_id": 1, "upload": 10, "download": 20},
                    {"user_id": 2, "upload": 5, "download": 0}
                ]
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let mut report = TrafficReport::new();
        report.insert(2, TrafficDelta { upload: 5, download: 0 });
        report.insert(1, TrafficDelta { upload: 10, download: 20 });
        panel.report_user_traffic(3, &report).await.unwrap();
    }

    #[tokio::test]
    async fn test_report_status_and_audit() {
        let (server, panel) = setup().await;

        Mock::given(method("POST"))
            .and(path("/api/v1/node/3/status"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v1/node/3/audit"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let status = NodeStatus {
            hostname: "edge-1".to_string(),
            online_users: 2,
            registered_users: 10,
            listener_up: true,
            uptime_secs: 60,
        };
        panel.report_node_status(3, &status).await.unwrap();

        let events = [AuditEvent {
            user_id: 1,
            target: "a.example:443".to_string(),
            protocol: "tcp".to_string(),
            action: AuditAction::Block,
            rule: "block(all)".to_string(),
            timestamp: 0,
        }];
        assert!(panel.report_audit_events(3, &events).await.is_err());
    }

    #[tokio::test]
    async fn test_unreachable_panel() {
        let config = NodeConfig::new(1, "http://127.0.0.1:1", "t");
        let panel = HttpPanel::new(&config).unwrap();
        assert!(matches!(
            panel.fetch_user_list(1).await,
            Err(ControllerError::Fetch(_))
        ));
    }

    #[test]
    fn test_traffic_entries_sorted() {
        let mut report = TrafficReport::new();
        report.insert(9, TrafficDelta { upload: 1, download: 1 });
        report.insert(3, TrafficDelta { upload: 2, download: 2 });
        let entries = traffic_entries(&report);
        assert_eq!(entries[0].user_id, 3);
        assert_eq!(entries[1].user_id, 9);
    }
}
