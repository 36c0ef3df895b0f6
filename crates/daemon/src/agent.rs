//! Node agent API client
//!
//! Every node runs an agent exposing `/api/v1/cubicle` and `/api/v1/network`.
//! Calls are bounded by explicit timeouts and never panic; failures come back
//! as [`AgentError`] for the reconciler to log and skip.

use crate::config::AgentConfig;
use async_trait::async_trait;
use divisora_common::{subnet, DesiredCubicle, Network, Node};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Failure of a single agent call
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    /// Agent answered with a non-2xx status
    #[error("rejected with HTTP {status}: {body}")]
    Rejected { status: u16, body: String },

    /// Connection refused, DNS failure, or any other transport error
    #[error("unreachable: {0}")]
    Unreachable(String),

    #[error("timed out after {after:?}")]
    Timeout { after: Duration },
}

/// Cubicle as listed by a node agent
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteCubicle {
    pub name: String,
}

/// Network as listed by a node agent
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteNetwork {
    pub name: String,
}

/// Body of `PUT /api/v1/network`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateNetworkRequest {
    pub name: String,
    pub driver: String,
    pub ipam: Ipam,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ipam {
    pub driver: String,
    pub pool_configs: Vec<PoolConfig>,
    #[serde(default)]
    pub options: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub subnet: String,
    pub gateway: String,
}

impl CreateNetworkRequest {
    /// Bridge network over the stored subnet, gateway on its second-to-last address
    pub fn for_network(network: &Network) -> divisora_common::Result<Self> {
        let gateway = subnet::gateway_for(&network.spec.subnet)?;
        Ok(Self {
            name: network.meta.name.clone(),
            driver: "bridge".to_string(),
            ipam: Ipam {
                driver: "default".to_string(),
                pool_configs: vec![PoolConfig {
                    subnet: network.spec.subnet.to_string(),
                    gateway: gateway.to_string(),
                }],
                options: HashMap::new(),
            },
        })
    }
}

/// Body of `PUT /api/v1/cubicle`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateCubicleRequest {
    pub name: String,
    pub hostname: String,
    pub owner: String,
    pub image: String,
    pub network: String,
    #[serde(default)]
    pub caps: Vec<String>,
    #[serde(default)]
    pub environments: HashMap<String, String>,
    pub novnc_port: u16,
    #[serde(default)]
    pub ports: HashMap<String, String>,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mem_limit: Option<String>,
}

impl CreateCubicleRequest {
    pub fn new(desired: &DesiredCubicle, network: &Network, hostname_domain: &str) -> Self {
        let name = desired.cubicle.meta.name.clone();
        let hostname = if hostname_domain.is_empty() {
            name.clone()
        } else {
            format!("{}.{}", name, hostname_domain)
        };

        Self {
            name,
            hostname,
            owner: desired.owner.spec.display_name.clone(),
            image: desired.image.spec.image.clone(),
            network: network.meta.name.clone(),
            caps: Vec::new(),
            environments: HashMap::new(),
            novnc_port: desired.cubicle.spec.novnc_port,
            ports: HashMap::new(),
            volumes: Vec::new(),
            cpu_limit: desired.image.spec.cpu_limit,
            mem_limit: desired.image.spec.mem_limit.clone(),
        }
    }
}

/// Operations the reconciler needs from a node agent
#[async_trait]
pub trait NodeAgent: Send + Sync {
    async fn list_cubicles(&self, node: &Node) -> Result<Vec<RemoteCubicle>, AgentError>;

    async fn list_networks(&self, node: &Node) -> Result<Vec<RemoteNetwork>, AgentError>;

    /// Returns the agent's response body
    async fn create_network(
        &self,
        node: &Node,
        request: &CreateNetworkRequest,
    ) -> Result<String, AgentError>;

    /// Returns the agent's response body
    async fn create_cubicle(
        &self,
        node: &Node,
        request: &CreateCubicleRequest,
    ) -> Result<String, AgentError>;
}

/// Per-operation timeouts
#[derive(Debug, Clone, Copy)]
pub struct AgentTimeouts {
    pub read: Duration,
    pub network: Duration,
    pub write: Duration,
}

impl From<&AgentConfig> for AgentTimeouts {
    fn from(config: &AgentConfig) -> Self {
        Self {
            read: config.read_timeout(),
            network: config.network_timeout(),
            write: config.write_timeout(),
        }
    }
}

/// HTTP implementation of [`NodeAgent`]
#[derive(Clone)]
pub struct HttpAgent {
    client: reqwest::Client,
    timeouts: AgentTimeouts,
}

impl HttpAgent {
    pub fn new(timeouts: AgentTimeouts) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("divisorad/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, timeouts })
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        timeout: Duration,
    ) -> Result<String, AgentError> {
        let classify = |e: reqwest::Error| {
            if e.is_timeout() {
                AgentError::Timeout { after: timeout }
            } else {
                AgentError::Unreachable(e.to_string())
            }
        };

        let res = request.timeout(timeout).send().await.map_err(classify)?;
        let status = res.status();
        let body = res.text().await.map_err(classify)?;

        if !status.is_success() {
            return Err(AgentError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }

    async fn list_names(&self, node: &Node, path: &str) -> Result<Vec<String>, AgentError> {
        let url = format!("{}{}", node.base_url(), path);
        let body = self.send(self.client.get(&url), self.timeouts.read).await?;
        debug!("GET {} -> {}", url, body);
        Ok(parse_listing(&body, &url))
    }

    async fn put_json<T: Serialize + Sync>(
        &self,
        node: &Node,
        path: &str,
        body: &T,
        timeout: Duration,
    ) -> Result<String, AgentError> {
        let url = format!("{}{}", node.base_url(), path);
        let request = self
            .client
            .put(&url)
            .header("Content-Type", "application/json")
            .json(body);
        self.send(request, timeout).await
    }
}

/// Names from a `{"results": [{"name": ...}, ...]}` envelope.
///
/// Invalid JSON, a missing `results` key, or entries without a string
/// `name` all count as empty rather than as errors.
pub fn parse_listing(body: &str, url: &str) -> Vec<String> {
    let value: serde_json::Value = match serde_json::from_str(body) {
        Ok(value) => value,
        Err(e) => {
            warn!("Malformed listing from {}, treating as empty: {}", url, e);
            return Vec::new();
        }
    };

    let Some(items) = value.get("results").and_then(|r| r.as_array()) else {
        debug!("Listing from {} has no results array", url);
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| item.get("name")?.as_str().map(str::to_string))
        .collect()
}

#[async_trait]
impl NodeAgent for HttpAgent {
    async fn list_cubicles(&self, node: &Node) -> Result<Vec<RemoteCubicle>, AgentError> {
        let names = self.list_names(node, "/api/v1/cubicle").await?;
        Ok(names.into_iter().map(|name| RemoteCubicle { name }).collect())
    }

    async fn list_networks(&self, node: &Node) -> Result<Vec<RemoteNetwork>, AgentError> {
        let names = self.list_names(node, "/api/v1/network").await?;
        Ok(names.into_iter().map(|name| RemoteNetwork { name }).collect())
    }

    async fn create_network(
        &self,
        node: &Node,
        request: &CreateNetworkRequest,
    ) -> Result<String, AgentError> {
        self.put_json(node, "/api/v1/network", request, self.timeouts.network)
            .await
    }

    async fn create_cubicle(
        &self,
        node: &Node,
        request: &CreateCubicleRequest,
    ) -> Result<String, AgentError> {
        self.put_json(node, "/api/v1/cubicle", request, self.timeouts.write)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{closed_port, node_at, serve};
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::{Json, Router};
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn timeouts(ms: u64) -> AgentTimeouts {
        let t = Duration::from_millis(ms);
        AgentTimeouts {
            read: t,
            network: t,
            write: t,
        }
    }

    #[test]
    fn test_parse_listing_is_lenient() {
        assert_eq!(
            parse_listing(r#"{"results":[{"name":"a"},{"name":"b"}]}"#, "u"),
            vec!["a", "b"]
        );
        assert!(parse_listing("{}", "u").is_empty());
        assert!(parse_listing("not json", "u").is_empty());
        assert!(parse_listing(r#"{"results":"nope"}"#, "u").is_empty());
        assert_eq!(
            parse_listing(r#"{"results":[{"id":1},{"name":"c"},"x"]}"#, "u"),
            vec!["c"]
        );
    }

    #[tokio::test]
    async fn test_list_cubicles() {
        let router = Router::new().route(
            "/api/v1/cubicle",
            get(|| async { r#"{"results":[{"name":"ubuntu-bob","state":"running"}]}"# }),
        );
        let port = serve(router).await;
        let agent = HttpAgent::new(timeouts(1000)).unwrap();

        let cubicles = agent.list_cubicles(&node_at(port)).await.unwrap();
        assert_eq!(
            cubicles,
            vec![RemoteCubicle {
                name: "ubuntu-bob".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_missing_results_is_empty() {
        let router = Router::new().route("/api/v1/network", get(|| async { "{}" }));
        let port = serve(router).await;
        let agent = HttpAgent::new(timeouts(1000)).unwrap();

        assert!(agent.list_networks(&node_at(port)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejection_keeps_body() {
        let router = Router::new().route(
            "/api/v1/cubicle",
            get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "docker daemon gone") }),
        );
        let port = serve(router).await;
        let agent = HttpAgent::new(timeouts(1000)).unwrap();

        let err = agent.list_cubicles(&node_at(port)).await.unwrap_err();
        assert_eq!(
            err,
            AgentError::Rejected {
                status: 500,
                body: "docker daemon gone".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_unreachable_and_timeout() {
        let agent = HttpAgent::new(timeouts(100)).unwrap();

        let err = agent
            .list_cubicles(&node_at(closed_port().await))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Unreachable(_)));

        let router = Router::new().route(
            "/api/v1/network",
            get(|| async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                "{}"
            }),
        );
        let port = serve(router).await;
        let err = agent.list_networks(&node_at(port)).await.unwrap_err();
        assert!(matches!(err, AgentError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_create_network_payload() {
        let seen: Arc<Mutex<Vec<serde_json::Value>>> = Arc::default();
        let sink = seen.clone();
        let router = Router::new().route(
            "/api/v1/network",
            axum::routing::put(move |Json(body): Json<serde_json::Value>| {
                let sink = sink.clone();
                async move {
                    sink.lock().push(body);
                    (StatusCode::CREATED, "created")
                }
            }),
        );
        let port = serve(router).await;
        let agent = HttpAgent::new(timeouts(1000)).unwrap();

        let network = crate::testutil::network("Network_n1_192_168_0_0_26", "192.168.0.0/26");
        let request = CreateNetworkRequest::for_network(&network).unwrap();
        let body = agent.create_network(&node_at(port), &request).await.unwrap();
        assert_eq!(body, "created");

        let seen = seen.lock();
        assert_eq!(
            seen[0],
            serde_json::json!({
                "name": "Network_n1_192_168_0_0_26",
                "driver": "bridge",
                "ipam": {
                    "driver": "default",
                    "pool_configs": [{"subnet": "192.168.0.0/26", "gateway": "192.168.0.62"}],
                    "options": {}
                }
            })
        );
    }

    #[test]
    fn test_cubicle_request_shape() {
        let desired = crate::testutil::desired("ubuntu-bob", "Bob Bobsson", 30001);
        let network = crate::testutil::network("Network_n1_192_168_0_0_26", "192.168.0.0/26");

        let request = CreateCubicleRequest::new(&desired, &network, "domain.internal");
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["name"], "ubuntu-bob");
        assert_eq!(json["hostname"], "ubuntu-bob.domain.internal");
        assert_eq!(json["owner"], "Bob Bobsson");
        assert_eq!(json["image"], "divisora/cubicle-ubuntu:latest");
        assert_eq!(json["network"], "Network_n1_192_168_0_0_26");
        assert_eq!(json["novnc_port"], 30001);
        assert_eq!(json["caps"], serde_json::json!([]));
        assert_eq!(json["environments"], serde_json::json!({}));
        assert_eq!(json["ports"], serde_json::json!({}));
        assert_eq!(json["volumes"], serde_json::json!([]));
    }
}
