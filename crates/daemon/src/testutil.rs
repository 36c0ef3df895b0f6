//! Test doubles shared by the daemon's unit tests

use crate::agent::{
    AgentError, CreateCubicleRequest, CreateNetworkRequest, NodeAgent, RemoteCubicle,
    RemoteNetwork,
};
use crate::probe::{ProbeOutcome, Prober};
use async_trait::async_trait;
use divisora_common::types::*;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Serve `router` on an ephemeral localhost port
pub async fn serve(router: axum::Router) -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    port
}

/// A localhost port nothing listens on
pub async fn closed_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

pub fn node_at(port: u16) -> Node {
    Node {
        meta: ResourceMeta::new("test-node".to_string()),
        spec: NodeSpec {
            ip_address: "127.0.0.1".parse().unwrap(),
            domain_name: String::new(),
            port,
            network_range: None,
        },
        status: NodeStatus::default(),
    }
}

pub fn network(name: &str, subnet: &str) -> Network {
    Network {
        meta: ResourceMeta::new(name.to_string()),
        spec: NetworkSpec {
            subnet: subnet.parse().unwrap(),
            node_id: "node".to_string(),
            user_id: None,
        },
    }
}

/// Active cubicle `name` owned by `username`, on image `divisora/cubicle-ubuntu:latest`
pub fn desired_for(name: &str, username: &str, network: Option<Network>) -> DesiredCubicle {
    let owner = User {
        meta: ResourceMeta::new(username.to_string()),
        spec: UserSpec {
            display_name: username.to_string(),
        },
    };
    let image = Image {
        meta: ResourceMeta::new("ubuntu".to_string()),
        spec: ImageSpec {
            image: "divisora/cubicle-ubuntu:latest".to_string(),
            cpu_limit: None,
            mem_limit: None,
        },
    };
    let cubicle = Cubicle {
        meta: ResourceMeta::new(name.to_string()),
        spec: CubicleSpec {
            active: true,
            user_id: owner.meta.id.clone(),
            image_id: image.meta.id.clone(),
            node_id: "node".to_string(),
            novnc_port: 30000,
        },
    };
    DesiredCubicle {
        cubicle,
        owner,
        image,
        network,
    }
}

pub fn desired(name: &str, display_name: &str, novnc_port: u16) -> DesiredCubicle {
    let mut d = desired_for(name, "bob", None);
    d.owner.spec.display_name = display_name.to_string();
    d.cubicle.spec.novnc_port = novnc_port;
    d
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentCall {
    ListCubicles(String),
    ListNetworks(String),
    CreateNetwork(String, CreateNetworkRequest),
    CreateCubicle(String, CreateCubicleRequest),
}

#[derive(Default)]
struct FakeNode {
    cubicles: Vec<String>,
    networks: Vec<String>,
    fail_listing: bool,
    fail_network_creation: bool,
}

/// In-memory node agent keyed by node name; creations show up in later listings
#[derive(Default)]
pub struct FakeAgent {
    nodes: Mutex<HashMap<String, FakeNode>>,
    failing_cubicles: Mutex<HashSet<String>>,
    calls: Mutex<Vec<AgentCall>>,
    listing_delay: Option<Duration>,
}

impl FakeAgent {
    pub fn with_listing_delay(mut self, delay: Duration) -> Self {
        self.listing_delay = Some(delay);
        self
    }

    pub fn fail_listing(&self, node: &str) {
        self.nodes.lock().entry(node.to_string()).or_default().fail_listing = true;
    }

    pub fn fail_network_creation(&self, node: &str) {
        self.nodes
            .lock()
            .entry(node.to_string())
            .or_default()
            .fail_network_creation = true;
    }

    pub fn fail_cubicle_creation(&self, cubicle: &str) {
        self.failing_cubicles.lock().insert(cubicle.to_string());
    }

    pub fn add_cubicle(&self, node: &str, name: &str) {
        self.nodes
            .lock()
            .entry(node.to_string())
            .or_default()
            .cubicles
            .push(name.to_string());
    }

    pub fn add_network(&self, node: &str, name: &str) {
        self.nodes
            .lock()
            .entry(node.to_string())
            .or_default()
            .networks
            .push(name.to_string());
    }

    pub fn remote_cubicles(&self, node: &str) -> Vec<String> {
        self.nodes
            .lock()
            .get(node)
            .map(|n| n.cubicles.clone())
            .unwrap_or_default()
    }

    pub fn calls(&self) -> Vec<AgentCall> {
        self.calls.lock().clone()
    }

    /// Create calls as `create_<kind> <node> <name>`, in issue order
    pub fn creates(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                AgentCall::CreateNetwork(node, r) => Some(format!("create_network {} {}", node, r.name)),
                AgentCall::CreateCubicle(node, r) => Some(format!("create_cubicle {} {}", node, r.name)),
                _ => None,
            })
            .collect()
    }

    fn listing_fails(&self, node: &str) -> bool {
        self.nodes.lock().get(node).map_or(false, |n| n.fail_listing)
    }
}

#[async_trait]
impl NodeAgent for FakeAgent {
    async fn list_cubicles(&self, node: &Node) -> Result<Vec<RemoteCubicle>, AgentError> {
        let name = node.meta.name.clone();
        self.calls.lock().push(AgentCall::ListCubicles(name.clone()));
        if let Some(delay) = self.listing_delay {
            tokio::time::sleep(delay).await;
        }
        if self.listing_fails(&name) {
            return Err(AgentError::Unreachable("connection refused".to_string()));
        }
        Ok(self
            .remote_cubicles(&name)
            .into_iter()
            .map(|name| RemoteCubicle { name })
            .collect())
    }

    async fn list_networks(&self, node: &Node) -> Result<Vec<RemoteNetwork>, AgentError> {
        let name = node.meta.name.clone();
        self.calls.lock().push(AgentCall::ListNetworks(name.clone()));
        if self.listing_fails(&name) {
            return Err(AgentError::Unreachable("connection refused".to_string()));
        }
        let networks = self
            .nodes
            .lock()
            .get(&name)
            .map(|n| n.networks.clone())
            .unwrap_or_default();
        Ok(networks.into_iter().map(|name| RemoteNetwork { name }).collect())
    }

    async fn create_network(
        &self,
        node: &Node,
        request: &CreateNetworkRequest,
    ) -> Result<String, AgentError> {
        let name = node.meta.name.clone();
        self.calls
            .lock()
            .push(AgentCall::CreateNetwork(name.clone(), request.clone()));

        let mut nodes = self.nodes.lock();
        let fake = nodes.entry(name).or_default();
        if fake.fail_network_creation {
            return Err(AgentError::Rejected {
                status: 409,
                body: "pool overlaps".to_string(),
            });
        }
        fake.networks.push(request.name.clone());
        Ok("{}".to_string())
    }

    async fn create_cubicle(
        &self,
        node: &Node,
        request: &CreateCubicleRequest,
    ) -> Result<String, AgentError> {
        let name = node.meta.name.clone();
        self.calls
            .lock()
            .push(AgentCall::CreateCubicle(name.clone(), request.clone()));

        if self.failing_cubicles.lock().contains(&request.name) {
            return Err(AgentError::Timeout {
                after: Duration::from_secs(10),
            });
        }
        self.nodes
            .lock()
            .entry(name)
            .or_default()
            .cubicles
            .push(request.name.clone());
        Ok("{}".to_string())
    }
}

/// Prober answering `Up` unless told otherwise for a node name
#[derive(Default)]
pub struct FakeProber {
    states: Mutex<HashMap<String, NodeState>>,
}

impl FakeProber {
    pub fn set(&self, node: &str, state: NodeState) {
        self.states.lock().insert(node.to_string(), state);
    }
}

#[async_trait]
impl Prober for FakeProber {
    async fn probe(&self, node: &Node) -> ProbeOutcome {
        let state = self
            .states
            .lock()
            .get(&node.meta.name)
            .copied()
            .unwrap_or(NodeState::Up);
        ProbeOutcome {
            state,
            response_time: (state != NodeState::Down).then(|| Duration::from_millis(3)),
        }
    }
}
