//! Core types for Divisora

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use uuid::Uuid;

/// Resource metadata common to all resources
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceMeta {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub generation: i64,
}

impl ResourceMeta {
    pub fn new(name: String) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id: Uuid::new_v4().to_string(),
            name,
            labels: HashMap::new(),
            annotations: HashMap::new(),
            created_at: now,
            updated_at: now,
            generation: 1,
        }
    }
}

/// Node health as seen by the most recent liveness probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Up,
    Down,
    Error,
    Unknown,
}

impl Default for NodeState {
    fn default() -> Self {
        Self::Unknown
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Up => write!(f, "up"),
            NodeState::Down => write!(f, "down"),
            NodeState::Error => write!(f, "error"),
            NodeState::Unknown => write!(f, "unknown"),
        }
    }
}

/// Node specification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub ip_address: IpAddr,
    /// Preferred over `ip_address` when non-empty
    #[serde(default)]
    pub domain_name: String,
    pub port: u16,
    /// Range carved into per-user networks
    pub network_range: Option<IpNetwork>,
}

/// Node status
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeStatus {
    pub state: NodeState,
    pub last_activity: Option<i64>,
    pub response_time_ms: Option<u64>,
}

/// A host running the cubicle agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub meta: ResourceMeta,
    pub spec: NodeSpec,
    pub status: NodeStatus,
}

impl Node {
    /// Host part of the agent address
    pub fn host(&self) -> String {
        if self.spec.domain_name.is_empty() {
            self.spec.ip_address.to_string()
        } else {
            self.spec.domain_name.clone()
        }
    }

    /// Base URL of the node agent, e.g. `http://node1:8080`
    pub fn base_url(&self) -> String {
        match (self.spec.domain_name.is_empty(), self.spec.ip_address) {
            (true, IpAddr::V6(ip)) => format!("http://[{}]:{}", ip, self.spec.port),
            _ => format!("http://{}:{}", self.host(), self.spec.port),
        }
    }
}

/// Cubicle specification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CubicleSpec {
    /// Whether the cubicle should be running on its node
    #[serde(default)]
    pub active: bool,
    pub user_id: String,
    pub image_id: String,
    pub node_id: String,
    pub novnc_port: u16,
}

/// A user's sandboxed desktop
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cubicle {
    pub meta: ResourceMeta,
    pub spec: CubicleSpec,
}

/// Network specification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSpec {
    pub subnet: IpNetwork,
    pub node_id: String,
    /// Unallocated while `None`
    pub user_id: Option<String>,
}

/// Subnet reserved on a node, optionally owned by a user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Network {
    pub meta: ResourceMeta,
    pub spec: NetworkSpec,
}

/// Image specification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageSpec {
    /// Container image reference, e.g. `divisora/cubicle-ubuntu:latest`
    pub image: String,
    pub cpu_limit: Option<u32>,
    /// Docker-style memory limit, e.g. `1g`
    pub mem_limit: Option<String>,
}

/// Image
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Image {
    pub meta: ResourceMeta,
    pub spec: ImageSpec,
}

/// User specification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSpec {
    pub display_name: String,
}

/// User; `meta.name` holds the username
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub meta: ResourceMeta,
    pub spec: UserSpec,
}

/// An active cubicle resolved with everything needed to start it remotely
#[derive(Debug, Clone)]
pub struct DesiredCubicle {
    pub cubicle: Cubicle,
    pub owner: User,
    pub image: Image,
    /// Network allocated to the owner on the cubicle's node
    pub network: Option<Network>,
}

impl DesiredCubicle {
    pub fn name(&self) -> &str {
        &self.cubicle.meta.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(ip: &str, domain: &str) -> Node {
        Node {
            meta: ResourceMeta::new("node1".to_string()),
            spec: NodeSpec {
                ip_address: ip.parse().unwrap(),
                domain_name: domain.to_string(),
                port: 8080,
                network_range: None,
            },
            status: NodeStatus::default(),
        }
    }

    #[test]
    fn test_base_url_prefers_domain() {
        assert_eq!(node("10.0.0.5", "node1").base_url(), "http://node1:8080");
        assert_eq!(node("10.0.0.5", "").base_url(), "http://10.0.0.5:8080");
        assert_eq!(node("fd00::5", "").base_url(), "http://[fd00::5]:8080");
    }

    #[test]
    fn test_node_state_defaults_unknown() {
        let status = NodeStatus::default();
        assert_eq!(status.state, NodeState::Unknown);
        assert_eq!(status.state.to_string(), "unknown");
        assert!(status.last_activity.is_none());
    }
}
