//! Fleet manifest import
//!
//! Seeds the store with nodes, images, users, and their cubicles from a TOML
//! file. Records that already exist by name are left untouched.

use crate::state::StateManager;
use divisora_common::{ImageSpec, NodeSpec};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetManifest {
    #[serde(default, rename = "node")]
    pub nodes: Vec<NodeEntry>,
    #[serde(default, rename = "image")]
    pub images: Vec<ImageEntry>,
    #[serde(default, rename = "user")]
    pub users: Vec<UserEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEntry {
    pub name: String,
    pub ip_address: IpAddr,
    #[serde(default)]
    pub domain_name: String,
    pub port: u16,
    pub network_range: Option<IpNetwork>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageEntry {
    pub name: String,
    pub image: String,
    pub cpu_limit: Option<u32>,
    pub mem_limit: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserEntry {
    pub username: String,
    pub name: String,
    #[serde(default)]
    pub cubicles: Vec<CubicleEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CubicleEntry {
    /// Image name as declared in the manifest or already stored
    pub image: String,
    /// Node name
    pub node: String,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

/// Counts of records created by an import
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub nodes: usize,
    pub images: usize,
    pub users: usize,
    pub cubicles: usize,
}

impl FleetManifest {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Create everything the store does not have yet
    pub fn apply(&self, state: &StateManager) -> anyhow::Result<ImportSummary> {
        let mut summary = ImportSummary::default();

        for entry in &self.nodes {
            if state.get_node_by_name(&entry.name)?.is_some() {
                warn!("Node {} already exists, skipping", entry.name);
                continue;
            }
            state.create_node(
                entry.name.clone(),
                NodeSpec {
                    ip_address: entry.ip_address,
                    domain_name: entry.domain_name.clone(),
                    port: entry.port,
                    network_range: entry.network_range,
                },
            )?;
            summary.nodes += 1;
        }

        for entry in &self.images {
            if state.get_image_by_name(&entry.name)?.is_some() {
                warn!("Image {} already exists, skipping", entry.name);
                continue;
            }
            state.create_image(
                entry.name.clone(),
                ImageSpec {
                    image: entry.image.clone(),
                    cpu_limit: entry.cpu_limit,
                    mem_limit: entry.mem_limit.clone(),
                },
            )?;
            summary.images += 1;
        }

        for entry in &self.users {
            if state.get_user_by_name(&entry.username)?.is_some() {
                warn!("User {} already exists, skipping", entry.username);
                continue;
            }
            let user = state.create_user(entry.username.clone(), entry.name.clone())?;
            summary.users += 1;

            let networks = state.assign_networks(&user.meta.id)?;
            info!("User {} got {} networks", user.meta.name, networks.len());

            for cubicle in &entry.cubicles {
                let image = state.get_image_by_name(&cubicle.image)?.ok_or_else(|| {
                    anyhow::anyhow!("user {}: unknown image {}", entry.username, cubicle.image)
                })?;
                let node = state.get_node_by_name(&cubicle.node)?.ok_or_else(|| {
                    anyhow::anyhow!("user {}: unknown node {}", entry.username, cubicle.node)
                })?;
                state.add_cubicle(&user, &image, &node, cubicle.active)?;
                summary.cubicles += 1;
            }
        }

        Ok(summary)
    }
}
