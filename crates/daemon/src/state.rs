//! Desired-state store for the daemon

use crate::config::AllocationConfig;
use divisora_common::{
    db::{Database, ResourceRow},
    subnet,
    types::*,
    Error, Result,
};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

/// Read side of the desired state plus the node status write-back.
///
/// The reconciler only ever talks to the store through this trait.
pub trait DesiredStateStore: Send + Sync {
    /// All nodes, in creation order
    fn list_nodes(&self) -> Result<Vec<Node>>;

    /// Active cubicles placed on `node`, resolved with owner, image, and the
    /// owner's network on that node
    fn desired_cubicles(&self, node: &Node) -> Result<Vec<DesiredCubicle>>;

    /// Persist the outcome of a liveness probe as one unit of work
    fn record_node_status(
        &self,
        node_id: &str,
        state: NodeState,
        response_time_ms: Option<u64>,
    ) -> Result<()>;
}

/// SQLite-backed store
#[derive(Clone)]
pub struct StateManager {
    db: Database,
    allocation: AllocationConfig,
}

fn split<S, T>(r: ResourceRow<S, T>) -> (ResourceMeta, S, T) {
    (
        ResourceMeta {
            id: r.id,
            name: r.name,
            labels: r.labels,
            annotations: r.annotations,
            created_at: r.created_at,
            updated_at: r.updated_at,
            generation: r.generation,
        },
        r.spec,
        r.status,
    )
}

fn node_from(r: ResourceRow<NodeSpec, NodeStatus>) -> Node {
    let (meta, spec, status) = split(r);
    Node { meta, spec, status }
}

fn cubicle_from(r: ResourceRow<CubicleSpec, ()>) -> Cubicle {
    let (meta, spec, ()) = split(r);
    Cubicle { meta, spec }
}

fn network_from(r: ResourceRow<NetworkSpec, ()>) -> Network {
    let (meta, spec, ()) = split(r);
    Network { meta, spec }
}

fn image_from(r: ResourceRow<ImageSpec, ()>) -> Image {
    let (meta, spec, ()) = split(r);
    Image { meta, spec }
}

fn user_from(r: ResourceRow<UserSpec, ()>) -> User {
    let (meta, spec, ()) = split(r);
    User { meta, spec }
}

impl StateManager {
    /// Open the store at the configured database path
    pub fn open(config: &crate::config::DaemonConfig) -> Result<Self> {
        let db = Database::open(config.db_path())?;
        Ok(Self::with_database(db, config.allocation.clone()))
    }

    pub fn with_database(db: Database, allocation: AllocationConfig) -> Self {
        Self { db, allocation }
    }

    fn ensure_unique(&self, table: &str, kind: &str, name: &str) -> Result<()> {
        if self.db.name_exists(table, name)? {
            return Err(Error::AlreadyExists {
                kind: kind.to_string(),
                id: name.to_string(),
            });
        }
        Ok(())
    }

    // ========================================================================
    // Node operations
    // ========================================================================

    /// Create a node and carve its network range into unallocated networks.
    ///
    /// The node and all of its networks are written in one transaction.
    pub fn create_node(&self, name: String, spec: NodeSpec) -> Result<Node> {
        self.ensure_unique("nodes", "node", &name)?;

        let subnets = match &spec.network_range {
            Some(range) => subnet::split_range(range, self.allocation.subnet_prefix)?,
            None => Vec::new(),
        };

        let meta = ResourceMeta::new(name);
        let status = NodeStatus::default();
        self.db.with_transaction(|tx| {
            Database::insert_in(tx, "nodes", &meta.id, &meta.name, &spec, &status, &meta.labels)?;

            for net in &subnets {
                let net_meta = ResourceMeta::new(subnet::network_name(&meta.name, net));
                let net_spec = NetworkSpec {
                    subnet: *net,
                    node_id: meta.id.clone(),
                    user_id: None,
                };
                Database::insert_in(
                    tx,
                    "networks",
                    &net_meta.id,
                    &net_meta.name,
                    &net_spec,
                    &(),
                    &net_meta.labels,
                )?;
            }
            Ok(())
        })?;

        info!(
            "Created node {} ({}) with {} networks",
            meta.name,
            meta.id,
            subnets.len()
        );

        Ok(Node { meta, spec, status })
    }

    pub fn get_node(&self, id: &str) -> Result<Option<Node>> {
        Ok(self.db.get("nodes", id)?.map(node_from))
    }

    pub fn get_node_by_name(&self, name: &str) -> Result<Option<Node>> {
        Ok(self.db.get_by_name("nodes", name)?.map(node_from))
    }

    pub fn networks_for_node(&self, node_id: &str) -> Result<Vec<Network>> {
        let rows: Vec<ResourceRow<NetworkSpec, ()>> =
            self.db.list_where("networks", "node_id", node_id)?;
        Ok(rows.into_iter().map(network_from).collect())
    }

    // ========================================================================
    // Image and user operations
    // ========================================================================

    pub fn create_image(&self, name: String, spec: ImageSpec) -> Result<Image> {
        self.ensure_unique("images", "image", &name)?;
        let meta = ResourceMeta::new(name);
        self.db
            .insert("images", &meta.id, &meta.name, &spec, &(), &meta.labels)?;
        debug!("Created image: {} ({})", meta.name, spec.image);
        Ok(Image { meta, spec })
    }

    pub fn get_image_by_name(&self, name: &str) -> Result<Option<Image>> {
        Ok(self.db.get_by_name("images", name)?.map(image_from))
    }

    pub fn create_user(&self, username: String, display_name: String) -> Result<User> {
        self.ensure_unique("users", "user", &username)?;
        let meta = ResourceMeta::new(username);
        let spec = UserSpec { display_name };
        self.db
            .insert("users", &meta.id, &meta.name, &spec, &(), &meta.labels)?;
        debug!("Created user: {}", meta.name);
        Ok(User { meta, spec })
    }

    pub fn get_user_by_name(&self, username: &str) -> Result<Option<User>> {
        Ok(self.db.get_by_name("users", username)?.map(user_from))
    }

    /// Give the user one network on every node.
    ///
    /// Nodes where the user already owns a network keep it; nodes without a
    /// free subnet are skipped with a warning.
    pub fn assign_networks(&self, user_id: &str) -> Result<Vec<Network>> {
        let mut assigned = Vec::new();

        for node in self.list_nodes()? {
            let networks = self.networks_for_node(&node.meta.id)?;

            if let Some(owned) = networks
                .iter()
                .find(|n| n.spec.user_id.as_deref() == Some(user_id))
            {
                assigned.push(owned.clone());
                continue;
            }

            let Some(mut free) = networks.into_iter().find(|n| n.spec.user_id.is_none()) else {
                warn!(
                    "Unable to assign network to user {} on {}: no subnets left",
                    user_id, node.meta.name
                );
                continue;
            };

            free.spec.user_id = Some(user_id.to_string());
            self.db.update_spec("networks", &free.meta.id, &free.spec)?;
            debug!("Assigned {} to user {}", free.meta.name, user_id);
            assigned.push(free);
        }

        Ok(assigned)
    }

    // ========================================================================
    // Cubicle operations
    // ========================================================================

    /// Create a cubicle for `user` from `image` on `node`.
    ///
    /// The name is `<image>-<username>`, suffixed with `-duplicate-<n>` until
    /// unique; the noVNC port is the lowest free one on the node.
    pub fn add_cubicle(
        &self,
        user: &User,
        image: &Image,
        node: &Node,
        active: bool,
    ) -> Result<Cubicle> {
        let base = format!("{}-{}", image.meta.name, user.meta.name);
        let mut name = base.clone();
        let mut n = 1;
        while self.db.name_exists("cubicles", &name)? {
            name = format!("{}-duplicate-{}", base, n);
            n += 1;
        }

        let spec = CubicleSpec {
            active,
            user_id: user.meta.id.clone(),
            image_id: image.meta.id.clone(),
            node_id: node.meta.id.clone(),
            novnc_port: self.available_novnc_port(node)?,
        };

        let meta = ResourceMeta::new(name);
        self.db
            .insert("cubicles", &meta.id, &meta.name, &spec, &(), &meta.labels)?;

        info!(
            "Created cubicle {} on {} (novnc port {})",
            meta.name, node.meta.name, spec.novnc_port
        );

        Ok(Cubicle { meta, spec })
    }

    pub fn get_cubicle_by_name(&self, name: &str) -> Result<Option<Cubicle>> {
        Ok(self.db.get_by_name("cubicles", name)?.map(cubicle_from))
    }

    pub fn set_cubicle_active(&self, name: &str, active: bool) -> Result<Cubicle> {
        let mut cubicle = self
            .get_cubicle_by_name(name)?
            .ok_or_else(|| Error::not_found("cubicle", name))?;
        cubicle.spec.active = active;
        self.db
            .update_spec("cubicles", &cubicle.meta.id, &cubicle.spec)?;
        Ok(cubicle)
    }

    fn cubicles_on_node(&self, node_id: &str) -> Result<Vec<Cubicle>> {
        let rows: Vec<ResourceRow<CubicleSpec, ()>> =
            self.db.list_where("cubicles", "node_id", node_id)?;
        Ok(rows.into_iter().map(cubicle_from).collect())
    }

    /// Lowest noVNC port in the configured range not used on `node`
    pub fn available_novnc_port(&self, node: &Node) -> Result<u16> {
        let used: HashSet<u16> = self
            .cubicles_on_node(&node.meta.id)?
            .iter()
            .map(|c| c.spec.novnc_port)
            .collect();

        (self.allocation.novnc_port_min..self.allocation.novnc_port_max)
            .find(|port| !used.contains(port))
            .ok_or_else(|| Error::Exhausted {
                resource: "novnc port".to_string(),
                node: node.meta.name.clone(),
            })
    }
}

impl DesiredStateStore for StateManager {
    fn list_nodes(&self) -> Result<Vec<Node>> {
        let rows: Vec<ResourceRow<NodeSpec, NodeStatus>> = self.db.list("nodes")?;
        Ok(rows.into_iter().map(node_from).collect())
    }

    fn desired_cubicles(&self, node: &Node) -> Result<Vec<DesiredCubicle>> {
        let mut by_owner: HashMap<String, Network> = HashMap::new();
        for network in self.networks_for_node(&node.meta.id)? {
            if let Some(user_id) = network.spec.user_id.clone() {
                by_owner.entry(user_id).or_insert(network);
            }
        }

        let mut desired = Vec::new();
        for cubicle in self.cubicles_on_node(&node.meta.id)? {
            if !cubicle.spec.active {
                continue;
            }

            let owner = self.db.get("users", &cubicle.spec.user_id)?.map(user_from);
            let image = self.db.get("images", &cubicle.spec.image_id)?.map(image_from);
            let (Some(owner), Some(image)) = (owner, image) else {
                warn!(
                    "Cubicle {} on {} references a missing user or image, ignoring it",
                    cubicle.meta.name, node.meta.name
                );
                continue;
            };

            let network = by_owner.get(&owner.meta.id).cloned();
            desired.push(DesiredCubicle {
                cubicle,
                owner,
                image,
                network,
            });
        }

        Ok(desired)
    }

    fn record_node_status(
        &self,
        node_id: &str,
        state: NodeState,
        response_time_ms: Option<u64>,
    ) -> Result<()> {
        let found = self
            .db
            .modify_status::<NodeStatus, _>("nodes", node_id, |status| {
                status.state = state;
                status.response_time_ms = response_time_ms;
                if state == NodeState::Up {
                    status.last_activity = Some(chrono::Utc::now().timestamp());
                }
            })?;

        if !found {
            return Err(Error::not_found("node", node_id));
        }
        Ok(())
    }
}
