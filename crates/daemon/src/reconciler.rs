//! Reconciliation loop
//!
//! Every tick probes each node, compares the store's active cubicles with
//! what the node agent reports, and creates whatever is missing. A failure
//! on one node or cubicle is logged and recorded, never propagated.

use crate::agent::{CreateCubicleRequest, CreateNetworkRequest, NodeAgent};
use crate::config::{DaemonConfig, OrphanPolicy, ReconcileConfig};
use crate::diff;
use crate::probe::Prober;
use crate::state::DesiredStateStore;
use divisora_common::{Node, NodeState};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// A failed step on one node
#[derive(Debug, Clone, Serialize)]
pub struct Failure {
    pub operation: String,
    pub message: String,
}

/// A missing cubicle that was not created this tick
#[derive(Debug, Clone, Serialize)]
pub struct SkippedCubicle {
    pub name: String,
    pub reason: String,
}

/// What one tick did to one node
#[derive(Debug, Clone, Serialize)]
pub struct NodeReport {
    pub node: String,
    pub url: String,
    pub state: NodeState,
    pub networks_created: Vec<String>,
    pub cubicles_created: Vec<String>,
    pub skipped: Vec<SkippedCubicle>,
    pub orphaned: Vec<String>,
    pub failures: Vec<Failure>,
}

impl NodeReport {
    fn new(node: &Node) -> Self {
        Self {
            node: node.meta.name.clone(),
            url: node.base_url(),
            state: NodeState::Unknown,
            networks_created: Vec::new(),
            cubicles_created: Vec::new(),
            skipped: Vec::new(),
            orphaned: Vec::new(),
            failures: Vec::new(),
        }
    }

    fn fail(&mut self, operation: &str, message: impl ToString) {
        let message = message.to_string();
        warn!(
            "{} on {} ({}) failed: {}",
            operation, self.node, self.url, message
        );
        self.failures.push(Failure {
            operation: operation.to_string(),
            message,
        });
    }

    fn skip(&mut self, name: &str, reason: impl ToString) {
        self.skipped.push(SkippedCubicle {
            name: name.to_string(),
            reason: reason.to_string(),
        });
    }
}

/// Outcome of one reconciliation tick
#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    pub tick: u64,
    /// Another tick was still running
    pub skipped: bool,
    /// The node list could not be loaded
    pub error: Option<String>,
    pub nodes: Vec<NodeReport>,
}

impl TickReport {
    pub fn created(&self) -> usize {
        self.nodes
            .iter()
            .map(|n| n.networks_created.len() + n.cubicles_created.len())
            .sum()
    }

    pub fn failed(&self) -> usize {
        self.nodes.iter().map(|n| n.failures.len()).sum()
    }
}

/// Reconciler that drives every node toward the stored desired state
pub struct Reconciler {
    store: Arc<dyn DesiredStateStore>,
    agent: Arc<dyn NodeAgent>,
    prober: Arc<dyn Prober>,
    config: ReconcileConfig,
    hostname_domain: String,
    running: Mutex<()>,
    ticks: AtomicU64,
}

impl Reconciler {
    /// Create a new reconciler
    pub fn new(
        store: Arc<dyn DesiredStateStore>,
        agent: Arc<dyn NodeAgent>,
        prober: Arc<dyn Prober>,
        config: &DaemonConfig,
    ) -> Self {
        Self {
            store,
            agent,
            prober,
            config: config.reconcile.clone(),
            hostname_domain: config.agent.hostname_domain.clone(),
            running: Mutex::new(()),
            ticks: AtomicU64::new(0),
        }
    }

    /// Run the reconciliation loop
    pub async fn run(&self) {
        info!(
            "Reconciler started, interval {:?}, {} nodes in parallel",
            self.config.interval(),
            self.config.node_concurrency
        );

        let mut interval = tokio::time::interval(self.config.interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            interval.tick().await;
            let report = self.tick().await;
            if let Some(e) = &report.error {
                error!("Reconciliation tick {} failed: {}", report.tick, e);
            } else if !report.skipped {
                debug!(
                    "Tick {} done: {} nodes, {} created, {} failures",
                    report.tick,
                    report.nodes.len(),
                    report.created(),
                    report.failed()
                );
            }
        }
    }

    /// Run one tick over every node.
    ///
    /// Returns immediately with `skipped` set when another tick holds the
    /// reconciler.
    pub async fn tick(&self) -> TickReport {
        let tick = self.ticks.fetch_add(1, Ordering::Relaxed) + 1;

        let Ok(_running) = self.running.try_lock() else {
            warn!("Tick {} skipped: previous tick still running", tick);
            return TickReport {
                tick,
                skipped: true,
                ..TickReport::default()
            };
        };

        async {
            let nodes = match self.store.list_nodes() {
                Ok(nodes) => nodes,
                Err(e) => {
                    return TickReport {
                        tick,
                        error: Some(e.to_string()),
                        ..TickReport::default()
                    }
                }
            };

            let nodes = stream::iter(nodes)
                .map(|node| self.reconcile_node(node))
                .buffered(self.config.node_concurrency.max(1))
                .collect::<Vec<_>>()
                .await;

            TickReport {
                tick,
                nodes,
                ..TickReport::default()
            }
        }
        .instrument(info_span!("tick", tick))
        .await
    }

    async fn reconcile_node(&self, node: Node) -> NodeReport {
        let span = info_span!("node", node = %node.meta.name);
        async {
            let mut report = NodeReport::new(&node);
            self.probe(&node, &mut report).await;
            self.converge(&node, &mut report).await;
            report
        }
        .instrument(span)
        .await
    }

    async fn probe(&self, node: &Node, report: &mut NodeReport) {
        let outcome = self.prober.probe(node).await;
        report.state = outcome.state;

        if outcome.state != node.status.state {
            info!(
                "Node {} ({}) is now {} (was {})",
                node.meta.name, report.url, outcome.state, node.status.state
            );
        }

        if let Err(e) = self.store.record_node_status(
            &node.meta.id,
            outcome.state,
            outcome.response_time_ms(),
        ) {
            report.fail("record status", e);
        }
    }

    async fn converge(&self, node: &Node, report: &mut NodeReport) {
        let live_cubicles = match self.agent.list_cubicles(node).await {
            Ok(cubicles) => cubicles,
            Err(e) => {
                report.fail("list cubicles", e);
                return;
            }
        };

        let live_networks = match self.agent.list_networks(node).await {
            Ok(networks) => networks,
            Err(e) => {
                report.fail("list networks", e);
                return;
            }
        };

        let desired = match self.store.desired_cubicles(node) {
            Ok(desired) => desired,
            Err(e) => {
                report.fail("load desired cubicles", e);
                return;
            }
        };

        let plan = diff::plan(&desired, &live_cubicles, &live_networks);

        for name in &plan.unplaceable {
            warn!(
                "Cubicle {} is not running on {} but its owner has no network there",
                name, node.meta.name
            );
            report.skip(name, "owner has no network on this node");
        }

        let mut failed_networks = HashSet::new();
        for network in &plan.networks {
            info!("Network {} missing on {}, creating it", network.meta.name, node.meta.name);

            let result = match CreateNetworkRequest::for_network(network) {
                Ok(request) => self
                    .agent
                    .create_network(node, &request)
                    .await
                    .map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };

            match result {
                Ok(body) => {
                    info!("Network {} created on {}: {}", network.meta.name, node.meta.name, body);
                    report.networks_created.push(network.meta.name.clone());
                }
                Err(e) => {
                    report.fail(&format!("create network {}", network.meta.name), e);
                    failed_networks.insert(network.meta.name.clone());
                }
            }
        }

        for planned in &plan.cubicles {
            let name = planned.desired.name();

            if failed_networks.contains(&planned.network.meta.name) {
                report.skip(
                    name,
                    format!("network {} could not be created", planned.network.meta.name),
                );
                continue;
            }

            info!("Cubicle {} is not running on {}, starting it", name, node.meta.name);
            let request =
                CreateCubicleRequest::new(&planned.desired, &planned.network, &self.hostname_domain);

            match self.agent.create_cubicle(node, &request).await {
                Ok(body) => {
                    info!("Cubicle {} started on {}: {}", name, node.meta.name, body);
                    report.cubicles_created.push(name.to_string());
                }
                Err(e) => report.fail(&format!("create cubicle {}", name), e),
            }
        }

        if self.config.orphan_policy == OrphanPolicy::Report {
            for name in &plan.orphaned {
                warn!(
                    "Cubicle {} runs on {} ({}) but is not wanted there",
                    name, node.meta.name, report.url
                );
            }
            report.orphaned = plan.orphaned;
        }
    }
}
