//! Desired vs. live comparison for one node

use crate::agent::{RemoteCubicle, RemoteNetwork};
use divisora_common::{DesiredCubicle, Network};
use std::collections::HashSet;

/// A missing cubicle together with the network it must join
#[derive(Debug, Clone)]
pub struct PlannedCubicle {
    pub desired: DesiredCubicle,
    pub network: Network,
}

/// Remediation for one node, in the order it must be applied
#[derive(Debug, Clone, Default)]
pub struct NodePlan {
    /// Networks to create before any cubicle, each listed once
    pub networks: Vec<Network>,
    /// Missing cubicles, in store order
    pub cubicles: Vec<PlannedCubicle>,
    /// Missing cubicles whose owner has no network on this node
    pub unplaceable: Vec<String>,
    /// Running remotely but not desired
    pub orphaned: Vec<String>,
}

/// Desired cubicles absent from the live listing, matched by name
pub fn missing_cubicles<'a>(
    desired: &'a [DesiredCubicle],
    live: &[RemoteCubicle],
) -> Vec<&'a DesiredCubicle> {
    let live: HashSet<&str> = live.iter().map(|c| c.name.as_str()).collect();
    desired.iter().filter(|d| !live.contains(d.name())).collect()
}

/// Live cubicle names that are not desired, first occurrence order
pub fn orphaned_cubicles(desired: &[DesiredCubicle], live: &[RemoteCubicle]) -> Vec<String> {
    let wanted: HashSet<&str> = desired.iter().map(|d| d.name()).collect();
    let mut seen = HashSet::new();
    live.iter()
        .filter(|c| !wanted.contains(c.name.as_str()) && seen.insert(c.name.as_str()))
        .map(|c| c.name.clone())
        .collect()
}

/// Work out which networks and cubicles a node needs
pub fn plan(
    desired: &[DesiredCubicle],
    live_cubicles: &[RemoteCubicle],
    live_networks: &[RemoteNetwork],
) -> NodePlan {
    let live_networks: HashSet<&str> = live_networks.iter().map(|n| n.name.as_str()).collect();
    let mut queued: HashSet<String> = HashSet::new();
    let mut plan = NodePlan {
        orphaned: orphaned_cubicles(desired, live_cubicles),
        ..NodePlan::default()
    };

    for missing in missing_cubicles(desired, live_cubicles) {
        let Some(network) = missing.network.clone() else {
            plan.unplaceable.push(missing.name().to_string());
            continue;
        };

        if !live_networks.contains(network.meta.name.as_str())
            && queued.insert(network.meta.name.clone())
        {
            plan.networks.push(network.clone());
        }

        plan.cubicles.push(PlannedCubicle {
            desired: missing.clone(),
            network,
        });
    }

    plan
}
