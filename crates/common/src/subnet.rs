//! Subnet arithmetic for per-user networks

use crate::{Error, Result};
use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Upper bound on subnets produced from one node range
pub const MAX_SUBNETS: u64 = 65_536;

fn invalid(subnet: &IpNetwork, reason: impl Into<String>) -> Error {
    Error::InvalidSubnet {
        subnet: subnet.to_string(),
        reason: reason.into(),
    }
}

fn host_mask_v4(prefix: u8) -> u32 {
    u32::MAX.checked_shr(prefix as u32).unwrap_or(0)
}

fn host_mask_v6(prefix: u8) -> u128 {
    u128::MAX.checked_shr(prefix as u32).unwrap_or(0)
}

/// Gateway handed to the node agent: the second-to-last address of the subnet.
pub fn gateway_for(subnet: &IpNetwork) -> Result<IpAddr> {
    match subnet {
        IpNetwork::V4(net) if net.prefix() < 32 => {
            Ok(IpAddr::V4(Ipv4Addr::from(u32::from(net.broadcast()) - 1)))
        }
        IpNetwork::V6(net) if net.prefix() < 128 => {
            Ok(IpAddr::V6(Ipv6Addr::from(u128::from(net.broadcast()) - 1)))
        }
        _ => Err(invalid(subnet, "needs at least two addresses")),
    }
}

/// Split `range` into consecutive subnets of length `prefix`.
pub fn split_range(range: &IpNetwork, prefix: u8) -> Result<Vec<IpNetwork>> {
    let max_prefix = if range.is_ipv4() { 32 } else { 128 };
    if prefix < range.prefix() || prefix > max_prefix {
        return Err(invalid(
            range,
            format!("cannot split into /{} subnets", prefix),
        ));
    }
    if prefix == max_prefix {
        return Err(invalid(
            range,
            format!("/{} subnets leave no room for a gateway", prefix),
        ));
    }

    let bits = (prefix - range.prefix()) as u32;
    let count = 1u64.checked_shl(bits).filter(|c| *c <= MAX_SUBNETS).ok_or_else(|| {
        invalid(range, format!("more than {} subnets of /{}", MAX_SUBNETS, prefix))
    })?;

    let mut subnets = Vec::with_capacity(count as usize);
    match range {
        IpNetwork::V4(net) => {
            let base = u32::from(net.network());
            let step = host_mask_v4(prefix).wrapping_add(1);
            for i in 0..count as u32 {
                let addr = Ipv4Addr::from(base.wrapping_add(i.wrapping_mul(step)));
                let subnet = Ipv4Network::new(addr, prefix)
                    .map_err(|e| invalid(range, e.to_string()))?;
                subnets.push(IpNetwork::V4(subnet));
            }
        }
        IpNetwork::V6(net) => {
            let base = u128::from(net.network());
            let step = host_mask_v6(prefix).wrapping_add(1);
            for i in 0..count as u128 {
                let addr = Ipv6Addr::from(base.wrapping_add(i.wrapping_mul(step)));
                let subnet = Ipv6Network::new(addr, prefix)
                    .map_err(|e| invalid(range, e.to_string()))?;
                subnets.push(IpNetwork::V6(subnet));
            }
        }
    }

    Ok(subnets)
}

/// Store name of a generated network, e.g. `Network_Node-1_192_168_0_64_26`
pub fn network_name(node_name: &str, subnet: &IpNetwork) -> String {
    let flat: String = subnet
        .to_string()
        .chars()
        .map(|c| if matches!(c, '.' | '/' | ':') { '_' } else { c })
        .collect();
    format!("Network_{}_{}", node_name, flat)
}
