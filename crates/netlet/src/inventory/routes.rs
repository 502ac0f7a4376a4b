//! Default-gateway discovery. The interface that carries the node's default
//! route is the primary network interface of the node and is never published
//! as an allocatable device.

use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, Ipv6Addr};

use futures::TryStreamExt;
use rtnetlink::packet_route::link::LinkAttribute;
use rtnetlink::packet_route::route::{RouteAttribute, RouteMessage};
use rtnetlink::{Handle, RouteMessageBuilder};
use tracing::debug;

const RT_TABLE_MAIN: u32 = 254;

fn route_table(message: &RouteMessage) -> u32 {
    for attribute in &message.attributes {
        if let RouteAttribute::Table(table) = attribute {
            return *table;
        }
    }
    u32::from(message.header.table)
}

/// Collects the output interface indexes of every main-table route that has
/// a gateway, including the next hops of multipath routes.
fn gateway_interfaces(message: &RouteMessage) -> Vec<u32> {
    if route_table(message) != RT_TABLE_MAIN {
        return Vec::new();
    }

    let mut oif = None;
    let mut has_gateway = false;
    let mut interfaces = Vec::new();
    for attribute in &message.attributes {
        match attribute {
            RouteAttribute::Oif(index) => oif = Some(*index),
            RouteAttribute::Gateway(_) => has_gateway = true,
            RouteAttribute::MultiPath(next_hops) => {
                for hop in next_hops {
                    let hop_has_gw = hop
                        .attributes
                        .iter()
                        .any(|a| matches!(a, RouteAttribute::Gateway(_)));
                    if hop_has_gw {
                        interfaces.push(u32::from(hop.interface_index));
                    }
                }
            }
            _ => {}
        }
    }
    if has_gateway {
        if let Some(index) = oif {
            interfaces.push(index);
        }
    }
    interfaces
}

/// Returns the names of the interfaces the default routes point out of.
pub async fn default_gateway_interfaces(handle: &Handle) -> HashSet<String> {
    let mut indexes: HashSet<u32> = HashSet::new();

    for message in [
        RouteMessageBuilder::<Ipv4Addr>::new().build(),
        RouteMessageBuilder::<Ipv6Addr>::new().build(),
    ] {
        let mut response = handle.route().get(message).execute();
        loop {
            match response.try_next().await {
                Ok(Some(route)) => indexes.extend(gateway_interfaces(&route)),
                Ok(None) => break,
                Err(err) => {
                    debug!(error = %err, "could not list routes");
                    break;
                }
            }
        }
    }

    if indexes.is_empty() {
        return HashSet::new();
    }

    // Resolve indexes to names with a single link dump.
    let mut names_by_index: HashMap<u32, String> = HashMap::new();
    let mut links = handle.link().get().execute();
    loop {
        match links.try_next().await {
            Ok(Some(link)) => {
                for attribute in &link.attributes {
                    if let LinkAttribute::IfName(name) = attribute {
                        names_by_index.insert(link.header.index, name.clone());
                    }
                }
            }
            Ok(None) => break,
            Err(err) => {
                debug!(error = %err, "could not list links");
                break;
            }
        }
    }

    let interfaces: HashSet<String> = indexes
        .into_iter()
        .filter_map(|index| names_by_index.get(&index).cloned())
        .collect();
    debug!(?interfaces, "default gateway interfaces");
    interfaces
}
