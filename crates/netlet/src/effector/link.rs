//! Netlink programming of links, addresses, routes, neighbors and rules.
//! Everything here is written to converge: operations that find their work
//! already done (EEXIST, duplicate route) succeed silently so a retried
//! attach ends in the same kernel state.

use std::collections::HashSet;
use std::net::IpAddr;
use std::os::fd::RawFd;

use anyhow::{anyhow, Context, Result};
use futures::TryStreamExt;
use rtnetlink::packet_route::link::LinkAttribute;
use rtnetlink::packet_route::neighbour::NeighbourState;
use rtnetlink::packet_route::route::{RouteAddress, RouteAttribute, RouteScope};
use rtnetlink::packet_route::rule::RuleAction;
use rtnetlink::packet_route::AddressFamily;
use rtnetlink::{Handle, LinkUnspec, RouteMessageBuilder};
use tracing::debug;

use crate::inventory::ebpf;
use crate::netconfig::{parse_mac, NetworkConfig, RouteConfig};

/// Whether the rtnetlink error is the given errno.
fn is_errno(err: &rtnetlink::Error, code: i32) -> bool {
    match err {
        rtnetlink::Error::NetlinkError(message) => message.raw_code() == -code,
        _ => false,
    }
}

/// Collapses EEXIST to success: the desired state is already in place.
fn tolerate_exists(result: Result<(), rtnetlink::Error>, what: impl Fn() -> String) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(err) if is_errno(&err, libc::EEXIST) => {
            debug!("{} already present", what());
            Ok(())
        }
        Err(err) => Err(anyhow!("{} failed: {err}", what())),
    }
}

/// Index of the link with the given name in the namespace the handle
/// observes, or `None` when it does not exist there.
pub async fn link_index_by_name(handle: &Handle, name: &str) -> Result<Option<u32>> {
    let mut response = handle.link().get().match_name(name.to_string()).execute();
    match response.try_next().await {
        Ok(Some(message)) => Ok(Some(message.header.index)),
        Ok(None) => Ok(None),
        Err(err) if is_errno(&err, libc::ENODEV) => Ok(None),
        Err(err) => Err(anyhow!("could not look up link {name}: {err}")),
    }
}

/// Moves a link into the namespace behind `ns_fd`, optionally renaming it in
/// the same request. Runs against whatever namespace the handle lives in.
pub async fn move_link_to_fd(
    handle: &Handle,
    ifname: &str,
    new_name: Option<&str>,
    ns_fd: RawFd,
) -> Result<()> {
    let index = link_index_by_name(handle, ifname)
        .await?
        .ok_or_else(|| anyhow!("link not found for interface {ifname}"))?;

    let mut builder = LinkUnspec::new_with_index(index).setns_by_fd(ns_fd);
    if let Some(new_name) = new_name {
        if new_name != ifname {
            builder = builder.name(new_name.to_string());
        }
    }
    handle
        .link()
        .set(builder.build())
        .execute()
        .await
        .with_context(|| format!("failed to move link {ifname}"))?;
    Ok(())
}

/// Orders routes so that link-scope routes are installed before
/// universe-scope ones. Universe routes may depend on a link route for their
/// gateway, e.g. on GCE VMs:
///
/// ```text
/// # ip addr show eth0
///   inet 10.0.5.8/32 scope global dynamic eth0
/// # ip route show dev eth0
///   10.0.5.0/24 via 10.0.5.1 proto dhcp src 10.0.5.8
///   10.0.5.1 proto dhcp scope link src 10.0.5.8
/// ```
pub fn order_routes(routes: &[RouteConfig]) -> Vec<&RouteConfig> {
    let mut ordered: Vec<&RouteConfig> = routes.iter().collect();
    ordered.sort_by(|a, b| b.scope.cmp(&a.scope));
    ordered
}

fn parse_destination(destination: &str) -> Result<(IpAddr, u8)> {
    if let Some((addr, prefix)) = destination.split_once('/') {
        let addr: IpAddr = addr
            .parse()
            .with_context(|| format!("invalid destination {destination}"))?;
        let prefix: u8 = prefix
            .parse()
            .with_context(|| format!("invalid destination {destination}"))?;
        return Ok((addr, prefix));
    }
    let addr: IpAddr = destination
        .parse()
        .with_context(|| format!("invalid destination {destination}"))?;
    let prefix = match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    };
    Ok((addr, prefix))
}

fn route_address_to_ip(address: &RouteAddress) -> Option<IpAddr> {
    match address {
        RouteAddress::Inet(addr) => Some(IpAddr::V4(*addr)),
        RouteAddress::Inet6(addr) => Some(IpAddr::V6(*addr)),
        _ => None,
    }
}

/// Key identifying a route for duplicate detection: output interface,
/// destination, prefix length and gateway.
type RouteKey = (u32, Option<IpAddr>, u8, Option<IpAddr>);

async fn existing_routes(handle: &Handle, family: AddressFamily) -> Result<HashSet<RouteKey>> {
    let message = match family {
        AddressFamily::Inet6 => RouteMessageBuilder::<std::net::Ipv6Addr>::new().build(),
        _ => RouteMessageBuilder::<std::net::Ipv4Addr>::new().build(),
    };
    let mut routes = HashSet::new();
    let mut response = handle.route().get(message).execute();
    while let Some(route) = response.try_next().await.context("failed to list routes")? {
        let mut oif = 0;
        let mut destination = None;
        let mut gateway = None;
        for attribute in &route.attributes {
            match attribute {
                RouteAttribute::Oif(index) => oif = *index,
                RouteAttribute::Destination(address) => {
                    destination = route_address_to_ip(address)
                }
                RouteAttribute::Gateway(address) => gateway = route_address_to_ip(address),
                _ => {}
            }
        }
        routes.insert((
            oif,
            destination,
            route.header.destination_prefix_length,
            gateway,
        ));
    }
    Ok(routes)
}

async fn add_route(
    handle: &Handle,
    index: u32,
    route: &RouteConfig,
    existing_v4: &HashSet<RouteKey>,
    existing_v6: &HashSet<RouteKey>,
) -> Result<()> {
    let (destination, prefix) = parse_destination(&route.destination)?;
    let gateway: Option<IpAddr> = match &route.gateway {
        Some(gateway) => Some(
            gateway
                .parse()
                .with_context(|| format!("invalid gateway {gateway}"))?,
        ),
        None => None,
    };
    let source: Option<IpAddr> = match &route.source {
        Some(source) => Some(
            source
                .parse()
                .with_context(|| format!("invalid source {source}"))?,
        ),
        None => None,
    };

    let existing = match destination {
        IpAddr::V4(_) => existing_v4,
        IpAddr::V6(_) => existing_v6,
    };
    if existing.contains(&(index, Some(destination), prefix, gateway)) {
        debug!(destination = %route.destination, "route already present");
        return Ok(());
    }

    let scope = RouteScope::from(route.scope);
    let table = route.table.unwrap_or(254);
    let message = match destination {
        IpAddr::V4(v4) => {
            let mut builder = RouteMessageBuilder::<std::net::Ipv4Addr>::new()
                .destination_prefix(v4, prefix)
                .output_interface(index)
                .table_id(table)
                .scope(scope);
            if let Some(IpAddr::V4(gw)) = gateway {
                builder = builder.gateway(gw);
            } else if gateway.is_some() {
                return Err(anyhow!(
                    "gateway family does not match destination {}",
                    route.destination
                ));
            }
            if let Some(IpAddr::V4(src)) = source {
                builder = builder.pref_source(src);
            }
            builder.build()
        }
        IpAddr::V6(v6) => {
            let mut builder = RouteMessageBuilder::<std::net::Ipv6Addr>::new()
                .destination_prefix(v6, prefix)
                .output_interface(index)
                .table_id(table)
                .scope(scope);
            if let Some(IpAddr::V6(gw)) = gateway {
                builder = builder.gateway(gw);
            } else if gateway.is_some() {
                return Err(anyhow!(
                    "gateway family does not match destination {}",
                    route.destination
                ));
            }
            if let Some(IpAddr::V6(src)) = source {
                builder = builder.pref_source(src);
            }
            builder.build()
        }
    };

    tolerate_exists(
        handle.route().add(message).execute().await,
        || format!("route {} via {:?}", route.destination, route.gateway),
    )
}

/// Applies the desired configuration to the link named `target` inside the
/// namespace the handle observes: link-level settings first, then addresses,
/// then routing state. Item-level errors are collected so one bad route does
/// not stop the rest; the combined error is returned at the end.
pub async fn apply_interface_config(
    handle: &Handle,
    target: &str,
    config: &NetworkConfig,
) -> Result<()> {
    let index = link_index_by_name(handle, target)
        .await?
        .ok_or_else(|| anyhow!("link not found for interface {target}"))?;

    let mut errors: Vec<String> = Vec::new();

    let mut builder = LinkUnspec::new_with_index(index);
    if let Some(mac) = &config.interface.hardware_addr {
        let bytes = parse_mac(mac).ok_or_else(|| anyhow!("invalid hardware address {mac}"))?;
        builder = builder.address(bytes.to_vec());
    }
    if let Some(mtu) = config.interface.mtu {
        builder = builder.mtu(mtu);
    }
    let mut message = builder.up().build();
    if let Some(size) = config.interface.gso_max_size {
        message.attributes.push(LinkAttribute::GsoMaxSize(size));
    }
    if let Some(size) = config.interface.gro_max_size {
        message.attributes.push(LinkAttribute::GroMaxSize(size));
    }
    if let Some(size) = config.interface.gso_ipv4_max_size {
        message.attributes.push(LinkAttribute::GsoIpv4MaxSize(size));
    }
    if let Some(size) = config.interface.gro_ipv4_max_size {
        message.attributes.push(LinkAttribute::GroIpv4MaxSize(size));
    }
    handle
        .link()
        .set(message)
        .execute()
        .await
        .with_context(|| format!("failed to configure link {target}"))?;

    if let Some(ethtool) = &config.ethtool {
        let features: std::collections::HashMap<String, bool> =
            ethtool.features.iter().map(|(k, v)| (k.clone(), *v)).collect();
        if let Err(err) = super::ethtool::set_features(target, &features) {
            errors.push(format!("ethtool features: {err}"));
        }
    }

    if config.interface.disable_ebpf_programs {
        if let Err(err) = ebpf::remove_tc_filters(index) {
            errors.push(format!("removing tc filters: {err}"));
        }
    }

    for address in &config.interface.addresses {
        match parse_destination(address) {
            Err(err) => errors.push(err.to_string()),
            Ok((ip, prefix)) => {
                if let Err(err) = tolerate_exists(
                    handle.address().add(index, ip, prefix).execute().await,
                    || format!("address {address} on {target}"),
                ) {
                    errors.push(err.to_string());
                }
            }
        }
    }

    let existing_v4 = existing_routes(handle, AddressFamily::Inet)
        .await
        .unwrap_or_default();
    let existing_v6 = existing_routes(handle, AddressFamily::Inet6)
        .await
        .unwrap_or_default();
    for route in order_routes(&config.routes) {
        if let Err(err) = add_route(handle, index, route, &existing_v4, &existing_v6).await {
            errors.push(err.to_string());
        }
    }

    for neighbor in &config.neighbors {
        let destination: IpAddr = match neighbor.destination.parse() {
            Ok(ip) => ip,
            Err(_) => {
                errors.push(format!("invalid ip address: {}", neighbor.destination));
                continue;
            }
        };
        let mac = match parse_mac(&neighbor.hardware_addr) {
            Some(mac) => mac,
            None => {
                errors.push(format!("invalid mac address: {}", neighbor.hardware_addr));
                continue;
            }
        };
        if let Err(err) = tolerate_exists(
            handle
                .neighbours()
                .add(index, destination)
                .link_local_address(&mac)
                .state(NeighbourState::Permanent)
                .execute()
                .await,
            || format!("neighbor {} ({})", neighbor.destination, neighbor.hardware_addr),
        ) {
            errors.push(err.to_string());
        }
    }

    for rule in &config.rules {
        let mut request = handle.rule().add().action(RuleAction::ToTable);

        let source = match &rule.source {
            Some(source) => match parse_destination(source) {
                Err(err) => {
                    errors.push(err.to_string());
                    continue;
                }
                Ok(parsed) => Some(parsed),
            },
            None => None,
        };
        let destination = match &rule.destination {
            Some(destination) => match parse_destination(destination) {
                Err(err) => {
                    errors.push(err.to_string());
                    continue;
                }
                Ok(parsed) => Some(parsed),
            },
            None => None,
        };
        let is_v6 = destination
            .map(|(ip, _)| ip.is_ipv6())
            .or_else(|| source.map(|(ip, _)| ip.is_ipv6()))
            .unwrap_or(false);

        if let Some(priority) = rule.priority {
            request = request.priority(priority);
        }
        if let Some(table) = rule.table {
            request = request.table_id(table);
        }

        let result = if is_v6 {
            let mut request = request.v6();
            if let Some((IpAddr::V6(addr), prefix)) = source {
                request = request.source_prefix(addr, prefix);
            }
            if let Some((IpAddr::V6(addr), prefix)) = destination {
                request = request.destination_prefix(addr, prefix);
            }
            request.execute().await
        } else {
            let mut request = request.v4();
            if let Some((IpAddr::V4(addr), prefix)) = source {
                request = request.source_prefix(addr, prefix);
            }
            if let Some((IpAddr::V4(addr), prefix)) = destination {
                request = request.destination_prefix(addr, prefix);
            }
            request.execute().await
        };

        if let Err(err) = tolerate_exists(result, || {
            format!("rule priority {:?} table {:?}", rule.priority, rule.table)
        }) {
            errors.push(err.to_string());
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(anyhow!(
            "configuring {target}: {}",
            errors.join("; ")
        ))
    }
}
