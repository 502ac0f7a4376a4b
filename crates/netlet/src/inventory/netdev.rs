//! Link and address facts gathered through the root-namespace rtnetlink
//! handle. These are the mutable attributes of a device; they are only
//! observable while the interface is still in the root namespace.

use std::net::IpAddr;

use futures::TryStreamExt;
use rtnetlink::packet_route::link::{InfoKind, LinkAttribute, LinkInfo, State};
use rtnetlink::Handle;
use tracing::debug;

/// Facts read from one `RTM_GETLINK` answer.
#[derive(Debug, Clone, Default)]
pub struct LinkFacts {
    pub index: u32,
    pub mac: Option<String>,
    pub mtu: Option<i64>,
    pub encapsulation: String,
    pub alias: Option<String>,
    pub oper_state: String,
    pub kind: Option<String>,
}

fn format_mac(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

fn oper_state_name(state: &State) -> String {
    match state {
        State::Up => "up".to_string(),
        State::Down => "down".to_string(),
        State::Dormant => "dormant".to_string(),
        State::LowerLayerDown => "lowerlayerdown".to_string(),
        State::NotPresent => "notpresent".to_string(),
        State::Testing => "testing".to_string(),
        other => format!("{other:?}").to_lowercase(),
    }
}

fn info_kind_name(kind: &InfoKind) -> String {
    match kind {
        InfoKind::Other(name) => name.clone(),
        other => format!("{other:?}").to_lowercase(),
    }
}

/// Queries the link with the given interface name. `None` when the link is
/// not visible in the namespace the handle was created in.
pub async fn link_facts(handle: &Handle, ifname: &str) -> Option<LinkFacts> {
    let mut response = handle
        .link()
        .get()
        .match_name(ifname.to_string())
        .execute();
    let message = match response.try_next().await {
        Ok(Some(message)) => message,
        Ok(None) => return None,
        Err(err) => {
            debug!(interface = %ifname, error = %err, "could not get link");
            return None;
        }
    };

    let mut facts = LinkFacts {
        index: message.header.index,
        encapsulation: format!("{:?}", message.header.link_layer_type).to_lowercase(),
        oper_state: "unknown".to_string(),
        ..Default::default()
    };
    for attribute in &message.attributes {
        match attribute {
            LinkAttribute::Address(mac) => facts.mac = Some(format_mac(mac)),
            LinkAttribute::Mtu(mtu) => facts.mtu = Some(i64::from(*mtu)),
            LinkAttribute::IfAlias(alias) => facts.alias = Some(alias.clone()),
            LinkAttribute::OperState(state) => facts.oper_state = oper_state_name(state),
            LinkAttribute::LinkInfo(infos) => {
                for info in infos {
                    if let LinkInfo::Kind(kind) = info {
                        facts.kind = Some(info_kind_name(kind));
                    }
                }
            }
            _ => {}
        }
    }
    Some(facts)
}

/// Global unicast check matching the semantics the catalog wants: loopback,
/// link-local, multicast and unspecified addresses are not published.
pub fn is_global_unicast(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !v4.is_loopback()
                && !v4.is_link_local()
                && !v4.is_multicast()
                && !v4.is_broadcast()
                && !v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            !v6.is_loopback()
                && !v6.is_multicast()
                && !v6.is_unspecified()
                // fe80::/10
                && (v6.segments()[0] & 0xffc0) != 0xfe80
        }
    }
}

/// Lists the global unicast addresses assigned to the link, split into the
/// v4 and v6 sets, formatted without the prefix length.
pub async fn link_addresses(handle: &Handle, index: u32) -> (Vec<String>, Vec<String>) {
    let mut v4 = Vec::new();
    let mut v6 = Vec::new();
    let mut response = handle
        .address()
        .get()
        .set_link_index_filter(index)
        .execute();
    loop {
        let message = match response.try_next().await {
            Ok(Some(message)) => message,
            Ok(None) => break,
            Err(err) => {
                debug!(index, error = %err, "could not list addresses");
                break;
            }
        };
        for attribute in &message.attributes {
            if let rtnetlink::packet_route::address::AddressAttribute::Address(ip) = attribute {
                if !is_global_unicast(ip) {
                    continue;
                }
                match ip {
                    IpAddr::V4(addr) => v4.push(addr.to_string()),
                    IpAddr::V6(addr) => v6.push(addr.to_string()),
                }
            }
        }
    }
    v4.sort();
    v4.dedup();
    v6.sort();
    v6.dedup();
    (v4, v6)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_unicast_filters_special_ranges() {
        let global: IpAddr = "192.168.1.10".parse().unwrap();
        let loopback: IpAddr = "127.0.0.1".parse().unwrap();
        let link_local: IpAddr = "169.254.0.5".parse().unwrap();
        let v6_global: IpAddr = "2001:db8::1".parse().unwrap();
        let v6_link_local: IpAddr = "fe80::1".parse().unwrap();

        assert!(is_global_unicast(&global));
        assert!(!is_global_unicast(&loopback));
        assert!(!is_global_unicast(&link_local));
        assert!(is_global_unicast(&v6_global));
        assert!(!is_global_unicast(&v6_link_local));
    }

    #[test]
    fn mac_formatting() {
        assert_eq!(
            format_mac(&[0xaa, 0xbb, 0xcc, 0x00, 0x11, 0x22]),
            "aa:bb:cc:00:11:22"
        );
    }
}
