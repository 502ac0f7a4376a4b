//! Parsing and validation of opaque claim configuration. Parse errors are
//! fatal for the claim; semantic errors are collected so the operator sees
//! every problem at once.

use std::net::IpAddr;

use thiserror::Error;

use super::{NetworkConfig, RT_SCOPE_LINK, RT_SCOPE_UNIVERSE};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to unmarshal config data: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// Parses a CIDR of the form `addr/prefix`.
fn parse_cidr(s: &str) -> Option<(IpAddr, u8)> {
    let (addr, prefix) = s.split_once('/')?;
    let addr: IpAddr = addr.parse().ok()?;
    let prefix: u8 = prefix.parse().ok()?;
    let max = match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    };
    if prefix > max {
        return None;
    }
    Some((addr, prefix))
}

/// Parses a MAC address of the usual colon-separated form.
pub fn parse_mac(s: &str) -> Option<[u8; 6]> {
    let mut bytes = [0u8; 6];
    let mut count = 0;
    for part in s.split(':') {
        if count == 6 || part.len() != 2 {
            return None;
        }
        bytes[count] = u8::from_str_radix(part, 16).ok()?;
        count += 1;
    }
    if count == 6 {
        Some(bytes)
    } else {
        None
    }
}

/// Parses the raw opaque parameters (JSON or YAML, unknown fields rejected)
/// and checks every field. All semantic errors are returned together.
pub fn parse_and_validate(raw: &[u8]) -> Result<NetworkConfig, ConfigError> {
    if raw.is_empty() {
        return Ok(NetworkConfig::default());
    }
    // YAML is a superset of JSON, so one strict parser covers both formats.
    let config: NetworkConfig = serde_yaml::from_slice(raw)?;

    let mut errors = Vec::new();

    for address in &config.interface.addresses {
        if parse_cidr(address).is_none() {
            errors.push(format!("invalid IP in CIDR format {address}"));
        }
    }

    if let Some(mac) = &config.interface.hardware_addr {
        if parse_mac(mac).is_none() {
            errors.push(format!("invalid hardware address {mac}"));
        }
    }

    if config.interface.mtu == Some(0) {
        errors.push("mtu must be a positive integer".to_string());
    }

    for (i, route) in config.routes.iter().enumerate() {
        if route.destination.is_empty() {
            errors.push(format!("route {i}: destination cannot be empty"));
        } else if parse_cidr(&route.destination).is_none()
            && route.destination.parse::<IpAddr>().is_err()
        {
            errors.push(format!(
                "route {i}: invalid destination IP or CIDR '{}'",
                route.destination
            ));
        }

        if route.scope != RT_SCOPE_UNIVERSE && route.scope != RT_SCOPE_LINK {
            errors.push(format!(
                "route {i}: invalid scope '{}' only Link (253) or Universe (0) allowed",
                route.scope
            ));
        }

        // Link scoped routes do not need a gateway.
        match &route.gateway {
            Some(gateway) => {
                if gateway.parse::<IpAddr>().is_err() {
                    errors.push(format!("route {i}: invalid gateway IP '{gateway}'"));
                }
            }
            None => {
                if route.scope != RT_SCOPE_LINK {
                    errors.push(format!(
                        "route {i}: for destination '{}' must have a gateway",
                        route.destination
                    ));
                }
            }
        }

        if let Some(source) = &route.source {
            if source.parse::<IpAddr>().is_err() {
                errors.push(format!("route {i}: invalid source IP '{source}'"));
            }
        }
    }

    for (i, neighbor) in config.neighbors.iter().enumerate() {
        if neighbor.destination.parse::<IpAddr>().is_err() {
            errors.push(format!(
                "neighbor {i}: invalid ip address: {}",
                neighbor.destination
            ));
        }
        if parse_mac(&neighbor.hardware_addr).is_none() {
            errors.push(format!(
                "neighbor {i}: invalid mac address: {}",
                neighbor.hardware_addr
            ));
        }
    }

    for (i, rule) in config.rules.iter().enumerate() {
        if let Some(source) = &rule.source {
            if parse_cidr(source).is_none() {
                errors.push(format!("rule {i}: invalid source CIDR '{source}'"));
            }
        }
        if let Some(destination) = &rule.destination {
            if parse_cidr(destination).is_none() {
                errors.push(format!("rule {i}: invalid destination CIDR '{destination}'"));
            }
        }
    }

    if errors.is_empty() {
        Ok(config)
    } else {
        Err(ConfigError::Invalid(errors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_yaml_config() {
        let raw = br#"
interface:
  name: eth99
  addresses:
  - 192.168.1.10/24
  mtu: 1500
routes:
- destination: 10.0.0.0/8
  gateway: 192.168.1.1
"#;
        let config = parse_and_validate(raw).unwrap();
        assert_eq!(config.interface.name.as_deref(), Some("eth99"));
        assert_eq!(config.routes.len(), 1);
    }

    #[test]
    fn valid_json_config() {
        let raw = br#"{
            "interface": {"addresses": ["192.168.1.10/24"], "gsoMaxSize": 65536},
            "neighbors": [{"destination": "192.168.1.1", "hardwareAddr": "aa:bb:cc:dd:ee:ff"}],
            "rules": [{"priority": 100, "table": 100, "source": "192.168.1.0/24"}]
        }"#;
        let config = parse_and_validate(raw).unwrap();
        assert_eq!(config.interface.gso_max_size, Some(65536));
        assert_eq!(config.neighbors.len(), 1);
        assert_eq!(config.rules[0].table, Some(100));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let raw = br#"{"gateways": "x"}"#;
        let err = parse_and_validate(raw).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        assert!(err.to_string().contains("gateways"));
    }

    #[test]
    fn empty_config_is_valid() {
        assert_eq!(parse_and_validate(b"").unwrap(), NetworkConfig::default());
    }

    #[test]
    fn invalid_address_is_collected() {
        let raw = br#"{"interface": {"addresses": ["a.b.c.d/24", "192.168.1.10"]}}"#;
        let err = parse_and_validate(raw).unwrap_err();
        let message = err.to_string();
        // Both problems are reported: the bogus address and the missing prefix.
        assert!(message.contains("a.b.c.d/24"));
        assert!(message.contains("192.168.1.10"));
    }

    #[test]
    fn universe_route_requires_gateway() {
        let raw = br#"{"routes": [{"destination": "10.0.0.0/8"}]}"#;
        assert!(parse_and_validate(raw).is_err());
    }

    #[test]
    fn link_scope_route_may_omit_gateway() {
        let raw = br#"{"routes": [{"destination": "10.0.5.1", "scope": 253}]}"#;
        let config = parse_and_validate(raw).unwrap();
        assert_eq!(config.routes[0].scope, RT_SCOPE_LINK);
    }

    #[test]
    fn route_scope_must_be_link_or_universe() {
        let raw = br#"{"routes": [{"destination": "10.0.0.0/8", "gateway": "10.0.0.1", "scope": 200}]}"#;
        let err = parse_and_validate(raw).unwrap_err();
        assert!(err.to_string().contains("invalid scope"));
    }

    #[test]
    fn bare_ip_destination_is_a_valid_route() {
        let raw = br#"{"routes": [{"destination": "10.0.5.1", "gateway": "10.0.0.1"}]}"#;
        assert!(parse_and_validate(raw).is_ok());
    }

    #[test]
    fn zero_mtu_is_rejected() {
        let raw = br#"{"interface": {"mtu": 0}}"#;
        assert!(parse_and_validate(raw).is_err());
    }

    #[test]
    fn serialize_parse_round_trip() {
        let raw = br#"{
            "interface": {"name": "net0", "addresses": ["10.1.2.3/32"], "mtu": 8896},
            "routes": [{"destination": "10.0.0.0/8", "gateway": "10.1.2.1"},
                       {"destination": "10.1.2.1", "scope": 253}],
            "ethtool": {"features": {"rx-gro": true}}
        }"#;
        let config = parse_and_validate(raw).unwrap();
        let serialized = serde_json::to_vec(&config).unwrap();
        let reparsed = parse_and_validate(&serialized).unwrap();
        assert_eq!(config, reparsed);
    }

    #[test]
    fn mac_parsing() {
        assert_eq!(
            parse_mac("aa:bb:cc:dd:ee:ff"),
            Some([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff])
        );
        assert_eq!(parse_mac("aa:bb:cc:dd:ee"), None);
        assert_eq!(parse_mac("aa:bb:cc:dd:ee:ff:00"), None);
        assert_eq!(parse_mac("zz:bb:cc:dd:ee:ff"), None);
    }
}
