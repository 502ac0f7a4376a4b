//! The opaque per-device configuration a claim may carry. The schema is
//! strict: unknown fields are rejected at parse time so typos in operator
//! manifests surface as prepare errors instead of silently doing nothing.

mod validation;

pub use validation::{parse_and_validate, parse_mac, ConfigError};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Route scope accepted in configs: global routing.
pub const RT_SCOPE_UNIVERSE: u8 = 0;
/// Route scope accepted in configs: directly attached prefix, no gateway.
pub const RT_SCOPE_LINK: u8 = 253;

/// Desired state for one claimed device inside the pod namespace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase", default)]
pub struct NetworkConfig {
    pub interface: InterfaceConfig,
    pub routes: Vec<RouteConfig>,
    pub neighbors: Vec<NeighborConfig>,
    pub rules: Vec<RuleConfig>,
    pub ethtool: Option<EthtoolConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase", default)]
pub struct InterfaceConfig {
    /// Name the interface should carry inside the pod. Defaults to the host
    /// interface name.
    pub name: Option<String>,
    /// Addresses in CIDR notation.
    pub addresses: Vec<String>,
    pub mtu: Option<u32>,
    pub hardware_addr: Option<String>,
    pub gso_max_size: Option<u32>,
    pub gro_max_size: Option<u32>,
    #[serde(rename = "gsoIPv4MaxSize")]
    pub gso_ipv4_max_size: Option<u32>,
    #[serde(rename = "groIPv4MaxSize")]
    pub gro_ipv4_max_size: Option<u32>,
    /// Remove any eBPF programs attached to the interface after the move.
    pub disable_ebpf_programs: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase", default)]
pub struct RouteConfig {
    /// CIDR, or a bare IP for a host route.
    pub destination: String,
    pub gateway: Option<String>,
    pub source: Option<String>,
    /// 0 (universe) or 253 (link).
    pub scope: u8,
    pub table: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase", default)]
pub struct NeighborConfig {
    pub destination: String,
    pub hardware_addr: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase", default)]
pub struct RuleConfig {
    pub priority: Option<u32>,
    pub table: Option<u32>,
    /// Source prefix in CIDR notation.
    pub source: Option<String>,
    /// Destination prefix in CIDR notation.
    pub destination: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase", default)]
pub struct EthtoolConfig {
    /// Feature name to desired state, e.g. `{"rx-gro": false}`.
    pub features: BTreeMap<String, bool>,
}
