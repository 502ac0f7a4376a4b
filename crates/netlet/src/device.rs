//! Typed model of the device catalog. The inventory fills these structures
//! from sysfs, netlink and cloud metadata; the publisher converts them into
//! the wire representation of a resource slice.

use std::collections::BTreeMap;

/// Attribute domain used for the driver's own qualified attribute names.
pub const ATTRIBUTE_DOMAIN: &str = "netlet.dev";

pub const ATTR_IF_NAME: &str = "netlet.dev/ifName";
pub const ATTR_MAC: &str = "netlet.dev/mac";
pub const ATTR_MTU: &str = "netlet.dev/mtu";
pub const ATTR_ENCAPSULATION: &str = "netlet.dev/encapsulation";
pub const ATTR_ALIAS: &str = "netlet.dev/alias";
pub const ATTR_STATE: &str = "netlet.dev/state";
pub const ATTR_TYPE: &str = "netlet.dev/type";
pub const ATTR_IPV4: &str = "netlet.dev/ipv4";
pub const ATTR_IPV6: &str = "netlet.dev/ipv6";
pub const ATTR_PCI_VENDOR: &str = "netlet.dev/pciVendor";
pub const ATTR_PCI_DEVICE: &str = "netlet.dev/pciDevice";
pub const ATTR_PCI_SUBSYSTEM: &str = "netlet.dev/pciSubsystem";
pub const ATTR_NUMA_NODE: &str = "netlet.dev/numaNode";
pub const ATTR_RDMA: &str = "netlet.dev/rdma";
pub const ATTR_SRIOV: &str = "netlet.dev/sriov";
pub const ATTR_SRIOV_VFS: &str = "netlet.dev/sriovVfs";
pub const ATTR_VIRTUAL: &str = "netlet.dev/virtual";
pub const ATTR_EBPF: &str = "netlet.dev/ebpf";
pub const ATTR_TC_FILTER_NAMES: &str = "netlet.dev/tcFilterNames";
pub const ATTR_TCX_PROGRAM_NAMES: &str = "netlet.dev/tcxProgramNames";
pub const ATTR_CLOUD_NETWORK: &str = "netlet.dev/cloudNetwork";
pub const ATTR_ACCELERATOR_PROTOCOL: &str = "netlet.dev/acceleratorProtocol";
/// Index of the interface in the cloud NIC ordering, used for NIC to GPU
/// correlation via the provider's naming convention.
pub const ATTR_INDEX: &str = "netlet.dev/index";

/// Standardized attribute carrying the PCIe root of the device, defined by
/// the DRA device-attribute conventions for topology-aware selection.
pub const ATTR_PCIE_ROOT: &str = "dra.k8s.io/pcieRoot";

/// The attributes that describe transient interface state rather than the
/// device itself. When an interface has moved into a pod and can no longer be
/// observed from the root namespace, these are carried over from the previous
/// refresh.
pub const MUTABLE_ATTRIBUTES: &[&str] = &[
    ATTR_IF_NAME,
    ATTR_MAC,
    ATTR_ENCAPSULATION,
    ATTR_ALIAS,
    ATTR_STATE,
    ATTR_TYPE,
    ATTR_IPV4,
    ATTR_IPV6,
    ATTR_TC_FILTER_NAMES,
    ATTR_TCX_PROGRAM_NAMES,
    ATTR_EBPF,
    ATTR_SRIOV,
    ATTR_SRIOV_VFS,
    ATTR_VIRTUAL,
];

/// A typed attribute value. Exactly one variant is published per attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceAttribute {
    String(String),
    Int(i64),
    Bool(bool),
    Version(String),
}

impl From<&str> for DeviceAttribute {
    fn from(value: &str) -> Self {
        DeviceAttribute::String(value.to_string())
    }
}

impl From<String> for DeviceAttribute {
    fn from(value: String) -> Self {
        DeviceAttribute::String(value)
    }
}

impl From<i64> for DeviceAttribute {
    fn from(value: i64) -> Self {
        DeviceAttribute::Int(value)
    }
}

impl From<bool> for DeviceAttribute {
    fn from(value: bool) -> Self {
        DeviceAttribute::Bool(value)
    }
}

/// A discovered network device. The name is the normalized PCI address and is
/// the stable identity of the device; attributes are best-effort and may
/// change between refreshes.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NetworkDevice {
    pub name: String,
    pub attributes: BTreeMap<String, DeviceAttribute>,
    /// Reserved for future consumable resources, normally empty.
    pub capacity: BTreeMap<String, String>,
}

impl NetworkDevice {
    pub fn new(name: impl Into<String>) -> Self {
        NetworkDevice {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn set(&mut self, name: &str, value: impl Into<DeviceAttribute>) {
        self.attributes.insert(name.to_string(), value.into());
    }

    pub fn string_attr(&self, name: &str) -> Option<&str> {
        match self.attributes.get(name) {
            Some(DeviceAttribute::String(s)) | Some(DeviceAttribute::Version(s)) => Some(s),
            _ => None,
        }
    }

    pub fn int_attr(&self, name: &str) -> Option<i64> {
        match self.attributes.get(name) {
            Some(DeviceAttribute::Int(i)) => Some(*i),
            _ => None,
        }
    }

    pub fn bool_attr(&self, name: &str) -> Option<bool> {
        match self.attributes.get(name) {
            Some(DeviceAttribute::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    /// Copies the listed attributes from `src` where present. Used to
    /// preserve previously observed state for interfaces that are currently
    /// inside a pod namespace.
    pub fn merge_attributes_from(&mut self, src: &NetworkDevice, names: &[&str]) {
        for name in names {
            if let Some(value) = src.attributes.get(*name) {
                self.attributes.insert((*name).to_string(), value.clone());
            }
        }
    }
}
