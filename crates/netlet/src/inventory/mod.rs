//! The inventory database: a periodically refreshed, in-memory catalog of
//! the node's PCI network devices, plus the registry of pod network
//! namespaces the driver has handed devices to.
//!
//! Discovery is split into probes (sysfs, netlink, rdma, cloud) that produce
//! a [`DeviceObservation`], and a pure composition step that turns an
//! observation into the published [`NetworkDevice`]. Tests drive the
//! composition with hand-built observations.

pub mod cloud;
pub mod ebpf;
pub mod netdev;
pub mod pci;
pub mod routes;
pub mod sysfs;

use std::collections::HashMap;
use std::fs::File;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::device::{
    NetworkDevice, ATTR_ACCELERATOR_PROTOCOL, ATTR_ALIAS, ATTR_CLOUD_NETWORK,
    ATTR_EBPF, ATTR_ENCAPSULATION, ATTR_IF_NAME, ATTR_INDEX, ATTR_IPV4, ATTR_IPV6, ATTR_MAC,
    ATTR_MTU, ATTR_NUMA_NODE, ATTR_PCIE_ROOT, ATTR_PCI_DEVICE, ATTR_PCI_SUBSYSTEM,
    ATTR_PCI_VENDOR, ATTR_RDMA, ATTR_SRIOV, ATTR_SRIOV_VFS, ATTR_STATE, ATTR_TC_FILTER_NAMES,
    ATTR_TCX_PROGRAM_NAMES, ATTR_TYPE, ATTR_VIRTUAL, MUTABLE_ATTRIBUTES,
};
use crate::effector::rdma;
use cloud::{CloudInstance, CloudProvider};
use netdev::LinkFacts;
use pci::PciDeviceInfo;

/// Minimum spacing between two refreshes.
const MIN_INTERVAL: Duration = Duration::from_secs(5);
/// A refresh happens at least this often even without a sync request.
const MAX_INTERVAL: Duration = Duration::from_secs(60);

/// Everything one refresh learned about a device before composition.
#[derive(Debug, Clone, Default)]
pub struct DeviceObservation {
    pub pci: PciDeviceInfo,
    pub link: Option<LinkObservation>,
    pub rdma: bool,
}

/// The interface-level facts, present only while the interface is visible in
/// the root namespace.
#[derive(Debug, Clone, Default)]
pub struct LinkObservation {
    pub facts: LinkFacts,
    pub ipv4: Vec<String>,
    pub ipv6: Vec<String>,
    pub tc_filter_names: Option<Vec<String>>,
    pub tcx_program_names: Option<Vec<String>>,
    pub sriov_total_vfs: i64,
    pub sriov_num_vfs: i64,
    pub is_virtual: bool,
}

#[derive(Default)]
struct State {
    devices: HashMap<String, NetworkDevice>,
    netns_for_pod: HashMap<String, String>,
    has_devices: bool,
    instance: Option<CloudInstance>,
}

/// The device catalog. Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct InventoryDb {
    sysfs_root: PathBuf,
    cloud_provider: CloudProvider,
    state: std::sync::Arc<Mutex<State>>,
    sync_tx: mpsc::Sender<()>,
    sync_rx: std::sync::Arc<tokio::sync::Mutex<mpsc::Receiver<()>>>,
    notifications: mpsc::Sender<Vec<NetworkDevice>>,
}

impl InventoryDb {
    /// Creates the database and the notification channel its refresh loop
    /// publishes device snapshots on.
    pub fn new(
        sysfs_root: impl Into<PathBuf>,
        cloud_provider: CloudProvider,
    ) -> (InventoryDb, mpsc::Receiver<Vec<NetworkDevice>>) {
        let (sync_tx, sync_rx) = mpsc::channel(1);
        let (notifications, notifications_rx) = mpsc::channel(1);
        (
            InventoryDb {
                sysfs_root: sysfs_root.into(),
                cloud_provider,
                state: std::sync::Arc::new(Mutex::new(State::default())),
                sync_tx,
                sync_rx: std::sync::Arc::new(tokio::sync::Mutex::new(sync_rx)),
                notifications,
            },
            notifications_rx,
        )
    }

    /// Requests an immediate refresh. The rate limiter still applies; extra
    /// requests while one is pending are dropped.
    pub fn sync(&self) {
        let _ = self.sync_tx.try_send(());
    }

    /// Registers the network namespace of a pod, keyed by its
    /// `namespace/name`. The path is verified to be openable first.
    pub fn add_pod_netns(&self, pod: &str, netns_path: &str) {
        if let Err(err) = File::open(netns_path) {
            info!(pod, netns = netns_path, error = %err, "could not open pod network namespace");
            return;
        }
        let mut state = self.state.lock().unwrap();
        state
            .netns_for_pod
            .insert(pod.to_string(), netns_path.to_string());
    }

    pub fn remove_pod_netns(&self, pod: &str) {
        let mut state = self.state.lock().unwrap();
        state.netns_for_pod.remove(pod);
    }

    pub fn get_pod_netns(&self, pod: &str) -> Option<String> {
        let state = self.state.lock().unwrap();
        state.netns_for_pod.get(pod).cloned()
    }

    pub fn get_device(&self, device_name: &str) -> Option<NetworkDevice> {
        let state = self.state.lock().unwrap();
        state.devices.get(device_name).cloned()
    }

    /// The kernel interface name for a device, from the store when cached
    /// and from sysfs otherwise.
    pub fn interface_name_for(&self, device_name: &str) -> Result<String> {
        if let Some(device) = self.get_device(device_name) {
            if let Some(ifname) = device.string_attr(ATTR_IF_NAME) {
                return Ok(ifname.to_string());
            }
            debug!(device = device_name, "device has no interface name in store, using sysfs");
        } else {
            debug!(device = device_name, "device not found in store, using sysfs");
        }
        let pci_address = pci::denormalize_pci_address(device_name)
            .ok_or_else(|| anyhow::anyhow!("invalid device name {device_name}"))?;
        pci::network_interface_for(&self.sysfs_root, &pci_address)
    }

    /// The long-running refresh loop. Returns only on shutdown or on a fatal
    /// PCI enumeration error.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let instance = cloud::fetch_instance(self.cloud_provider).await;
        {
            let mut state = self.state.lock().unwrap();
            state.instance = instance;
        }

        let (connection, handle, _) = rtnetlink::new_connection()?;
        let connection_task = tokio::spawn(connection);

        let mut last_refresh: Option<Instant> = None;
        let result = loop {
            if let Some(last) = last_refresh {
                tokio::select! {
                    _ = tokio::time::sleep_until(last + MIN_INTERVAL) => {}
                    _ = shutdown.changed() => break Ok(()),
                }
            }
            last_refresh = Some(Instant::now());

            let devices = match self.refresh(&handle).await {
                Ok(devices) => devices,
                Err(err) => break Err(err),
            };

            let notify = {
                let mut state = self.state.lock().unwrap();
                let notify = !devices.is_empty() || state.has_devices;
                state.has_devices = !devices.is_empty();
                state.devices = devices
                    .iter()
                    .map(|d| (d.name.clone(), d.clone()))
                    .collect();
                notify
            };
            debug!(devices = devices.len(), notify, "inventory refresh complete");
            if notify && self.notifications.send(devices).await.is_err() {
                // The publisher is gone, the process is shutting down.
                break Ok(());
            }

            let mut sync_rx = self.sync_rx.lock().await;
            tokio::select! {
                _ = tokio::time::sleep(MAX_INTERVAL) => {}
                _ = sync_rx.recv() => {}
                _ = shutdown.changed() => break Ok(()),
            }
        };
        connection_task.abort();
        result
    }

    async fn refresh(&self, handle: &rtnetlink::Handle) -> Result<Vec<NetworkDevice>> {
        let pci_devices = pci::enumerate_network_devices(&self.sysfs_root)?;
        let gateway_interfaces = routes::default_gateway_interfaces(handle).await;

        let mut devices = Vec::new();
        for pci_device in pci_devices {
            if let Some(ifname) = &pci_device.interface {
                if gateway_interfaces.contains(ifname) {
                    debug!(interface = %ifname, "skipping default gateway interface");
                    continue;
                }
            }
            let observation = self.observe(handle, pci_device).await;
            let (prev, instance) = {
                let state = self.state.lock().unwrap();
                (
                    state
                        .devices
                        .get(&pci::normalize_pci_address(&observation.pci.address))
                        .cloned(),
                    state.instance.clone(),
                )
            };
            devices.push(compose_device(&observation, prev.as_ref(), instance.as_ref()));
        }
        Ok(devices)
    }

    async fn observe(&self, handle: &rtnetlink::Handle, pci: PciDeviceInfo) -> DeviceObservation {
        let rdma = rdma::rdma_device_for_pci(&self.sysfs_root, &pci.address).is_some();
        let link = match &pci.interface {
            None => None,
            Some(ifname) => match netdev::link_facts(handle, ifname).await {
                None => {
                    warn!(
                        interface = %ifname,
                        pci = %pci.address,
                        "could not get link, re-using any existing device attributes"
                    );
                    None
                }
                Some(facts) => {
                    let (ipv4, ipv6) = netdev::link_addresses(handle, facts.index).await;
                    Some(LinkObservation {
                        tc_filter_names: ebpf::tc_filter_names(facts.index),
                        tcx_program_names: ebpf::tcx_program_names(facts.index),
                        sriov_total_vfs: sysfs::sriov_total_vfs(&self.sysfs_root, ifname),
                        sriov_num_vfs: sysfs::sriov_num_vfs(&self.sysfs_root, ifname),
                        is_virtual: sysfs::is_virtual(&self.sysfs_root, ifname),
                        ipv4,
                        ipv6,
                        facts,
                    })
                }
            },
        };
        DeviceObservation { pci, link, rdma }
    }
}

/// Turns one observation into the published device, merging the previous
/// mutable attributes when the interface is not observable (it has moved
/// into a pod namespace).
///
/// The merge relies entirely on the in-memory store: after a restart the
/// cache is empty and the network attributes of an already-attached
/// interface stay missing until it returns to the host. That is acceptable
/// because the missing attributes are mutable; selection should be based on
/// stable device properties.
pub fn compose_device(
    observation: &DeviceObservation,
    prev: Option<&NetworkDevice>,
    instance: Option<&CloudInstance>,
) -> NetworkDevice {
    let pci = &observation.pci;
    let mut device = NetworkDevice::new(pci::normalize_pci_address(&pci.address));

    if let Some(vendor) = pci.vendor_name() {
        device.set(ATTR_PCI_VENDOR, vendor);
    }
    if let Some(product) = pci.product_name() {
        device.set(ATTR_PCI_DEVICE, product);
    }
    if let Some(subsystem) = pci.subsystem_name() {
        device.set(ATTR_PCI_SUBSYSTEM, subsystem);
    }
    if let Some(numa) = pci.numa_node {
        device.set(ATTR_NUMA_NODE, numa);
    }
    if let Some(root) = &pci.pcie_root {
        device.set(ATTR_PCIE_ROOT, root.clone());
    }
    device.set(ATTR_RDMA, observation.rdma);

    let (ifname, link) = match (&pci.interface, &observation.link) {
        (Some(ifname), Some(link)) => (ifname, link),
        _ => {
            if let Some(prev) = prev {
                device.merge_attributes_from(prev, MUTABLE_ATTRIBUTES);
            }
            return device;
        }
    };

    device.set(ATTR_IF_NAME, ifname.clone());
    let facts = &link.facts;
    if let Some(mac) = &facts.mac {
        device.set(ATTR_MAC, mac.clone());
    }
    if let Some(mtu) = facts.mtu {
        device.set(ATTR_MTU, mtu);
    }
    device.set(ATTR_ENCAPSULATION, facts.encapsulation.clone());
    if let Some(alias) = &facts.alias {
        device.set(ATTR_ALIAS, alias.clone());
    }
    device.set(ATTR_STATE, facts.oper_state.clone());
    device.set(
        ATTR_TYPE,
        facts.kind.clone().unwrap_or_else(|| "device".to_string()),
    );
    if !link.ipv4.is_empty() {
        device.set(ATTR_IPV4, link.ipv4.join(","));
    }
    if !link.ipv6.is_empty() {
        device.set(ATTR_IPV6, link.ipv6.join(","));
    }

    let mut is_ebpf = false;
    if let Some(names) = &link.tc_filter_names {
        is_ebpf = true;
        device.set(ATTR_TC_FILTER_NAMES, names.join(","));
    }
    if let Some(names) = &link.tcx_program_names {
        is_ebpf = true;
        device.set(ATTR_TCX_PROGRAM_NAMES, names.join(","));
    }
    device.set(ATTR_EBPF, is_ebpf);

    let is_sriov = link.sriov_total_vfs > 0;
    device.set(ATTR_SRIOV, is_sriov);
    if is_sriov {
        device.set(ATTR_SRIOV_VFS, link.sriov_num_vfs);
    }
    device.set(ATTR_VIRTUAL, link.is_virtual);

    if let (Some(instance), Some(mac)) = (instance, &facts.mac) {
        if let Some(network) = instance.network_for_mac(mac) {
            device.set(ATTR_CLOUD_NETWORK, network.to_string());
        }
        if let Some(index) = instance.index_for_mac(mac) {
            device.set(ATTR_INDEX, index);
        }
        if let Some(protocol) = &instance.accelerator_protocol {
            device.set(ATTR_ACCELERATOR_PROTOCOL, protocol.clone());
        }
    }

    device
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::cloud::CloudNic;

    fn observation(address: &str, ifname: Option<&str>) -> DeviceObservation {
        DeviceObservation {
            pci: PciDeviceInfo {
                address: address.to_string(),
                numa_node: Some(1),
                pcie_root: Some("pci0000:8a".to_string()),
                interface: ifname.map(str::to_string),
                ..Default::default()
            },
            link: ifname.map(|name| LinkObservation {
                facts: LinkFacts {
                    index: 3,
                    mac: Some("aa:bb:cc:00:11:22".to_string()),
                    mtu: Some(1500),
                    encapsulation: "ether".to_string(),
                    oper_state: "up".to_string(),
                    alias: None,
                    kind: None,
                },
                ipv4: vec!["192.168.1.10".to_string()],
                ipv6: vec![],
                tc_filter_names: None,
                tcx_program_names: None,
                sriov_total_vfs: 0,
                sriov_num_vfs: 0,
                is_virtual: false,
            }),
            rdma: false,
        }
    }

    #[test]
    fn compose_fills_link_attributes() {
        let device = compose_device(&observation("0000:8a:00.0", Some("eth1")), None, None);
        assert_eq!(device.name, "net1-0000-8a-00-0");
        assert_eq!(device.string_attr(ATTR_IF_NAME), Some("eth1"));
        assert_eq!(device.string_attr(ATTR_MAC), Some("aa:bb:cc:00:11:22"));
        assert_eq!(device.int_attr(ATTR_MTU), Some(1500));
        assert_eq!(device.string_attr(ATTR_IPV4), Some("192.168.1.10"));
        assert_eq!(device.string_attr(ATTR_TYPE), Some("device"));
        assert_eq!(device.bool_attr(ATTR_SRIOV), Some(false));
        assert_eq!(device.bool_attr(ATTR_EBPF), Some(false));
        assert_eq!(device.int_attr(ATTR_NUMA_NODE), Some(1));
    }

    #[test]
    fn missing_interface_merges_previous_mutable_attributes() {
        let prev = compose_device(&observation("0000:8a:00.0", Some("eth1")), None, None);
        let merged = compose_device(&observation("0000:8a:00.0", None), Some(&prev), None);

        // Mutable attributes survive the interface moving into a pod.
        assert_eq!(merged.string_attr(ATTR_IF_NAME), Some("eth1"));
        assert_eq!(merged.string_attr(ATTR_MAC), Some("aa:bb:cc:00:11:22"));
        assert_eq!(merged.string_attr(ATTR_IPV4), Some("192.168.1.10"));
        // Identity attributes are rebuilt, not merged.
        assert_eq!(merged.int_attr(ATTR_NUMA_NODE), Some(1));
    }

    #[test]
    fn missing_interface_without_history_keeps_identity_only() {
        let device = compose_device(&observation("0000:8a:00.0", None), None, None);
        assert_eq!(device.string_attr(ATTR_IF_NAME), None);
        assert_eq!(device.int_attr(ATTR_NUMA_NODE), Some(1));
        assert_eq!(device.bool_attr(ATTR_RDMA), Some(false));
    }

    #[test]
    fn cloud_attributes_match_by_mac() {
        let instance = CloudInstance {
            provider: "gce".to_string(),
            accelerator_protocol: Some("GPUDirect-TCPX".to_string()),
            interfaces: vec![
                CloudNic {
                    mac: "ff:ff:ff:ff:ff:ff".to_string(),
                    network: "projects/1/networks/default".to_string(),
                    ..Default::default()
                },
                CloudNic {
                    mac: "aa:bb:cc:00:11:22".to_string(),
                    network: "projects/1/networks/data-net".to_string(),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        let device = compose_device(
            &observation("0000:8a:00.0", Some("eth1")),
            None,
            Some(&instance),
        );
        assert_eq!(
            device.string_attr(ATTR_CLOUD_NETWORK),
            Some("projects/1/networks/data-net")
        );
        assert_eq!(device.int_attr(ATTR_INDEX), Some(1));
        assert_eq!(
            device.string_attr(ATTR_ACCELERATOR_PROTOCOL),
            Some("GPUDirect-TCPX")
        );
    }

    #[tokio::test]
    async fn pod_netns_registry() {
        let tmp = tempfile::tempdir().unwrap();
        let netns = tmp.path().join("netns");
        std::fs::write(&netns, "").unwrap();

        let (db, _rx) = InventoryDb::new(tmp.path(), CloudProvider::Off);
        db.add_pod_netns("default/pod-a", netns.to_str().unwrap());
        assert_eq!(
            db.get_pod_netns("default/pod-a").as_deref(),
            netns.to_str()
        );

        // Unopenable paths are rejected.
        db.add_pod_netns("default/pod-b", "/proc/does-not-exist/ns/net");
        assert_eq!(db.get_pod_netns("default/pod-b"), None);

        db.remove_pod_netns("default/pod-a");
        assert_eq!(db.get_pod_netns("default/pod-a"), None);
    }

    #[tokio::test]
    async fn interface_name_falls_back_to_sysfs() {
        let tmp = tempfile::tempdir().unwrap();
        crate::inventory::pci::tests::fake_pci_device(
            tmp.path(),
            "0000:8a:00.0",
            "0x020000",
            Some("eth1"),
        );
        let (db, _rx) = InventoryDb::new(tmp.path(), CloudProvider::Off);
        assert_eq!(db.interface_name_for("net1-0000-8a-00-0").unwrap(), "eth1");
        assert!(db.interface_name_for("net1-0000-8b-00-0").is_err());
        assert!(db.interface_name_for("bogus").is_err());
    }
}
