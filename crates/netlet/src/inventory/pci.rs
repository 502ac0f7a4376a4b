//! PCI discovery through sysfs. Enumerates the devices on
//! `<sysfs>/bus/pci/devices`, keeps the ones whose class marks them as
//! network controllers and resolves the pieces of identity the catalog needs:
//! ids, NUMA node, PCIe root and the kernel interface name.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use pci_ids::FromId;

/// PCI class prefix for network controllers (`0x02xxxx`).
const PCI_CLASS_NETWORK: &str = "02";

/// The digit 1 indicates the first versioned naming scheme, allowing
/// different future naming schemes.
const NORMALIZED_NAME_PREFIX: &str = "net1";

/// A PCI address in BDF notation, `[domain:]bus:device.function`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PciAddress {
    pub domain: String,
    pub bus: String,
    pub device: String,
    pub function: String,
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}.{}",
            self.domain, self.bus, self.device, self.function
        )
    }
}

impl PciAddress {
    /// Parses a string of the form `0000:8a:00.0` (or `8a:00.0`, in which
    /// case the domain defaults to `0000`).
    pub fn parse(s: &str) -> Option<PciAddress> {
        let parts: Vec<&str> = s.split(':').collect();
        let (domain, bus, dev_fn) = match parts[..] {
            [domain, bus, dev_fn] => (domain, bus, dev_fn),
            [bus, dev_fn] => ("0000", bus, dev_fn),
            _ => return None,
        };
        let (device, function) = dev_fn.split_once('.')?;

        let hex = |s: &str, len: usize| s.len() == len && s.chars().all(|c| c.is_ascii_hexdigit());
        if !hex(domain, 4) || !hex(bus, 2) || !hex(device, 2) || !hex(function, 1) {
            return None;
        }
        Some(PciAddress {
            domain: domain.to_string(),
            bus: bus.to_string(),
            device: device.to_string(),
            function: function.to_string(),
        })
    }
}

/// Takes a PCI address and converts it into a DNS-1123 acceptable device
/// name. `0000:8a:00.0` becomes `net1-0000-8a-00-0`.
pub fn normalize_pci_address(pci_address: &str) -> String {
    if pci_address.is_empty() {
        return String::new();
    }
    let normalized = pci_address.replace([':', '.'], "-");
    format!("{NORMALIZED_NAME_PREFIX}-{normalized}")
}

/// Converts a normalized device name back to the standard PCI address
/// format. Returns `None` when the name does not carry the versioned prefix
/// or does not split into the four BDF components.
pub fn denormalize_pci_address(name: &str) -> Option<String> {
    let rest = name.strip_prefix(&format!("{NORMALIZED_NAME_PREFIX}-"))?;
    let parts: Vec<&str> = rest.split('-').collect();
    if parts.len() != 4 {
        return None;
    }
    Some(format!(
        "{}:{}:{}.{}",
        parts[0], parts[1], parts[2], parts[3]
    ))
}

/// Identity and topology facts for one PCI network device, as read from
/// sysfs. Everything except the address is best-effort.
#[derive(Debug, Clone, Default)]
pub struct PciDeviceInfo {
    pub address: String,
    pub vendor_id: Option<u16>,
    pub device_id: Option<u16>,
    pub subsystem_vendor_id: Option<u16>,
    pub subsystem_device_id: Option<u16>,
    pub numa_node: Option<i64>,
    /// The root PCI bridge the device hangs off, e.g. `pci0000:8a`.
    pub pcie_root: Option<String>,
    /// Kernel interface name, absent when the interface is not visible in
    /// this network namespace (typically: already moved into a pod).
    pub interface: Option<String>,
}

impl PciDeviceInfo {
    pub fn vendor_name(&self) -> Option<String> {
        let vendor = pci_ids::Vendor::from_id(self.vendor_id?)?;
        Some(vendor.name().to_string())
    }

    pub fn product_name(&self) -> Option<String> {
        let device = pci_ids::Device::from_vid_pid(self.vendor_id?, self.device_id?)?;
        Some(device.name().to_string())
    }

    pub fn subsystem_name(&self) -> Option<String> {
        let (ss_vendor, ss_device) = (self.subsystem_vendor_id?, self.subsystem_device_id?);
        if let Some(device) = pci_ids::Device::from_vid_pid(self.vendor_id?, self.device_id?) {
            for subsystem in device.subsystems() {
                if subsystem.subvendor() == ss_vendor && subsystem.subdevice() == ss_device {
                    return Some(subsystem.name().to_string());
                }
            }
        }
        Some(format!("{ss_vendor:04x}:{ss_device:04x}"))
    }
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn read_hex_u16(path: &Path) -> Option<u16> {
    let raw = read_trimmed(path)?;
    u16::from_str_radix(raw.trim_start_matches("0x"), 16).ok()
}

/// Reads the interface name under the device's `net/` directory, if any.
fn interface_name(device_dir: &Path) -> Option<String> {
    let mut entries: Vec<String> = fs::read_dir(device_dir.join("net"))
        .ok()?
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .collect();
    entries.sort();
    entries.into_iter().next()
}

/// Resolves the root PCI bridge for a device by following its sysfs symlink
/// up to the first `pciDDDD:BB` component.
fn pcie_root(device_dir: &Path) -> Option<String> {
    let target = fs::read_link(device_dir).ok()?;
    target
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .find(|c| c.starts_with("pci") && c.contains(':'))
}

/// Returns the network interface name for a given PCI address, going through
/// sysfs only. Used as the fallback when the device store has no cached
/// interface name.
pub fn network_interface_for(sysfs_root: &Path, pci_address: &str) -> Result<String> {
    let device_dir = sysfs_root.join("bus/pci/devices").join(pci_address);
    if !device_dir.join("net").exists() {
        return Err(anyhow!("no net directory for pci device {pci_address}"));
    }
    interface_name(&device_dir)
        .ok_or_else(|| anyhow!("no interface found for pci device {pci_address}"))
}

/// Enumerates the PCI devices of network class under the given sysfs root.
/// A missing or unreadable devices directory is a fatal inventory error; a
/// problem with any single device only skips that device.
pub fn enumerate_network_devices(sysfs_root: &Path) -> Result<Vec<PciDeviceInfo>> {
    let devices_dir = sysfs_root.join("bus/pci/devices");
    let entries = fs::read_dir(&devices_dir)
        .with_context(|| format!("error enumerating PCI devices in {}", devices_dir.display()))?;

    let mut devices = Vec::new();
    for entry in entries.filter_map(|e| e.ok()) {
        let address = entry.file_name().to_string_lossy().to_string();
        if PciAddress::parse(&address).is_none() {
            continue;
        }
        let device_dir: PathBuf = entry.path();
        let class = match read_trimmed(&device_dir.join("class")) {
            Some(c) => c,
            None => continue,
        };
        if !class.trim_start_matches("0x").starts_with(PCI_CLASS_NETWORK) {
            continue;
        }

        let numa_node = read_trimmed(&device_dir.join("numa_node"))
            .and_then(|s| s.parse::<i64>().ok())
            .filter(|n| *n >= 0);

        devices.push(PciDeviceInfo {
            vendor_id: read_hex_u16(&device_dir.join("vendor")),
            device_id: read_hex_u16(&device_dir.join("device")),
            subsystem_vendor_id: read_hex_u16(&device_dir.join("subsystem_vendor")),
            subsystem_device_id: read_hex_u16(&device_dir.join("subsystem_device")),
            numa_node,
            pcie_root: pcie_root(&device_dir),
            interface: interface_name(&device_dir),
            address,
        });
    }
    devices.sort_by(|a, b| a.address.cmp(&b.address));
    Ok(devices)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::fs;

    pub(crate) fn fake_pci_device(
        sysfs: &Path,
        address: &str,
        class: &str,
        interface: Option<&str>,
    ) {
        let dir = sysfs.join("bus/pci/devices").join(address);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("class"), format!("{class}\n")).unwrap();
        fs::write(dir.join("vendor"), "0x15b3\n").unwrap();
        fs::write(dir.join("device"), "0x101e\n").unwrap();
        fs::write(dir.join("numa_node"), "1\n").unwrap();
        if let Some(ifname) = interface {
            fs::create_dir_all(dir.join("net").join(ifname)).unwrap();
        }
    }

    #[test]
    fn normalize_round_trips() {
        for address in ["0000:8a:00.0", "0000:00:04.0", "abcd:ff:1f.7"] {
            let normalized = normalize_pci_address(address);
            assert!(normalized.starts_with("net1-"));
            assert_eq!(denormalize_pci_address(&normalized).as_deref(), Some(address));
        }
    }

    #[test]
    fn denormalize_rejects_malformed_names() {
        assert_eq!(denormalize_pci_address("net2-0000-8a-00-0"), None);
        assert_eq!(denormalize_pci_address("net1-0000-8a-00"), None);
        assert_eq!(denormalize_pci_address(""), None);
    }

    #[test]
    fn parse_pci_address_accepts_domainless_form() {
        let addr = PciAddress::parse("8a:00.0").unwrap();
        assert_eq!(addr.to_string(), "0000:8a:00.0");
        assert!(PciAddress::parse("zz:00.0").is_none());
        assert!(PciAddress::parse("0000:8a:00").is_none());
    }

    #[test]
    fn enumerate_keeps_only_network_class() {
        let tmp = tempfile::tempdir().unwrap();
        fake_pci_device(tmp.path(), "0000:8a:00.0", "0x020000", Some("eth1"));
        fake_pci_device(tmp.path(), "0000:8b:00.0", "0x030000", None);
        fake_pci_device(tmp.path(), "0000:8c:00.0", "0x020700", None);

        let devices = enumerate_network_devices(tmp.path()).unwrap();
        let addresses: Vec<&str> = devices.iter().map(|d| d.address.as_str()).collect();
        assert_eq!(addresses, vec!["0000:8a:00.0", "0000:8c:00.0"]);
        assert_eq!(devices[0].interface.as_deref(), Some("eth1"));
        assert_eq!(devices[0].numa_node, Some(1));
        assert_eq!(devices[1].interface, None);
    }

    #[test]
    fn enumerate_fails_without_pci_tree() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(enumerate_network_devices(tmp.path()).is_err());
    }

    #[test]
    fn interface_lookup_through_sysfs() {
        let tmp = tempfile::tempdir().unwrap();
        fake_pci_device(tmp.path(), "0000:8a:00.0", "0x020000", Some("eth1"));
        assert_eq!(
            network_interface_for(tmp.path(), "0000:8a:00.0").unwrap(),
            "eth1"
        );
        assert!(network_interface_for(tmp.path(), "0000:8b:00.0").is_err());
    }
}
