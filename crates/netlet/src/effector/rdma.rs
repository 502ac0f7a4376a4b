//! RDMA device handling: sysfs discovery of the rdma device backing a PCI
//! function and of its character devices, and the nldev netlink operations
//! that move an rdma link between network namespaces. The rdma object moves
//! independently of its netdev, so attach and detach handle both.

use std::fs;
use std::io;
use std::os::fd::RawFd;
use std::path::Path;

use anyhow::{anyhow, Context, Result};

use crate::nlraw::{self, RawConnection};
use crate::pod_config::LinuxDeviceSpec;

const NETLINK_RDMA: isize = 20;

/// RDMA netlink client id; message type is `(client << 10) | op`.
const RDMA_NL_NLDEV: u16 = 5;
const RDMA_NLDEV_CMD_GET: u16 = 1;
const RDMA_NLDEV_CMD_SET: u16 = 2;

const RDMA_NLDEV_ATTR_DEV_INDEX: u16 = 1;
const RDMA_NLDEV_ATTR_DEV_NAME: u16 = 2;
const RDMA_NLDEV_NET_NS_FD: u16 = 68;

fn nldev_type(command: u16) -> u16 {
    (RDMA_NL_NLDEV << 10) | command
}

/// Finds the rdma device whose backing PCI function is `pci_address`, e.g.
/// `mlx5_0` for `0000:8a:00.0`. Follows the `device` symlink of every entry
/// under `<sysfs>/class/infiniband`.
pub fn rdma_device_for_pci(sysfs_root: &Path, pci_address: &str) -> Option<String> {
    let class_dir = sysfs_root.join("class/infiniband");
    for entry in fs::read_dir(class_dir).ok()?.filter_map(|e| e.ok()) {
        let target = match fs::read_link(entry.path().join("device")) {
            Ok(target) => target,
            Err(_) => continue,
        };
        let ends_with_address = target
            .file_name()
            .map(|name| name.to_string_lossy() == pci_address)
            .unwrap_or(false);
        if ends_with_address {
            return Some(entry.file_name().to_string_lossy().to_string());
        }
    }
    None
}

fn device_numbers(dir: &Path) -> Option<(i64, i64)> {
    let raw = fs::read_to_string(dir.join("dev")).ok()?;
    let (major, minor) = raw.trim().split_once(':')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}

fn char_devices_in_class(
    sysfs_root: &Path,
    class: &str,
    rdma_device: &str,
    devices: &mut Vec<LinuxDeviceSpec>,
) {
    let class_dir = sysfs_root.join("class").join(class);
    let entries = match fs::read_dir(class_dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let ibdev = entry.path().join("ibdev");
        let owner = match fs::read_to_string(&ibdev) {
            Ok(owner) => owner,
            Err(_) => continue,
        };
        if owner.trim() != rdma_device {
            continue;
        }
        let node = entry.file_name().to_string_lossy().to_string();
        if let Some((major, minor)) = device_numbers(&entry.path()) {
            devices.push(LinuxDeviceSpec {
                path: format!("/dev/infiniband/{node}"),
                dev_type: "c".to_string(),
                major,
                minor,
            });
        }
    }
}

/// Lists the character devices a container needs to use the rdma device:
/// the uverbs node plus the umad/issm nodes when present.
pub fn char_devices_for(sysfs_root: &Path, rdma_device: &str) -> Vec<LinuxDeviceSpec> {
    let mut devices = Vec::new();
    char_devices_in_class(sysfs_root, "infiniband_verbs", rdma_device, &mut devices);
    char_devices_in_class(sysfs_root, "infiniband_mad", rdma_device, &mut devices);
    devices.sort_by(|a, b| a.path.cmp(&b.path));
    devices
}

fn rdma_link_index(conn: &mut RawConnection, name: &str) -> Result<Option<u32>> {
    let replies = conn
        .request(nldev_type(RDMA_NLDEV_CMD_GET), nlraw::NLM_F_DUMP, &[])
        .context("rdma device dump failed")?;
    for payload in replies {
        let mut index = None;
        let mut dev_name = None;
        for (kind, value) in nlraw::attrs(&payload) {
            match kind {
                RDMA_NLDEV_ATTR_DEV_INDEX => index = nlraw::attr_u32(value),
                RDMA_NLDEV_ATTR_DEV_NAME => dev_name = nlraw::attr_string(value),
                _ => {}
            }
        }
        if dev_name.as_deref() == Some(name) {
            return Ok(index);
        }
    }
    Ok(None)
}

/// Whether an rdma link with this name is visible in the current network
/// namespace.
pub fn rdma_link_exists(name: &str) -> Result<bool> {
    let mut conn = RawConnection::open(NETLINK_RDMA).context("could not open rdma netlink")?;
    Ok(rdma_link_index(&mut conn, name)?.is_some())
}

/// Moves the named rdma link into the network namespace behind `ns_fd`. The
/// netlink socket is created in the namespace of the calling thread, so this
/// must be invoked from the namespace the link currently lives in.
pub fn rdma_link_set_netns(name: &str, ns_fd: RawFd) -> Result<()> {
    let mut conn = RawConnection::open(NETLINK_RDMA).context("could not open rdma netlink")?;
    let index = rdma_link_index(&mut conn, name)?
        .ok_or_else(|| anyhow!("rdma link {name} not found"))?;

    let mut payload = Vec::new();
    nlraw::put_attr_u32(&mut payload, RDMA_NLDEV_ATTR_DEV_INDEX, index);
    nlraw::put_attr_u32(&mut payload, RDMA_NLDEV_NET_NS_FD, ns_fd as u32);
    conn.request(nldev_type(RDMA_NLDEV_CMD_SET), nlraw::NLM_F_ACK, &payload)
        .map_err(|err| match err.raw_os_error() {
            Some(code) => anyhow!(
                "failed to move rdma link {name} to target namespace: {}",
                io::Error::from_raw_os_error(code)
            ),
            None => anyhow!("failed to move rdma link {name} to target namespace: {err}"),
        })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    fn fake_rdma_tree(sysfs: &Path) {
        let pci_dir = sysfs.join("devices/pci0000:8a/0000:8a:00.0");
        fs::create_dir_all(&pci_dir).unwrap();

        let ib = sysfs.join("class/infiniband/mlx5_0");
        fs::create_dir_all(&ib).unwrap();
        symlink(&pci_dir, ib.join("device")).unwrap();

        let uverbs = sysfs.join("class/infiniband_verbs/uverbs0");
        fs::create_dir_all(&uverbs).unwrap();
        fs::write(uverbs.join("ibdev"), "mlx5_0\n").unwrap();
        fs::write(uverbs.join("dev"), "231:192\n").unwrap();

        let umad = sysfs.join("class/infiniband_mad/umad0");
        fs::create_dir_all(&umad).unwrap();
        fs::write(umad.join("ibdev"), "mlx5_0\n").unwrap();
        fs::write(umad.join("dev"), "231:0\n").unwrap();

        // A node owned by a different rdma device must not match.
        let other = sysfs.join("class/infiniband_verbs/uverbs1");
        fs::create_dir_all(&other).unwrap();
        fs::write(other.join("ibdev"), "mlx5_1\n").unwrap();
        fs::write(other.join("dev"), "231:193\n").unwrap();
    }

    #[test]
    fn rdma_device_resolved_by_pci_address() {
        let tmp = tempfile::tempdir().unwrap();
        fake_rdma_tree(tmp.path());
        assert_eq!(
            rdma_device_for_pci(tmp.path(), "0000:8a:00.0").as_deref(),
            Some("mlx5_0")
        );
        assert_eq!(rdma_device_for_pci(tmp.path(), "0000:8b:00.0"), None);
    }

    #[test]
    fn char_devices_carry_major_minor() {
        let tmp = tempfile::tempdir().unwrap();
        fake_rdma_tree(tmp.path());
        let devices = char_devices_for(tmp.path(), "mlx5_0");
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].path, "/dev/infiniband/umad0");
        assert_eq!(devices[1].path, "/dev/infiniband/uverbs0");
        assert_eq!(devices[1].major, 231);
        assert_eq!(devices[1].minor, 192);
        assert!(devices.iter().all(|d| d.dev_type == "c"));
    }

    #[test]
    fn nldev_message_type_packs_client_and_op() {
        assert_eq!(nldev_type(RDMA_NLDEV_CMD_GET), (5 << 10) | 1);
        assert_eq!(nldev_type(RDMA_NLDEV_CMD_SET), (5 << 10) | 2);
    }
}
