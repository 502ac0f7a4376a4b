//! Helpers for the parts of interface state that are only visible through
//! sysfs: SR-IOV virtual function counts and the virtual-device check.
//! See <https://www.kernel.org/doc/Documentation/ABI/testing/sysfs-class-net>.

use std::fs;
use std::path::Path;

use tracing::trace;

fn read_count(path: &Path) -> i64 {
    match fs::read_to_string(path) {
        Ok(raw) => raw.trim().parse().unwrap_or(0),
        Err(err) => {
            trace!(path = %path.display(), error = %err, "sriov counter not readable");
            0
        }
    }
}

/// Maximum number of virtual functions the interface supports; 0 when the
/// device has no SR-IOV support at all.
pub fn sriov_total_vfs(sysfs_root: &Path, ifname: &str) -> i64 {
    read_count(&sysfs_root.join("class/net").join(ifname).join("device/sriov_totalvfs"))
}

/// Number of virtual functions currently configured on the interface.
pub fn sriov_num_vfs(sysfs_root: &Path, ifname: &str) -> i64 {
    read_count(&sysfs_root.join("class/net").join(ifname).join("device/sriov_numvfs"))
}

/// Whether the interface is a virtual device. Virtual devices resolve under
/// `<sysfs>/devices/virtual/net/`:
///
/// ```text
/// $ realpath /sys/class/net/cilium_host
/// /sys/devices/virtual/net/cilium_host
/// ```
pub fn is_virtual(sysfs_root: &Path, ifname: &str) -> bool {
    let link = sysfs_root.join("class/net").join(ifname);
    let target = match fs::read_link(&link) {
        Ok(t) => t,
        Err(_) => return false,
    };
    let absolute = if target.is_absolute() {
        target
    } else {
        // Symlink targets are relative to the directory containing the link.
        link.parent().unwrap_or(Path::new("/")).join(target)
    };
    let mut normalized = std::path::PathBuf::new();
    for component in absolute.components() {
        match component {
            std::path::Component::ParentDir => {
                normalized.pop();
            }
            std::path::Component::CurDir => {}
            other => normalized.push(other),
        }
    }
    normalized
        .to_string_lossy()
        .contains("/devices/virtual/net/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    #[test]
    fn sriov_counters_default_to_zero() {
        let tmp = tempfile::tempdir().unwrap();
        assert_eq!(sriov_total_vfs(tmp.path(), "eth0"), 0);

        let device = tmp.path().join("class/net/eth0/device");
        std::fs::create_dir_all(&device).unwrap();
        std::fs::write(device.join("sriov_totalvfs"), "8\n").unwrap();
        std::fs::write(device.join("sriov_numvfs"), "2\n").unwrap();
        assert_eq!(sriov_total_vfs(tmp.path(), "eth0"), 8);
        assert_eq!(sriov_num_vfs(tmp.path(), "eth0"), 2);
    }

    #[test]
    fn virtual_devices_resolve_under_devices_virtual() {
        let tmp = tempfile::tempdir().unwrap();
        let class_net = tmp.path().join("class/net");
        std::fs::create_dir_all(&class_net).unwrap();

        let virt = tmp.path().join("devices/virtual/net/cilium_host");
        std::fs::create_dir_all(&virt).unwrap();
        symlink("../../devices/virtual/net/cilium_host", class_net.join("cilium_host")).unwrap();

        let physical = tmp.path().join("devices/pci0000:8a/0000:8a:00.0/net/eth1");
        std::fs::create_dir_all(&physical).unwrap();
        symlink("../../devices/pci0000:8a/0000:8a:00.0/net/eth1", class_net.join("eth1")).unwrap();

        assert!(is_virtual(tmp.path(), "cilium_host"));
        assert!(!is_virtual(tmp.path(), "eth1"));
        assert!(!is_virtual(tmp.path(), "missing"));
    }
}
