//! The namespace effector: the only code that mutates kernel state. Attach
//! moves a claimed device (and its rdma link, when it has one) into a pod's
//! network namespace and programs the desired state inside it; detach brings
//! the device back. Both operations are idempotent so the runtime can retry
//! a failed hook and converge.

pub mod ethtool;
pub mod link;
pub mod netns;
pub mod rdma;

use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::pod_config::PodConfig;

/// The effector operations the runtime event handler drives. Behind a trait
/// so hook handling can be exercised without a kernel.
pub trait DeviceEffector: Send + Sync {
    /// Moves the device into the namespace and applies the configuration.
    /// Safe to retry: converged steps succeed silently.
    fn attach(&self, netns_path: &Path, target_ifname: &str, config: &PodConfig) -> Result<()>;

    /// Moves the device back to the root namespace, restoring its host
    /// interface name. Treats an absent link or namespace as already
    /// detached.
    fn detach(&self, netns_path: &Path, target_ifname: &str, config: &PodConfig) -> Result<()>;
}

/// The real effector.
#[derive(Debug, Clone, Default)]
pub struct KernelEffector;

impl KernelEffector {
    pub fn new() -> Self {
        KernelEffector
    }
}

impl DeviceEffector for KernelEffector {
    fn attach(&self, netns_path: &Path, target_ifname: &str, config: &PodConfig) -> Result<()> {
        let ns_file = std::fs::File::open(netns_path).with_context(|| {
            format!("could not open network namespace {}", netns_path.display())
        })?;
        let ns_fd = ns_file.as_raw_fd();

        // The rdma link moves in addition to the netdev; both end up in the
        // pod namespace. The rdma move happens first so a failure leaves the
        // netdev still on the host, where a retry can see it.
        if let Some(rdma_device) = &config.rdma_device {
            match rdma::rdma_link_exists(rdma_device) {
                Ok(true) => {
                    rdma::rdma_link_set_netns(rdma_device, ns_fd).with_context(|| {
                        format!("moving rdma link {rdma_device} to {}", netns_path.display())
                    })?;
                    info!(rdma = %rdma_device, netns = %netns_path.display(), "moved rdma link");
                }
                Ok(false) => {
                    debug!(rdma = %rdma_device, "rdma link not in root namespace, assuming already moved");
                }
                Err(err) => {
                    return Err(err.context(format!("looking up rdma link {rdma_device}")))
                }
            }
        }

        let host_ifname = config.host_interface.clone();
        let target = target_ifname.to_string();
        let target_for_move = target.clone();
        let already_in_target = {
            let netns: PathBuf = netns_path.to_path_buf();
            let probe = target.clone();
            netns::block_on_in_netns(&netns, move || async move {
                let (connection, handle, _) = rtnetlink::new_connection()?;
                tokio::spawn(connection);
                link::link_index_by_name(&handle, &probe).await.map(|i| i.is_some())
            })?
        };
        if !already_in_target {
            netns::block_on_in_root(move || async move {
                let (connection, handle, _) = rtnetlink::new_connection()?;
                tokio::spawn(connection);
                link::move_link_to_fd(&handle, &host_ifname, Some(&target_for_move), ns_fd).await
            })
            .with_context(|| {
                format!(
                    "moving {} to namespace {}",
                    config.host_interface,
                    netns_path.display()
                )
            })?;
        } else {
            debug!(interface = %target, "link already in target namespace");
        }

        // Program the interface from inside the namespace. The netlink
        // handle is created within it and lives only as long as the pinned
        // worker thread.
        let network = config.network.clone();
        netns::block_on_in_netns(netns_path, move || async move {
            let (connection, handle, _) = rtnetlink::new_connection()?;
            tokio::spawn(connection);
            link::apply_interface_config(&handle, &target, &network).await
        })
        .with_context(|| format!("configuring device in {}", netns_path.display()))?;

        Ok(())
    }

    fn detach(&self, netns_path: &Path, target_ifname: &str, config: &PodConfig) -> Result<()> {
        if !netns_path.exists() {
            debug!(netns = %netns_path.display(), "namespace is gone, treating as detached");
            return Ok(());
        }
        let root = netns::open_root_netns()?;
        let root_fd = root.as_raw_fd();

        let target = target_ifname.to_string();
        let host_ifname = config.host_interface.clone();
        let rdma_device = config.rdma_device.clone();
        netns::block_on_in_netns(netns_path, move || async move {
            // The rdma link goes home first; its move is independent of the
            // netdev and the kernel discards nothing on it.
            if let Some(rdma_device) = &rdma_device {
                match rdma::rdma_link_exists(rdma_device) {
                    Ok(true) => rdma::rdma_link_set_netns(rdma_device, root_fd)?,
                    Ok(false) => {
                        debug!(rdma = %rdma_device, "rdma link not in pod namespace")
                    }
                    Err(err) => debug!(rdma = %rdma_device, error = %err, "rdma lookup failed"),
                }
            }

            let (connection, handle, _) = rtnetlink::new_connection()?;
            tokio::spawn(connection);
            match link::link_index_by_name(&handle, &target).await? {
                None => {
                    debug!(interface = %target, "link not in pod namespace, already detached");
                    Ok(())
                }
                Some(_) => {
                    // Addresses, routes and neighbors inside the namespace
                    // are discarded by the kernel on the move.
                    link::move_link_to_fd(&handle, &target, Some(&host_ifname), root_fd).await
                }
            }
        })
        .with_context(|| format!("detaching from {}", netns_path.display()))
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Records effector invocations for hook tests.
    #[derive(Clone, Default)]
    pub struct RecordingEffector {
        pub attached: Arc<Mutex<Vec<(PathBuf, String, String)>>>,
        pub detached: Arc<Mutex<Vec<(PathBuf, String)>>>,
        pub fail_attach_of: Arc<Mutex<Option<String>>>,
    }

    impl DeviceEffector for RecordingEffector {
        fn attach(&self, netns_path: &Path, target_ifname: &str, config: &PodConfig) -> Result<()> {
            if self.fail_attach_of.lock().unwrap().as_deref() == Some(target_ifname) {
                return Err(anyhow::anyhow!("injected attach failure"));
            }
            self.attached.lock().unwrap().push((
                netns_path.to_path_buf(),
                target_ifname.to_string(),
                config.device.clone(),
            ));
            Ok(())
        }

        fn detach(&self, netns_path: &Path, target_ifname: &str, _config: &PodConfig) -> Result<()> {
            self.detached
                .lock()
                .unwrap()
                .push((netns_path.to_path_buf(), target_ifname.to_string()));
            Ok(())
        }
    }
}
