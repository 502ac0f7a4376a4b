//! Process configuration for the driver. The binary fills this from flags
//! and the environment; tests construct it directly.

use std::path::PathBuf;

use crate::inventory::cloud::CloudProvider;

pub const DEFAULT_DRIVER_NAME: &str = "netlet.dev";
pub const DEFAULT_KUBELET_PLUGIN_PATH: &str = "/var/lib/kubelet/plugins";
pub const DEFAULT_KUBELET_REGISTRY_PATH: &str = "/var/lib/kubelet/plugins_registry";
pub const DEFAULT_RUNTIME_SOCKET: &str = "/run/netlet/runtime.sock";

/// Name of the DRA service socket inside the driver's plugin directory.
pub const DRA_SOCKET_NAME: &str = "dra.sock";

#[derive(Debug, Clone)]
pub struct Config {
    /// The DRA driver name; also the domain of the published attributes.
    pub driver_name: String,
    /// Name of the node this driver instance manages devices for.
    pub node_name: String,
    /// Directory the kubelet expects plugin sockets in.
    pub kubelet_plugin_dir: PathBuf,
    /// Directory the kubelet watches for plugin registration sockets.
    pub kubelet_registry_dir: PathBuf,
    /// Socket the container runtime connects to for lifecycle events.
    pub runtime_socket: PathBuf,
    /// CEL expression selecting which discovered devices are published.
    pub selector: Option<String>,
    pub cloud_provider: CloudProvider,
    /// Root of the sysfs mount, overridable for tests.
    pub sysfs_root: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            driver_name: DEFAULT_DRIVER_NAME.to_string(),
            node_name: "localhost".to_string(),
            kubelet_plugin_dir: PathBuf::from(DEFAULT_KUBELET_PLUGIN_PATH),
            kubelet_registry_dir: PathBuf::from(DEFAULT_KUBELET_REGISTRY_PATH),
            runtime_socket: PathBuf::from(DEFAULT_RUNTIME_SOCKET),
            selector: None,
            cloud_provider: CloudProvider::Auto,
            sysfs_root: PathBuf::from("/sys"),
        }
    }
}

impl Config {
    /// The driver's own directory under the kubelet plugin path. Created
    /// with mode 0750 at startup; holds the DRA service socket.
    pub fn driver_plugin_dir(&self) -> PathBuf {
        self.kubelet_plugin_dir.join(&self.driver_name)
    }

    /// Path of the DRA gRPC socket.
    pub fn dra_socket(&self) -> PathBuf {
        self.driver_plugin_dir().join(DRA_SOCKET_NAME)
    }

    /// Path of the registration socket the kubelet discovers.
    pub fn registration_socket(&self) -> PathBuf {
        self.kubelet_registry_dir
            .join(format!("{}.sock", self.driver_name))
    }
}
