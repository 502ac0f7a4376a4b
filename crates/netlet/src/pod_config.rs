//! Desired state per pod and interface, produced by claim preparation and
//! consumed (and removed) by the runtime lifecycle hooks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::netconfig::NetworkConfig;

/// A Linux device node a container must be granted access to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinuxDeviceSpec {
    pub path: String,
    /// `c` for character devices.
    pub dev_type: String,
    pub major: i64,
    pub minor: i64,
}

/// Everything the effector needs to realize one claimed device for a pod.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PodConfig {
    /// Normalized name of the allocated device.
    pub device: String,
    /// Interface name on the host at preparation time; the interface is
    /// renamed back to this on detach.
    pub host_interface: String,
    /// RDMA device associated with the interface, when there is one.
    pub rdma_device: Option<String>,
    /// Character devices to grant to the pod's containers.
    pub rdma_char_devices: Vec<LinuxDeviceSpec>,
    pub network: NetworkConfig,
}

/// Concurrency-safe map of pod UID to the per-interface desired state. The
/// inner map is keyed by the interface name the device will carry inside the
/// pod. The runtime event handler consumes-and-removes a pod's entries on
/// pod sandbox start, which is what guarantees at most one effector
/// invocation per `(pod-UID, iface)` pair.
#[derive(Clone, Default)]
pub struct PodConfigStore {
    inner: Arc<Mutex<HashMap<String, HashMap<String, PodConfig>>>>,
}

impl PodConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the config for `(pod_uid, interface)`.
    pub fn set(&self, pod_uid: &str, interface: &str, config: PodConfig) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .entry(pod_uid.to_string())
            .or_default()
            .insert(interface.to_string(), config);
    }

    /// The configs for a pod, keyed by interface name. Empty when the pod
    /// has none.
    pub fn get(&self, pod_uid: &str) -> HashMap<String, PodConfig> {
        let inner = self.inner.lock().unwrap();
        inner.get(pod_uid).cloned().unwrap_or_default()
    }

    /// Atomically removes and returns the configs for a pod.
    pub fn drain(&self, pod_uid: &str) -> HashMap<String, PodConfig> {
        let mut inner = self.inner.lock().unwrap();
        inner.remove(pod_uid).unwrap_or_default()
    }

    pub fn pods(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner.keys().cloned().collect()
    }
}
