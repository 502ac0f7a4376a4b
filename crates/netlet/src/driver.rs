//! The network driver: owns the stores and the inventory, implements the
//! DRA prepare/unprepare operations and the container runtime lifecycle
//! hooks, and wires the long-running loops together at startup.

use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use k8s_openapi::api::resource::v1beta1::ResourceClaim;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::claims::{record_from_claim, ClaimRecord, ClaimStore};
use crate::config::Config;
use crate::effector::{rdma, DeviceEffector, KernelEffector};
use crate::inventory::pci::denormalize_pci_address;
use crate::inventory::InventoryDb;
use crate::netconfig::{parse_and_validate, NetworkConfig};
use crate::plugin_api::runtime::v1 as runtime_api;
use crate::pod_config::{PodConfig, PodConfigStore};
use crate::publisher::Publisher;
use crate::selector::DeviceSelector;

/// What kubelet records for one prepared device of a claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedDevice {
    pub requests: Vec<String>,
    pub pool: String,
    pub device: String,
}

/// Whether a hook had any work to do, for the metrics recorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookOutcome {
    Done,
    Noop,
}

struct Inner {
    config: Config,
    claims: ClaimStore,
    pod_configs: PodConfigStore,
    /// Entries consumed from `pod_configs` at pod sandbox start. Stop reads
    /// detach targets from here; create-container reads device grants.
    attachments: PodConfigStore,
    netdb: InventoryDb,
    effector: Arc<dyn DeviceEffector>,
    shutdown_tx: watch::Sender<bool>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

/// The driver. Clones share state; `start` builds the production wiring.
#[derive(Clone)]
pub struct NetworkDriver {
    inner: Arc<Inner>,
}

impl NetworkDriver {
    /// Starts the driver: inventory refresh loop, resource publisher, the
    /// DRA plugin sockets and the runtime event socket. Returns once the
    /// plugin directory and sockets are in place.
    pub async fn start(config: Config, client: kube::Client) -> Result<NetworkDriver> {
        crate::metrics::describe();

        let plugin_dir = config.driver_plugin_dir();
        std::fs::create_dir_all(&plugin_dir)
            .with_context(|| format!("failed to create plugin path {}", plugin_dir.display()))?;
        std::fs::set_permissions(&plugin_dir, std::fs::Permissions::from_mode(0o750))?;

        let selector = match &config.selector {
            Some(expression) => Some(DeviceSelector::compile(expression)?),
            None => None,
        };

        let (netdb, notifications) = InventoryDb::new(&config.sysfs_root, config.cloud_provider);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let driver = NetworkDriver {
            inner: Arc::new(Inner {
                claims: ClaimStore::new(),
                pod_configs: PodConfigStore::new(),
                attachments: PodConfigStore::new(),
                netdb: netdb.clone(),
                effector: Arc::new(KernelEffector::new()),
                shutdown_tx,
                tasks: std::sync::Mutex::new(Vec::new()),
                config,
            }),
        };

        let mut tasks = Vec::new();

        let inventory = netdb.clone();
        let inventory_shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(err) = inventory.run(inventory_shutdown).await {
                warn!(error = %err, "network device inventory failed");
            }
        }));

        let publisher = Publisher::new(
            client.clone(),
            driver.inner.config.driver_name.clone(),
            driver.inner.config.node_name.clone(),
            selector,
        );
        let publisher_shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            publisher
                .publish_resources(notifications, publisher_shutdown)
                .await;
        }));

        tasks.push(
            crate::dra::serve(driver.clone(), client, shutdown_rx.clone())
                .await
                .context("failed to serve DRA plugin")?,
        );
        tasks.push(
            crate::runtime::serve(driver.clone(), shutdown_rx)
                .await
                .context("failed to serve runtime plugin")?,
        );

        *driver.inner.tasks.lock().unwrap() = tasks;
        info!(
            driver = %driver.inner.config.driver_name,
            node = %driver.inner.config.node_name,
            "network driver started"
        );
        Ok(driver)
    }

    /// Signals every loop to stop and waits for them. In-flight attach and
    /// detach operations complete before this returns.
    pub async fn stop(&self) {
        let _ = self.inner.shutdown_tx.send(true);
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.inner.tasks.lock().unwrap());
        for task in tasks {
            let _ = task.await;
        }
        info!("network driver stopped");
    }

    pub fn driver_name(&self) -> &str {
        &self.inner.config.driver_name
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn inventory(&self) -> &InventoryDb {
        &self.inner.netdb
    }

    // DRA operations ------------------------------------------------------

    /// Prepares one claim: caches the record, resolves each allocated device
    /// and stores the desired per-pod state. On error nothing stays cached.
    pub fn prepare_resource_claim(&self, claim: &ResourceClaim) -> Result<Vec<PreparedDevice>> {
        let record = record_from_claim(claim)?;
        debug!(claim = %record.key(), uid = %record.uid, "preparing resource claim");
        self.inner.claims.insert(record.clone());

        match self.prepare_devices(&record) {
            Ok(prepared) => Ok(prepared),
            Err(err) => {
                // A failed claim is not cached, so a retried prepare starts clean.
                self.inner.claims.remove(&record.namespace, &record.name);
                Err(err)
            }
        }
    }

    fn prepare_devices(&self, record: &ClaimRecord) -> Result<Vec<PreparedDevice>> {
        let driver_name = &self.inner.config.driver_name;
        let sysfs_root = &self.inner.config.sysfs_root;

        let mut prepared = Vec::new();
        let mut staged: Vec<(String, String, PodConfig)> = Vec::new();
        for device in &record.devices {
            if device.driver != *driver_name {
                continue;
            }

            let network: NetworkConfig = match &device.opaque_parameters {
                Some(raw) => parse_and_validate(raw)
                    .with_context(|| format!("invalid config for device {}", device.device))?,
                None => NetworkConfig::default(),
            };

            let host_interface = self
                .inner
                .netdb
                .interface_name_for(&device.device)
                .with_context(|| format!("no usable interface for device {}", device.device))?;
            let target = network
                .interface
                .name
                .clone()
                .unwrap_or_else(|| host_interface.clone());

            let rdma_device = denormalize_pci_address(&device.device)
                .and_then(|address| rdma::rdma_device_for_pci(sysfs_root, &address));
            let rdma_char_devices = rdma_device
                .as_deref()
                .map(|name| rdma::char_devices_for(sysfs_root, name))
                .unwrap_or_default();

            let pod_config = PodConfig {
                device: device.device.clone(),
                host_interface,
                rdma_device,
                rdma_char_devices,
                network,
            };
            for pod_uid in &record.pod_uids {
                staged.push((pod_uid.clone(), target.clone(), pod_config.clone()));
            }
            prepared.push(PreparedDevice {
                requests: vec![device.request.clone()],
                pool: device.pool.clone(),
                device: device.device.clone(),
            });
        }

        // Nothing is committed to the pod-config store until every device of
        // the claim resolved.
        for (pod_uid, target, pod_config) in staged {
            self.inner.pod_configs.set(&pod_uid, &target, pod_config);
        }
        Ok(prepared)
    }

    /// Removes the cached claim and drains the desired state of every pod it
    /// was reserved for. Absent claims succeed silently.
    pub fn unprepare_resource_claim(&self, namespace: &str, name: &str) -> Result<()> {
        match self.inner.claims.remove(namespace, name) {
            None => {
                debug!(claim = %format!("{namespace}/{name}"), "claim not cached, nothing to unprepare");
            }
            Some(record) => {
                for pod_uid in &record.pod_uids {
                    let drained = self.inner.pod_configs.drain(pod_uid).len()
                        + self.inner.attachments.drain(pod_uid).len();
                    debug!(pod = %pod_uid, configs = drained, "drained pod configs");
                }
            }
        }
        Ok(())
    }

    // Container runtime hooks ---------------------------------------------

    /// Re-registers the network namespaces of the pods that were already
    /// running when the driver (re)connected to the runtime.
    pub fn synchronize(&self, pods: &[runtime_api::PodSandbox]) -> HookOutcome {
        info!(pods = pods.len(), "synchronized state with the runtime");
        let mut registered = 0;
        for pod in pods {
            // Host network pods are skipped.
            if let Some(netns) = network_namespace(pod) {
                self.inner.netdb.add_pod_netns(&pod_key(pod), &netns);
                registered += 1;
            }
        }
        if registered == 0 {
            HookOutcome::Noop
        } else {
            HookOutcome::Done
        }
    }

    /// Attaches every device prepared for the pod to its network namespace.
    /// The pod's config entries are consumed from the store here, so each
    /// `(pod, iface)` pair drives at most one attach; successfully attached
    /// entries move to the attachment registry for stop-pod-sandbox, failed
    /// entries return to the store so the runtime's re-invocation retries
    /// them. Per-device failures do not stop the remaining devices; the
    /// first error is returned.
    pub async fn run_pod_sandbox(&self, pod: &runtime_api::PodSandbox) -> Result<HookOutcome> {
        let netns = match network_namespace(pod) {
            Some(netns) => netns,
            None => {
                debug!(pod = %pod_key(pod), "pod is using host network, skipping");
                return Ok(HookOutcome::Noop);
            }
        };
        let configs = self.inner.pod_configs.drain(&pod.uid);
        if configs.is_empty() {
            debug!(pod = %pod_key(pod), "pod has no prepared devices");
            return Ok(HookOutcome::Noop);
        }
        self.inner.netdb.add_pod_netns(&pod_key(pod), &netns);

        let mut first_error: Option<anyhow::Error> = None;
        let ordered: BTreeMap<String, PodConfig> = configs.into_iter().collect();
        for (target, config) in ordered {
            info!(
                pod = %pod_key(pod),
                device = %config.device,
                interface = %target,
                "attaching device"
            );
            let effector = self.inner.effector.clone();
            let netns_path = PathBuf::from(&netns);
            let attach_target = target.clone();
            let attach_config = config.clone();
            let result = tokio::task::spawn_blocking(move || {
                effector.attach(&netns_path, &attach_target, &attach_config)
            })
            .await
            .context("attach worker failed")?;

            match result {
                Ok(()) => self.inner.attachments.set(&pod.uid, &target, config),
                Err(err) => {
                    warn!(
                        pod = %pod_key(pod),
                        device = %config.device,
                        error = %err,
                        "error attaching device"
                    );
                    self.inner.pod_configs.set(&pod.uid, &target, config);
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }
        // The inventory sees the moved interfaces on its next refresh.
        self.inner.netdb.sync();
        match first_error {
            Some(err) => Err(err),
            None => Ok(HookOutcome::Done),
        }
    }

    /// Returns every previously attached device to the root namespace and
    /// forgets the pod's namespace. Unconsumed store entries are detached
    /// too, since a failed attach may have left them partially applied.
    /// Detach failures are logged and skipped; the kernel reclaims the
    /// interfaces when the namespace dies.
    pub async fn stop_pod_sandbox(&self, pod: &runtime_api::PodSandbox) -> Result<HookOutcome> {
        let key = pod_key(pod);
        let mut configs = self.inner.attachments.drain(&pod.uid);
        for (target, config) in self.inner.pod_configs.drain(&pod.uid) {
            configs.entry(target).or_insert(config);
        }
        let netns = network_namespace(pod).or_else(|| self.inner.netdb.get_pod_netns(&key));
        self.inner.netdb.remove_pod_netns(&key);

        let netns = match (configs.is_empty(), netns) {
            (true, _) | (_, None) => {
                debug!(pod = %key, "nothing to detach");
                return Ok(HookOutcome::Noop);
            }
            (false, Some(netns)) => netns,
        };

        for (target, config) in configs {
            info!(pod = %key, device = %config.device, interface = %target, "detaching device");
            let effector = self.inner.effector.clone();
            let netns_path = PathBuf::from(&netns);
            let detach_config = config.clone();
            let result = tokio::task::spawn_blocking(move || {
                effector.detach(&netns_path, &target, &detach_config)
            })
            .await
            .context("detach worker failed")?;
            if let Err(err) = result {
                warn!(pod = %key, device = %config.device, error = %err, "error detaching device");
            }
        }
        self.inner.netdb.sync();
        Ok(HookOutcome::Done)
    }

    /// Drops the pod's desired and attached state once the sandbox is gone.
    pub fn remove_pod_sandbox(&self, pod: &runtime_api::PodSandbox) -> HookOutcome {
        let drained = self.inner.pod_configs.drain(&pod.uid).len()
            + self.inner.attachments.drain(&pod.uid).len();
        if drained == 0 {
            HookOutcome::Noop
        } else {
            HookOutcome::Done
        }
    }

    /// Grants the pod's containers the character devices their claimed
    /// interfaces need, deduplicated by path across interfaces. Both the
    /// attachment registry (devices consumed at sandbox start) and any
    /// unconsumed store entries contribute.
    pub fn create_container(
        &self,
        pod: &runtime_api::PodSandbox,
        container: &runtime_api::Container,
    ) -> Option<runtime_api::ContainerAdjustment> {
        let attached = self.inner.attachments.get(&pod.uid);
        let pending = self.inner.pod_configs.get(&pod.uid);
        let mut by_path: BTreeMap<String, crate::pod_config::LinuxDeviceSpec> = BTreeMap::new();
        for config in attached.values().chain(pending.values()) {
            for device in &config.rdma_char_devices {
                by_path.insert(device.path.clone(), device.clone());
            }
        }
        if by_path.is_empty() {
            return None;
        }
        debug!(
            pod = %pod_key(pod),
            container = %container.name,
            devices = by_path.len(),
            "granting devices to container"
        );

        let mut devices = Vec::new();
        let mut cgroup_rules = Vec::new();
        for spec in by_path.into_values() {
            devices.push(runtime_api::LinuxDevice {
                path: spec.path.clone(),
                r#type: spec.dev_type.clone(),
                major: spec.major,
                minor: spec.minor,
                file_mode: 0o666,
            });
            cgroup_rules.push(runtime_api::LinuxDeviceCgroup {
                allow: true,
                r#type: spec.dev_type,
                major: spec.major,
                minor: spec.minor,
                access: "rwm".to_string(),
            });
        }
        Some(runtime_api::ContainerAdjustment {
            linux: Some(runtime_api::LinuxContainerAdjustment {
                devices,
                device_cgroup_rules: cgroup_rules,
            }),
        })
    }
}

/// The pod's network namespace path from its linux namespace descriptors,
/// `None` for host-network pods.
pub fn network_namespace(pod: &runtime_api::PodSandbox) -> Option<String> {
    pod.linux
        .as_ref()?
        .namespaces
        .iter()
        .find(|ns| ns.r#type == "network" && !ns.path.is_empty())
        .map(|ns| ns.path.clone())
}

pub fn pod_key(pod: &runtime_api::PodSandbox) -> String {
    format!("{}/{}", pod.namespace, pod.name)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::claims::tests::claim_fixture;
    use crate::effector::fake::RecordingEffector;
    use crate::inventory::cloud::CloudProvider;
    use serde_json::json;

    /// A driver wired with fakes: a recording effector, a temp sysfs tree
    /// and no kube client dependencies.
    pub(crate) fn test_driver(sysfs_root: &std::path::Path) -> (NetworkDriver, RecordingEffector) {
        let effector = RecordingEffector::default();
        let (netdb, _notifications) = InventoryDb::new(sysfs_root, CloudProvider::Off);
        let (shutdown_tx, _shutdown_rx) = watch::channel(false);
        let config = Config {
            sysfs_root: sysfs_root.to_path_buf(),
            kubelet_plugin_dir: sysfs_root.join("plugins"),
            kubelet_registry_dir: sysfs_root.join("plugins_registry"),
            runtime_socket: sysfs_root.join("runtime.sock"),
            ..Config::default()
        };
        let driver = NetworkDriver {
            inner: Arc::new(Inner {
                config,
                claims: ClaimStore::new(),
                pod_configs: PodConfigStore::new(),
                attachments: PodConfigStore::new(),
                netdb,
                effector: Arc::new(effector.clone()),
                shutdown_tx,
                tasks: std::sync::Mutex::new(Vec::new()),
            }),
        };
        (driver, effector)
    }

    fn sandbox(uid: &str, netns: Option<&str>) -> runtime_api::PodSandbox {
        runtime_api::PodSandbox {
            id: format!("sandbox-{uid}"),
            name: "test-pod".to_string(),
            namespace: "test-ns".to_string(),
            uid: uid.to_string(),
            linux: Some(runtime_api::LinuxPodSandbox {
                namespaces: netns
                    .map(|path| {
                        vec![runtime_api::LinuxNamespace {
                            r#type: "network".to_string(),
                            path: path.to_string(),
                        }]
                    })
                    .unwrap_or_default(),
            }),
            ips: vec![],
        }
    }

    fn fake_netns(dir: &std::path::Path) -> String {
        let path = dir.join("netns");
        std::fs::write(&path, "").unwrap();
        path.to_string_lossy().to_string()
    }

    #[test]
    fn prepare_claim_stores_pod_config() {
        let tmp = tempfile::tempdir().unwrap();
        crate::inventory::pci::tests::fake_pci_device(
            tmp.path(),
            "0000:8a:00.0",
            "0x020000",
            Some("eth1"),
        );
        let (driver, _effector) = test_driver(tmp.path());

        let claim = claim_fixture(
            "uid-1",
            "claim-a",
            "pod-1",
            "net1-0000-8a-00-0",
            Some(json!({
                "interface": {"name": "net0", "addresses": ["192.168.1.10/24"]},
                "routes": [{"destination": "10.0.0.0/8", "gateway": "192.168.1.1"}],
            })),
        );
        let prepared = driver.prepare_resource_claim(&claim).unwrap();
        assert_eq!(prepared.len(), 1);
        assert_eq!(prepared[0].device, "net1-0000-8a-00-0");
        assert_eq!(prepared[0].requests, vec!["nic"]);

        let configs = driver.inner.pod_configs.get("pod-1");
        assert_eq!(configs.len(), 1);
        let config = &configs["net0"];
        assert_eq!(config.host_interface, "eth1");
        assert_eq!(config.network.interface.addresses, vec!["192.168.1.10/24"]);
    }

    #[test]
    fn prepare_defaults_target_to_host_interface() {
        let tmp = tempfile::tempdir().unwrap();
        crate::inventory::pci::tests::fake_pci_device(
            tmp.path(),
            "0000:8a:00.0",
            "0x020000",
            Some("eth1"),
        );
        let (driver, _effector) = test_driver(tmp.path());

        let claim = claim_fixture("uid-1", "claim-a", "pod-1", "net1-0000-8a-00-0", None);
        driver.prepare_resource_claim(&claim).unwrap();
        let configs = driver.inner.pod_configs.get("pod-1");
        assert!(configs.contains_key("eth1"));
    }

    #[test]
    fn prepare_rejects_invalid_config_without_caching() {
        let tmp = tempfile::tempdir().unwrap();
        crate::inventory::pci::tests::fake_pci_device(
            tmp.path(),
            "0000:8a:00.0",
            "0x020000",
            Some("eth1"),
        );
        let (driver, _effector) = test_driver(tmp.path());

        let claim = claim_fixture(
            "uid-1",
            "claim-a",
            "pod-1",
            "net1-0000-8a-00-0",
            Some(json!({"gateways": "x"})),
        );
        let err = driver.prepare_resource_claim(&claim).unwrap_err();
        assert!(format!("{err:#}").contains("gateways"));
        // Nothing was cached or staged.
        assert!(driver.inner.claims.get("default", "claim-a").is_none());
        assert!(driver.inner.pod_configs.get("pod-1").is_empty());
    }

    #[test]
    fn prepare_fails_for_missing_device() {
        let tmp = tempfile::tempdir().unwrap();
        let (driver, _effector) = test_driver(tmp.path());
        let claim = claim_fixture("uid-1", "claim-a", "pod-1", "net1-0000-8a-00-0", None);
        assert!(driver.prepare_resource_claim(&claim).is_err());
        assert!(driver.inner.claims.get("default", "claim-a").is_none());
    }

    #[test]
    fn unprepare_is_idempotent_and_drains() {
        let tmp = tempfile::tempdir().unwrap();
        crate::inventory::pci::tests::fake_pci_device(
            tmp.path(),
            "0000:8a:00.0",
            "0x020000",
            Some("eth1"),
        );
        let (driver, _effector) = test_driver(tmp.path());
        let claim = claim_fixture("uid-1", "claim-a", "pod-1", "net1-0000-8a-00-0", None);
        driver.prepare_resource_claim(&claim).unwrap();
        assert_eq!(driver.inner.pod_configs.get("pod-1").len(), 1);

        driver.unprepare_resource_claim("default", "claim-a").unwrap();
        assert!(driver.inner.pod_configs.get("pod-1").is_empty());
        // A second unprepare of the same claim succeeds silently.
        driver.unprepare_resource_claim("default", "claim-a").unwrap();
    }

    #[tokio::test]
    async fn run_pod_sandbox_attaches_prepared_devices() {
        let tmp = tempfile::tempdir().unwrap();
        crate::inventory::pci::tests::fake_pci_device(
            tmp.path(),
            "0000:8a:00.0",
            "0x020000",
            Some("eth1"),
        );
        let (driver, effector) = test_driver(tmp.path());
        let claim = claim_fixture("uid-1", "claim-a", "pod-1", "net1-0000-8a-00-0", None);
        driver.prepare_resource_claim(&claim).unwrap();

        let netns = fake_netns(tmp.path());
        let pod = sandbox("pod-1", Some(&netns));
        let outcome = driver.run_pod_sandbox(&pod).await.unwrap();
        assert_eq!(outcome, HookOutcome::Done);

        let attached = effector.attached.lock().unwrap();
        assert_eq!(attached.len(), 1);
        assert_eq!(attached[0].1, "eth1");
        assert_eq!(attached[0].2, "net1-0000-8a-00-0");
        drop(attached);

        // The entry was consumed from the store into the attachment
        // registry, so a repeated start does not attach a second time.
        assert!(driver.inner.pod_configs.get("pod-1").is_empty());
        assert_eq!(driver.inner.attachments.get("pod-1").len(), 1);
        assert_eq!(
            driver.run_pod_sandbox(&pod).await.unwrap(),
            HookOutcome::Noop
        );
        assert_eq!(effector.attached.lock().unwrap().len(), 1);

        // The pod's namespace is registered for the merge rule.
        assert_eq!(
            driver.inner.netdb.get_pod_netns("test-ns/test-pod").as_deref(),
            Some(netns.as_str())
        );
    }

    #[tokio::test]
    async fn run_pod_sandbox_without_claims_is_noop() {
        let tmp = tempfile::tempdir().unwrap();
        let (driver, effector) = test_driver(tmp.path());
        let netns = fake_netns(tmp.path());
        let pod = sandbox("pod-1", Some(&netns));
        assert_eq!(driver.run_pod_sandbox(&pod).await.unwrap(), HookOutcome::Noop);
        assert!(effector.attached.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn run_pod_sandbox_host_network_is_noop() {
        let tmp = tempfile::tempdir().unwrap();
        crate::inventory::pci::tests::fake_pci_device(
            tmp.path(),
            "0000:8a:00.0",
            "0x020000",
            Some("eth1"),
        );
        let (driver, effector) = test_driver(tmp.path());
        let claim = claim_fixture("uid-1", "claim-a", "pod-1", "net1-0000-8a-00-0", None);
        driver.prepare_resource_claim(&claim).unwrap();

        let pod = sandbox("pod-1", None);
        assert_eq!(driver.run_pod_sandbox(&pod).await.unwrap(), HookOutcome::Noop);
        assert!(effector.attached.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn run_pod_sandbox_continues_after_device_error() {
        let tmp = tempfile::tempdir().unwrap();
        for (address, ifname) in [("0000:8a:00.0", "eth1"), ("0000:8b:00.0", "eth2")] {
            crate::inventory::pci::tests::fake_pci_device(
                tmp.path(),
                address,
                "0x020000",
                Some(ifname),
            );
        }
        let (driver, effector) = test_driver(tmp.path());
        driver
            .prepare_resource_claim(&claim_fixture(
                "uid-1",
                "claim-a",
                "pod-1",
                "net1-0000-8a-00-0",
                None,
            ))
            .unwrap();
        driver
            .prepare_resource_claim(&claim_fixture(
                "uid-2",
                "claim-b",
                "pod-1",
                "net1-0000-8b-00-0",
                None,
            ))
            .unwrap();

        *effector.fail_attach_of.lock().unwrap() = Some("eth1".to_string());
        let netns = fake_netns(tmp.path());
        let pod = sandbox("pod-1", Some(&netns));
        let err = driver.run_pod_sandbox(&pod).await.unwrap_err();
        assert!(err.to_string().contains("injected attach failure"));

        // The second device was still attached and moved to the attachment
        // registry; the failed entry went back to the store for a retry.
        {
            let attached = effector.attached.lock().unwrap();
            assert_eq!(attached.len(), 1);
            assert_eq!(attached[0].1, "eth2");
        }
        assert!(driver.inner.pod_configs.get("pod-1").contains_key("eth1"));
        assert!(driver.inner.attachments.get("pod-1").contains_key("eth2"));

        // A re-invoked start converges: only the returned entry is retried.
        *effector.fail_attach_of.lock().unwrap() = None;
        assert_eq!(
            driver.run_pod_sandbox(&pod).await.unwrap(),
            HookOutcome::Done
        );
        let attached = effector.attached.lock().unwrap();
        assert_eq!(attached.len(), 2);
        assert_eq!(attached[1].1, "eth1");
        drop(attached);
        assert!(driver.inner.pod_configs.get("pod-1").is_empty());
        assert_eq!(driver.inner.attachments.get("pod-1").len(), 2);
    }

    #[tokio::test]
    async fn stop_pod_sandbox_detaches_and_unregisters() {
        let tmp = tempfile::tempdir().unwrap();
        crate::inventory::pci::tests::fake_pci_device(
            tmp.path(),
            "0000:8a:00.0",
            "0x020000",
            Some("eth1"),
        );
        let (driver, effector) = test_driver(tmp.path());
        driver
            .prepare_resource_claim(&claim_fixture(
                "uid-1",
                "claim-a",
                "pod-1",
                "net1-0000-8a-00-0",
                None,
            ))
            .unwrap();

        let netns = fake_netns(tmp.path());
        let pod = sandbox("pod-1", Some(&netns));
        driver.run_pod_sandbox(&pod).await.unwrap();
        assert_eq!(driver.stop_pod_sandbox(&pod).await.unwrap(), HookOutcome::Done);

        let detached = effector.detached.lock().unwrap();
        assert_eq!(detached.len(), 1);
        assert_eq!(detached[0].1, "eth1");
        drop(detached);
        assert_eq!(driver.inner.netdb.get_pod_netns("test-ns/test-pod"), None);
        assert!(driver.inner.attachments.get("pod-1").is_empty());

        // Stopping again is a no-op: the attachment registry was drained.
        assert_eq!(
            driver.stop_pod_sandbox(&pod).await.unwrap(),
            HookOutcome::Noop
        );
    }

    #[test]
    fn remove_pod_sandbox_drains() {
        let tmp = tempfile::tempdir().unwrap();
        crate::inventory::pci::tests::fake_pci_device(
            tmp.path(),
            "0000:8a:00.0",
            "0x020000",
            Some("eth1"),
        );
        let (driver, _effector) = test_driver(tmp.path());
        driver
            .prepare_resource_claim(&claim_fixture(
                "uid-1",
                "claim-a",
                "pod-1",
                "net1-0000-8a-00-0",
                None,
            ))
            .unwrap();

        let pod = sandbox("pod-1", None);
        assert_eq!(driver.remove_pod_sandbox(&pod), HookOutcome::Done);
        assert_eq!(driver.remove_pod_sandbox(&pod), HookOutcome::Noop);
    }

    #[test]
    fn create_container_deduplicates_devices_by_path() {
        let tmp = tempfile::tempdir().unwrap();
        let (driver, _effector) = test_driver(tmp.path());

        let char_device = crate::pod_config::LinuxDeviceSpec {
            path: "/dev/infiniband/uverbs0".to_string(),
            dev_type: "c".to_string(),
            major: 231,
            minor: 192,
        };
        // One interface already attached, one still pending: the grant is
        // deduplicated by path across both.
        driver.inner.attachments.set(
            "pod-1",
            "eth0",
            PodConfig {
                rdma_char_devices: vec![char_device.clone()],
                ..Default::default()
            },
        );
        driver.inner.pod_configs.set(
            "pod-1",
            "eth1",
            PodConfig {
                rdma_char_devices: vec![char_device.clone()],
                ..Default::default()
            },
        );

        let pod = sandbox("pod-1", None);
        let container = runtime_api::Container {
            id: "ctr-1".to_string(),
            pod_sandbox_id: pod.id.clone(),
            name: "test-container".to_string(),
        };
        let adjustment = driver.create_container(&pod, &container).unwrap();
        let linux = adjustment.linux.unwrap();
        assert_eq!(linux.devices.len(), 1);
        assert_eq!(linux.devices[0].path, "/dev/infiniband/uverbs0");
        assert_eq!(linux.device_cgroup_rules.len(), 1);
        assert_eq!(linux.device_cgroup_rules[0].access, "rwm");
    }

    #[test]
    fn create_container_without_devices_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let (driver, _effector) = test_driver(tmp.path());
        let pod = sandbox("pod-1", None);
        let container = runtime_api::Container {
            id: "ctr-1".to_string(),
            pod_sandbox_id: pod.id.clone(),
            name: "test-container".to_string(),
        };
        assert!(driver.create_container(&pod, &container).is_none());
    }

    #[test]
    fn synchronize_registers_namespaces() {
        let tmp = tempfile::tempdir().unwrap();
        let (driver, _effector) = test_driver(tmp.path());
        let netns = fake_netns(tmp.path());
        let pods = vec![sandbox("pod-1", Some(&netns)), sandbox("pod-2", None)];
        assert_eq!(driver.synchronize(&pods), HookOutcome::Done);
        assert!(driver.inner.netdb.get_pod_netns("test-ns/test-pod").is_some());
    }
}
