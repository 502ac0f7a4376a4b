//! Indexed store of the resource claims prepared on this node. Records are
//! keyed by `namespace/name` and indexed by every pod they are reserved
//! for, which is how the runtime hooks find the devices a starting pod must
//! receive.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use k8s_openapi::api::resource::v1beta1::ResourceClaim;

/// One device allocation owned by a driver, with the opaque configuration
/// that applies to it (already narrowed by the config's request list).
#[derive(Debug, Clone, PartialEq)]
pub struct AllocatedDevice {
    pub driver: String,
    pub pool: String,
    pub device: String,
    pub request: String,
    /// Raw opaque parameters for this result, when a config matched.
    pub opaque_parameters: Option<Vec<u8>>,
}

/// The locally cached view of a prepared claim.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClaimRecord {
    pub uid: String,
    pub namespace: String,
    pub name: String,
    /// UIDs of the pods the claim is reserved for.
    pub pod_uids: Vec<String>,
    pub devices: Vec<AllocatedDevice>,
}

impl ClaimRecord {
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// Extracts the locally relevant parts of a ResourceClaim: identity, the
/// pods it is reserved for, and the device allocation results with their
/// matching opaque configuration.
pub fn record_from_claim(claim: &ResourceClaim) -> Result<ClaimRecord> {
    let metadata = &claim.metadata;
    let uid = metadata
        .uid
        .clone()
        .ok_or_else(|| anyhow!("claim has no uid"))?;
    let name = metadata
        .name
        .clone()
        .ok_or_else(|| anyhow!("claim has no name"))?;
    let namespace = metadata.namespace.clone().unwrap_or_default();

    let status = claim
        .status
        .as_ref()
        .ok_or_else(|| anyhow!("claim {namespace}/{name} has no status"))?;

    let mut pod_uids = Vec::new();
    if let Some(reserved_for) = &status.reserved_for {
        for reserved in reserved_for {
            // Only pods of the core API group can receive devices.
            if reserved.resource != "pods"
                || reserved.api_group.as_deref().unwrap_or("") != ""
            {
                tracing::info!(
                    resource = %reserved.resource,
                    "driver only supports Pods, skipping unsupported reference"
                );
                continue;
            }
            pod_uids.push(reserved.uid.clone());
        }
    }

    let allocation = status
        .allocation
        .as_ref()
        .ok_or_else(|| anyhow!("claim {namespace}/{name} has no allocation"))?;
    let device_allocation = allocation
        .devices
        .as_ref()
        .ok_or_else(|| anyhow!("claim {namespace}/{name} has no device allocation"))?;

    let configs = device_allocation.config.as_deref().unwrap_or(&[]);
    let mut devices = Vec::new();
    for result in device_allocation.results.as_deref().unwrap_or(&[]) {
        let opaque_parameters = configs
            .iter()
            .filter_map(|config| config.opaque.as_ref().map(|opaque| (config, opaque)))
            .find(|(config, opaque)| {
                opaque.driver == result.driver
                    && config
                        .requests
                        .as_ref()
                        .map(|requests| requests.is_empty() || requests.contains(&result.request))
                        .unwrap_or(true)
            })
            .and_then(|(_, opaque)| serde_json::to_vec(&opaque.parameters.0).ok());

        devices.push(AllocatedDevice {
            driver: result.driver.clone(),
            pool: result.pool.clone(),
            device: result.device.clone(),
            request: result.request.clone(),
            opaque_parameters,
        });
    }

    Ok(ClaimRecord {
        uid,
        namespace,
        name,
        pod_uids,
        devices,
    })
}

/// The store itself: primary index by `namespace/name`, secondary index by
/// pod UID.
#[derive(Clone, Default)]
pub struct ClaimStore {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    by_key: HashMap<String, ClaimRecord>,
    by_pod: HashMap<String, HashSet<String>>,
}

impl ClaimStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: ClaimRecord) {
        let key = record.key();
        let mut inner = self.inner.lock().unwrap();
        if let Some(previous) = inner.by_key.remove(&key) {
            Inner::unindex(&mut inner.by_pod, &key, &previous);
        }
        for pod_uid in &record.pod_uids {
            inner
                .by_pod
                .entry(pod_uid.clone())
                .or_default()
                .insert(key.clone());
        }
        inner.by_key.insert(key, record);
    }

    /// Removes and returns the record with the given namespaced name, if it
    /// was cached.
    pub fn remove(&self, namespace: &str, name: &str) -> Option<ClaimRecord> {
        let key = format!("{namespace}/{name}");
        let mut inner = self.inner.lock().unwrap();
        let record = inner.by_key.remove(&key)?;
        Inner::unindex(&mut inner.by_pod, &key, &record);
        Some(record)
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<ClaimRecord> {
        let key = format!("{namespace}/{name}");
        let inner = self.inner.lock().unwrap();
        inner.by_key.get(&key).cloned()
    }

    /// All records reserved for the given pod.
    pub fn claims_for_pod(&self, pod_uid: &str) -> Vec<ClaimRecord> {
        let inner = self.inner.lock().unwrap();
        let mut records: Vec<ClaimRecord> = inner
            .by_pod
            .get(pod_uid)
            .into_iter()
            .flatten()
            .filter_map(|key| inner.by_key.get(key).cloned())
            .collect();
        records.sort_by(|a, b| a.key().cmp(&b.key()));
        records
    }
}

impl Inner {
    fn unindex(by_pod: &mut HashMap<String, HashSet<String>>, key: &str, record: &ClaimRecord) {
        for pod_uid in &record.pod_uids {
            if let Some(keys) = by_pod.get_mut(pod_uid) {
                keys.remove(key);
                if keys.is_empty() {
                    by_pod.remove(pod_uid);
                }
            }
        }
    }
}
