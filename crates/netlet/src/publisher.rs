//! The resource publisher. Consumes inventory snapshots, filters them
//! through the operator's selector and applies a single-pool, single-slice
//! ResourceSlice for this node to the cluster API. Publication is paced and
//! best-effort; a failed apply is retried on the next snapshot.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use k8s_openapi::api::resource::v1beta1::ResourceSlice;
use kube::api::{Api, Patch, PatchParams};
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

use crate::device::{DeviceAttribute, NetworkDevice, ATTR_RDMA};
use crate::metrics;
use crate::selector::{filter_devices, DeviceSelector};

/// Minimum spacing between two publications, decoupling publication from
/// discovery bursts.
const PUBLISH_INTERVAL: Duration = Duration::from_secs(3);

pub struct Publisher {
    api: Api<ResourceSlice>,
    driver_name: String,
    node_name: String,
    selector: Option<DeviceSelector>,
    pool_generation: AtomicI64,
}

impl Publisher {
    pub fn new(
        client: kube::Client,
        driver_name: String,
        node_name: String,
        selector: Option<DeviceSelector>,
    ) -> Publisher {
        Publisher {
            api: Api::all(client),
            driver_name,
            node_name,
            selector,
            pool_generation: AtomicI64::new(0),
        }
    }

    fn slice_name(&self) -> String {
        format!("{}-{}", self.node_name, self.driver_name)
    }

    /// Consumes snapshots until the channel closes or shutdown is signalled.
    pub async fn publish_resources(
        &self,
        mut notifications: mpsc::Receiver<Vec<NetworkDevice>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(node = %self.node_name, "publishing resources");
        loop {
            let devices = tokio::select! {
                maybe = notifications.recv() => match maybe {
                    Some(devices) => devices,
                    None => return,
                },
                _ = shutdown.changed() => return,
            };

            let devices = filter_devices(self.selector.as_ref(), devices);
            let total = devices.len();
            let rdma = devices
                .iter()
                .filter(|device| device.bool_attr(ATTR_RDMA) == Some(true))
                .count();

            let generation = self.pool_generation.fetch_add(1, Ordering::Relaxed) + 1;
            let body = slice_body(
                &self.slice_name(),
                &self.driver_name,
                &self.node_name,
                generation,
                &devices,
            );
            let params = PatchParams::apply(&self.driver_name).force();
            match self
                .api
                .patch(&self.slice_name(), &params, &Patch::Apply(&body))
                .await
            {
                Ok(_) => {
                    metrics::record_publication(total, rdma);
                    debug!(devices = total, rdma, "published resource slice");
                }
                Err(err) => {
                    error!(error = %err, "unexpected error trying to publish resources");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(PUBLISH_INTERVAL) => {}
                _ = shutdown.changed() => return,
            }
        }
    }
}

fn attribute_json(attribute: &DeviceAttribute) -> serde_json::Value {
    match attribute {
        DeviceAttribute::String(value) => json!({ "string": value }),
        DeviceAttribute::Int(value) => json!({ "int": value }),
        DeviceAttribute::Bool(value) => json!({ "bool": value }),
        DeviceAttribute::Version(value) => json!({ "version": value }),
    }
}

/// Builds the apply body of the node's ResourceSlice: one pool named after
/// the node, one slice with the filtered device set.
fn slice_body(
    name: &str,
    driver_name: &str,
    node_name: &str,
    generation: i64,
    devices: &[NetworkDevice],
) -> serde_json::Value {
    let device_entries: Vec<serde_json::Value> = devices
        .iter()
        .map(|device| {
            let attributes: serde_json::Map<String, serde_json::Value> = device
                .attributes
                .iter()
                .map(|(name, attribute)| (name.clone(), attribute_json(attribute)))
                .collect();
            let mut basic = json!({ "attributes": attributes });
            if !device.capacity.is_empty() {
                let capacity: serde_json::Map<String, serde_json::Value> = device
                    .capacity
                    .iter()
                    .map(|(name, quantity)| (name.clone(), json!({ "value": quantity })))
                    .collect();
                basic["capacity"] = serde_json::Value::Object(capacity);
            }
            json!({ "name": device.name, "basic": basic })
        })
        .collect();

    json!({
        "apiVersion": "resource.k8s.io/v1beta1",
        "kind": "ResourceSlice",
        "metadata": { "name": name },
        "spec": {
            "driver": driver_name,
            "nodeName": node_name,
            "pool": {
                "name": node_name,
                "generation": generation,
                "resourceSliceCount": 1,
            },
            "devices": device_entries,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{ATTR_IF_NAME, ATTR_MTU};

    fn device(name: &str, ifname: &str, rdma: bool) -> NetworkDevice {
        let mut device = NetworkDevice::new(name);
        device.set(ATTR_IF_NAME, ifname);
        device.set(ATTR_MTU, 1500i64);
        device.set(ATTR_RDMA, rdma);
        device
    }

    #[test]
    fn slice_body_shape() {
        let devices = vec![
            device("net1-0000-8a-00-0", "eth1", true),
            device("net1-0000-8b-00-0", "eth2", false),
        ];
        let body = slice_body("node1-netlet.dev", "netlet.dev", "node1", 3, &devices);

        assert_eq!(body["apiVersion"], "resource.k8s.io/v1beta1");
        assert_eq!(body["spec"]["driver"], "netlet.dev");
        assert_eq!(body["spec"]["nodeName"], "node1");
        assert_eq!(body["spec"]["pool"]["generation"], 3);
        assert_eq!(body["spec"]["pool"]["resourceSliceCount"], 1);

        let entries = body["spec"]["devices"].as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["name"], "net1-0000-8a-00-0");
        let attributes = &entries[0]["basic"]["attributes"];
        assert_eq!(attributes[ATTR_IF_NAME]["string"], "eth1");
        assert_eq!(attributes[ATTR_MTU]["int"], 1500);
        assert_eq!(attributes[ATTR_RDMA]["bool"], true);
        // Capacity is omitted while empty.
        assert!(entries[0]["basic"].get("capacity").is_none());
    }

    #[test]
    fn typed_attribute_wire_forms() {
        assert_eq!(
            attribute_json(&DeviceAttribute::String("x".into())),
            json!({"string": "x"})
        );
        assert_eq!(attribute_json(&DeviceAttribute::Int(7)), json!({"int": 7}));
        assert_eq!(
            attribute_json(&DeviceAttribute::Bool(false)),
            json!({"bool": false})
        );
        assert_eq!(
            attribute_json(&DeviceAttribute::Version("1.2.3".into())),
            json!({"version": "1.2.3"})
        );
    }
}
