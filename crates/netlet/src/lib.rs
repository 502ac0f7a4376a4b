//! Node-local core of a Kubernetes Dynamic Resource Allocation (DRA) driver
//! for networking devices.
//!
//! The driver discovers the physical and RDMA network interfaces present on
//! the host and advertises them to the scheduler as a `ResourceSlice` with
//! typed attributes. When pods that claim those devices are started, it
//! moves the selected interfaces into the pod's network namespace and
//! programs addresses, routes, neighbors and policy rules inside it.
//! Teardown reverses the move.
//!
//! The building blocks:
//! * [`inventory::InventoryDb`]: periodic discovery of host network devices
//!   from sysfs, PCI, RDMA and cloud metadata.
//! * [`publisher::Publisher`]: filters the catalog through the operator's
//!   selector and publishes resource slices to the cluster API.
//! * [`claims::ClaimStore`] and [`pod_config::PodConfigStore`]: indexed
//!   bookkeeping between the DRA prepare calls and the runtime events.
//! * [`effector`]: the kernel mutation engine that moves links between
//!   namespaces under OS-thread pinning.
//! * [`driver::NetworkDriver`]: wires everything together and serves the
//!   kubelet and container-runtime plugin sockets.

pub mod claims;
pub mod config;
pub mod device;
pub mod dra;
pub mod driver;
pub mod effector;
pub mod grpc_sock;
pub mod inventory;
pub mod metrics;
pub mod netconfig;
mod nlraw;
pub mod plugin_api;
pub mod pod_config;
pub mod publisher;
pub mod runtime;
pub mod selector;
