//! Cloud provider metadata. A one-shot fetch at startup resolves the
//! instance identity and the per-NIC network names so devices can be
//! selected by the cloud network they are wired to. Failure to reach the
//! metadata server only means the cloud attributes are omitted.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info};

const GCE_METADATA_BASE: &str = "http://metadata.google.internal/computeMetadata/v1";
const GCE_METADATA_HEADER: (&str, &str) = ("Metadata-Flavor", "Google");

/// The metadata server may not be reachable right after boot; retry for a
/// short window before giving up.
const RETRY_WINDOW: Duration = Duration::from_secs(15);
const RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Which metadata endpoint to probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CloudProvider {
    /// Probe known providers and use whichever answers.
    #[default]
    Auto,
    Gce,
    Off,
}

impl std::str::FromStr for CloudProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(CloudProvider::Auto),
            "gce" => Ok(CloudProvider::Gce),
            "off" | "none" => Ok(CloudProvider::Off),
            other => Err(format!("unknown cloud provider {other:?}")),
        }
    }
}

/// One NIC as described by the provider, keyed by MAC at lookup time.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct CloudNic {
    pub ip: String,
    pub ipv6: Vec<String>,
    pub mac: String,
    pub mtu: i64,
    pub network: String,
}

/// Immutable instance identity, resolved once at startup.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CloudInstance {
    pub provider: String,
    pub name: String,
    pub instance_type: String,
    /// Network protocol implied by the machine shape, when the provider has
    /// a fixed mapping (accelerator-optimized machines).
    pub accelerator_protocol: Option<String>,
    pub interfaces: Vec<CloudNic>,
}

impl CloudInstance {
    /// The provider network the NIC with this MAC is attached to.
    pub fn network_for_mac(&self, mac: &str) -> Option<&str> {
        self.interfaces
            .iter()
            .find(|nic| nic.mac.eq_ignore_ascii_case(mac))
            .map(|nic| nic.network.as_str())
    }

    /// Position of the NIC in the provider's interface ordering.
    pub fn index_for_mac(&self, mac: &str) -> Option<i64> {
        self.interfaces
            .iter()
            .position(|nic| nic.mac.eq_ignore_ascii_case(mac))
            .map(|i| i as i64)
    }
}

/// Machine types of accelerator-optimized shapes map one to one to a network
/// protocol on GCE.
fn gce_accelerator_protocol(machine_type: &str) -> Option<String> {
    let map: HashMap<&str, &str> = HashMap::from([
        ("a3-highgpu-1g", "GPUDirect-TCPX"),
        ("a3-highgpu-2g", "GPUDirect-TCPX"),
        ("a3-highgpu-4g", "GPUDirect-TCPX"),
        ("a3-highgpu-8g", "GPUDirect-TCPX"),
        ("a3-edgegpu-8g", "GPUDirect-TCPX"),
        ("a3-megagpu-8g", "GPUDirect-TCPXO"),
    ]);
    // The metadata value is a full resource path, e.g.
    // projects/1234/machineTypes/a3-highgpu-8g.
    let short = machine_type.rsplit('/').next().unwrap_or(machine_type);
    map.get(short).map(|p| (*p).to_string())
}

async fn gce_get(client: &reqwest::Client, path: &str) -> anyhow::Result<String> {
    let response = client
        .get(format!("{GCE_METADATA_BASE}/{path}"))
        .header(GCE_METADATA_HEADER.0, GCE_METADATA_HEADER.1)
        .send()
        .await?
        .error_for_status()?;
    Ok(response.text().await?)
}

async fn fetch_gce_instance(client: &reqwest::Client) -> anyhow::Result<CloudInstance> {
    let name = gce_get(client, "instance/name").await?;
    let machine_type = gce_get(client, "instance/machine-type").await?;
    let interfaces_raw = gce_get(
        client,
        "instance/network-interfaces/?recursive=true&alt=json",
    )
    .await?;
    let interfaces: Vec<CloudNic> = serde_json::from_str(&interfaces_raw)?;

    Ok(CloudInstance {
        provider: "gce".to_string(),
        accelerator_protocol: gce_accelerator_protocol(&machine_type),
        instance_type: machine_type,
        name,
        interfaces,
    })
}

/// Resolves the instance metadata for the configured provider, retrying
/// within a bounded window. `None` when the provider is off, unknown or the
/// metadata server never answered.
pub async fn fetch_instance(provider: CloudProvider) -> Option<CloudInstance> {
    if provider == CloudProvider::Off {
        return None;
    }
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
        .ok()?;

    let deadline = tokio::time::Instant::now() + RETRY_WINDOW;
    loop {
        match fetch_gce_instance(&client).await {
            Ok(instance) => {
                info!(
                    instance = %instance.name,
                    nics = instance.interfaces.len(),
                    "resolved cloud instance metadata"
                );
                return Some(instance);
            }
            Err(err) => {
                debug!(error = %err, "could not get instance metadata, retrying");
            }
        }
        if tokio::time::Instant::now() + RETRY_BACKOFF > deadline {
            info!("no cloud metadata available, continuing without provider attributes");
            return None;
        }
        tokio::time::sleep(RETRY_BACKOFF).await;
    }
}
