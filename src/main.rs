use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use netlet::config::Config;
use netlet::driver::NetworkDriver;
use netlet::inventory::cloud::CloudProvider;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "netletd",
    about = "Node agent for the netlet DRA network device driver",
    version
)]
struct Opts {
    #[arg(
        long,
        env = "NETLET_DRIVER_NAME",
        default_value = netlet::config::DEFAULT_DRIVER_NAME,
        help = "DRA driver name, also the domain of published device attributes"
    )]
    driver_name: String,

    #[arg(
        long,
        env = "NODE_NAME",
        help = "Name of the node this agent runs on (defaults to the hostname)"
    )]
    node_name: Option<String>,

    #[arg(
        long,
        env = "NETLET_KUBELET_PLUGIN_DIR",
        default_value = netlet::config::DEFAULT_KUBELET_PLUGIN_PATH,
        help = "Directory the kubelet expects plugin sockets in"
    )]
    kubelet_plugin_dir: PathBuf,

    #[arg(
        long,
        env = "NETLET_KUBELET_REGISTRY_DIR",
        default_value = netlet::config::DEFAULT_KUBELET_REGISTRY_PATH,
        help = "Directory the kubelet watches for plugin registration sockets"
    )]
    kubelet_registry_dir: PathBuf,

    #[arg(
        long,
        env = "NETLET_RUNTIME_SOCKET",
        default_value = netlet::config::DEFAULT_RUNTIME_SOCKET,
        help = "Socket the container runtime connects to for lifecycle events"
    )]
    runtime_socket: PathBuf,

    #[arg(
        long,
        env = "NETLET_SELECTOR",
        help = "CEL expression selecting which discovered devices are published, \
                e.g. 'device.attributes[\"netlet.dev/rdma\"]'"
    )]
    selector: Option<String>,

    #[arg(
        long,
        env = "NETLET_CLOUD_PROVIDER",
        default_value = "auto",
        help = "Cloud metadata source: auto, gce or off"
    )]
    cloud_provider: CloudProvider,

    #[arg(
        long,
        env = "NETLET_METRICS_ADDR",
        default_value = "0.0.0.0:9177",
        help = "Listen address of the Prometheus metrics endpoint"
    )]
    metrics_addr: SocketAddr,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(opts.metrics_addr)
        .install()
        .context("failed to install metrics exporter")?;

    let node_name = match opts.node_name {
        Some(name) => name,
        None => hostname()?,
    };

    // Client configuration is inferred: in-cluster when running as a pod,
    // kubeconfig for development runs.
    let client = kube::Client::try_default()
        .await
        .context("failed to build Kubernetes client")?;

    let config = Config {
        driver_name: opts.driver_name,
        node_name,
        kubelet_plugin_dir: opts.kubelet_plugin_dir,
        kubelet_registry_dir: opts.kubelet_registry_dir,
        runtime_socket: opts.runtime_socket,
        selector: opts.selector,
        cloud_provider: opts.cloud_provider,
        sysfs_root: PathBuf::from("/sys"),
    };

    let driver = NetworkDriver::start(config, client).await?;

    shutdown_signal().await;
    info!("shutdown signal received");
    driver.stop().await;
    Ok(())
}

fn hostname() -> anyhow::Result<String> {
    let hostname = std::fs::read_to_string("/proc/sys/kernel/hostname")
        .context("could not determine hostname")?;
    Ok(hostname.trim().to_lowercase())
}

async fn shutdown_signal() {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
