//! Metric names and the hook recorder. The library records through the
//! `metrics` facade; the binary decides where the numbers go (a Prometheus
//! exporter in production, nowhere in tests).

use std::time::Instant;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

pub const DRA_REQUESTS_TOTAL: &str = "netlet_driver_dra_plugin_requests_total";
pub const DRA_REQUEST_LATENCY: &str = "netlet_driver_dra_plugin_requests_latency_seconds";
pub const RUNTIME_REQUESTS_TOTAL: &str = "netlet_driver_runtime_plugin_requests_total";
pub const RUNTIME_REQUEST_LATENCY: &str = "netlet_driver_runtime_plugin_requests_latency_seconds";
pub const PUBLISHED_DEVICES: &str = "netlet_driver_published_devices_total";
pub const LAST_PUBLISHED_TIME: &str = "netlet_driver_last_published_time_seconds";

pub const STATUS_SUCCESS: &str = "success";
pub const STATUS_FAILED: &str = "failed";
pub const STATUS_NOOP: &str = "noop";

/// Registers descriptions for everything the driver emits. Safe to call more
/// than once.
pub fn describe() {
    describe_counter!(
        DRA_REQUESTS_TOTAL,
        "Total number of DRA plugin requests."
    );
    describe_histogram!(
        DRA_REQUEST_LATENCY,
        "DRA plugin request latency in seconds."
    );
    describe_counter!(
        RUNTIME_REQUESTS_TOTAL,
        "Total number of container runtime plugin requests."
    );
    describe_histogram!(
        RUNTIME_REQUEST_LATENCY,
        "Container runtime plugin request latency in seconds."
    );
    describe_gauge!(PUBLISHED_DEVICES, "Number of devices in the last published slice.");
    describe_gauge!(
        LAST_PUBLISHED_TIME,
        "The timestamp of the last successful resource publication."
    );
}

/// Measures one plugin hook invocation and records its latency and outcome
/// under the given counter/histogram pair.
pub struct HookTimer {
    total_metric: &'static str,
    latency_metric: &'static str,
    method: &'static str,
    start: Instant,
}

impl HookTimer {
    pub fn dra(method: &'static str) -> Self {
        HookTimer {
            total_metric: DRA_REQUESTS_TOTAL,
            latency_metric: DRA_REQUEST_LATENCY,
            method,
            start: Instant::now(),
        }
    }

    pub fn runtime(method: &'static str) -> Self {
        HookTimer {
            total_metric: RUNTIME_REQUESTS_TOTAL,
            latency_metric: RUNTIME_REQUEST_LATENCY,
            method,
            start: Instant::now(),
        }
    }

    /// Records the outcome; `status` is one of the `STATUS_*` constants.
    pub fn observe(self, status: &'static str) {
        counter!(self.total_metric, "method" => self.method, "status" => status).increment(1);
        histogram!(self.latency_metric, "method" => self.method, "status" => status)
            .record(self.start.elapsed().as_secs_f64());
    }
}

/// Records the published-device counters after a successful publication.
pub fn record_publication(total: usize, rdma: usize) {
    gauge!(PUBLISHED_DEVICES, "feature" => "total").set(total as f64);
    gauge!(PUBLISHED_DEVICES, "feature" => "rdma").set(rdma as f64);
    gauge!(LAST_PUBLISHED_TIME).set(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0),
    );
}
