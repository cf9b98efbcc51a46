//! Observability infrastructure for the stats spout
//!
//! Provides:
//! - Prometheus self-metrics (dispatch latency, tracked containers, workload outcomes)
//! - Structured JSON logging of lifecycle events with tracing

use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for poll dispatch latency (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<Option<SpoutMetricsInner>> = OnceLock::new();

/// Inner metrics structure that holds the actual Prometheus metrics
struct SpoutMetricsInner {
    poll_dispatch_seconds: Histogram,
    containers_tracked: IntGauge,
    samples_pushed: IntCounter,
    workload_errors: IntCounter,
    worker_faults: IntCounter,
    lifecycle_events: IntCounterVec,
}

/// Register `collector` with the default registry, keeping it usable if that fails
fn register<C>(collector: C) -> C
where
    C: prometheus::core::Collector + Clone + 'static,
{
    if let Err(err) = prometheus::register(Box::new(collector.clone())) {
        warn!(error = %err, "Failed to register self-metric");
    }
    collector
}

impl SpoutMetricsInner {
    fn new() -> Result<Self, prometheus::Error> {
        Ok(Self {
            poll_dispatch_seconds: register(Histogram::with_opts(
                HistogramOpts::new(
                    "spout_poll_dispatch_seconds",
                    "Time spent dispatching one poll tick to the worker pool",
                )
                .buckets(LATENCY_BUCKETS.to_vec()),
            )?),

            containers_tracked: register(IntGauge::new(
                "spout_containers_tracked",
                "Number of containers currently in the registry",
            )?),

            samples_pushed: register(IntCounter::new(
                "spout_samples_pushed_total",
                "Total number of samples delivered to the sink",
            )?),

            workload_errors: register(IntCounter::new(
                "spout_workload_errors_total",
                "Total number of stats workloads that failed",
            )?),

            worker_faults: register(IntCounter::new(
                "spout_worker_faults_total",
                "Total number of worker faults that required a respawn",
            )?),

            lifecycle_events: register(IntCounterVec::new(
                Opts::new(
                    "spout_lifecycle_events_total",
                    "Container lifecycle events applied to the registry",
                ),
                &["action"],
            )?),
        })
    }
}

/// Self-metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone, Copy)]
pub struct SpoutMetrics {
    inner: Option<&'static SpoutMetricsInner>,
}

impl Default for SpoutMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl SpoutMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        let inner = GLOBAL_METRICS.get_or_init(|| match SpoutMetricsInner::new() {
            Ok(inner) => Some(inner),
            Err(err) => {
                warn!(error = %err, "Self-metrics disabled");
                None
            }
        });
        Self {
            inner: inner.as_ref(),
        }
    }

    /// Record how long one poll tick took to dispatch
    pub fn observe_poll_dispatch(&self, duration_secs: f64) {
        if let Some(inner) = self.inner {
            inner.poll_dispatch_seconds.observe(duration_secs);
        }
    }

    pub fn set_containers_tracked(&self, count: usize) {
        if let Some(inner) = self.inner {
            inner.containers_tracked.set(count as i64);
        }
    }

    pub fn inc_samples_pushed(&self) {
        if let Some(inner) = self.inner {
            inner.samples_pushed.inc();
        }
    }

    pub fn inc_workload_errors(&self) {
        if let Some(inner) = self.inner {
            inner.workload_errors.inc();
        }
    }

    pub fn inc_worker_faults(&self) {
        if let Some(inner) = self.inner {
            inner.worker_faults.inc();
        }
    }

    pub fn inc_lifecycle_event(&self, action: &str) {
        if let Some(inner) = self.inner {
            inner.lifecycle_events.with_label_values(&[action]).inc();
        }
    }
}

/// Structured logger for lifecycle events
///
/// Every record carries an `event` field so log pipelines can filter on it.
#[derive(Clone)]
pub struct StructuredLogger {
    host: String,
}

impl StructuredLogger {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }

    /// Log agent startup
    pub fn log_startup(&self, version: &str, sink: &str, workers: usize, containers: usize) {
        info!(
            event = "agent_started",
            host = %self.host,
            agent_version = %version,
            sink = %sink,
            workers = workers,
            containers = containers,
            "Stats spout started"
        );
    }

    /// Log agent shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            host = %self.host,
            reason = %reason,
            "Stats spout shutting down"
        );
    }

    pub fn log_container_started(&self, name: &str) {
        info!(
            event = "container_started",
            host = %self.host,
            container = %name,
            "Container started"
        );
    }

    pub fn log_container_stopped(&self, name: &str) {
        info!(
            event = "container_stopped",
            host = %self.host,
            container = %name,
            "Container stopped"
        );
    }

    pub fn log_container_renamed(&self, old_name: &str, new_name: &str) {
        info!(
            event = "container_renamed",
            host = %self.host,
            old_name = %old_name,
            container = %new_name,
            "Container renamed"
        );
    }
}
