//! Pull-based metrics sink
//!
//! Owns a private registry rather than the process-wide default one, so the
//! engine's own self-metrics and container samples never mix.

use super::server::HttpEndpoint;
use super::{Sink, SinkError, SinkFactory, SinkOptions};
use crate::models::ContainerStats;
use async_trait::async_trait;
use axum::{extract::State, http::header, response::IntoResponse, routing::get, Router};
use prometheus::{Encoder, GaugeVec, IntGaugeVec, Opts, Registry, TextEncoder};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, Deserialize)]
pub struct PrometheusOptions {
    #[serde(default = "default_address")]
    pub address: String,
}

fn default_address() -> String {
    "0.0.0.0:8080".to_string()
}

impl Default for PrometheusOptions {
    fn default() -> Self {
        Self {
            address: default_address(),
        }
    }
}

const CONTAINER_LABEL: &str = "container";

struct ContainerGauges {
    registry: Registry,
    cpu_usage_percent: GaugeVec,
    memory_usage_percent: GaugeVec,
    memory_usage_bytes: IntGaugeVec,
    network_tx_bytes: IntGaugeVec,
    network_rx_bytes: IntGaugeVec,
}

impl ContainerGauges {
    fn new() -> Result<Self, SinkError> {
        let registry = Registry::new();

        let cpu_usage_percent = GaugeVec::new(
            Opts::new("cpu_usage_percent", "Current CPU usage percent."),
            &[CONTAINER_LABEL],
        )?;
        let memory_usage_percent = GaugeVec::new(
            Opts::new("memory_usage_percent", "Current memory usage percent."),
            &[CONTAINER_LABEL],
        )?;
        let memory_usage_bytes = IntGaugeVec::new(
            Opts::new("memory_usage_bytes", "Current memory usage in bytes."),
            &[CONTAINER_LABEL],
        )?;
        let network_tx_bytes = IntGaugeVec::new(
            Opts::new("network_tx_bytes", "Bytes transmitted over all interfaces."),
            &[CONTAINER_LABEL],
        )?;
        let network_rx_bytes = IntGaugeVec::new(
            Opts::new("network_rx_bytes", "Bytes received over all interfaces."),
            &[CONTAINER_LABEL],
        )?;

        registry.register(Box::new(cpu_usage_percent.clone()))?;
        registry.register(Box::new(memory_usage_percent.clone()))?;
        registry.register(Box::new(memory_usage_bytes.clone()))?;
        registry.register(Box::new(network_tx_bytes.clone()))?;
        registry.register(Box::new(network_rx_bytes.clone()))?;

        Ok(Self {
            registry,
            cpu_usage_percent,
            memory_usage_percent,
            memory_usage_bytes,
            network_tx_bytes,
            network_rx_bytes,
        })
    }

    fn set(&self, stats: &ContainerStats) {
        let labels = [stats.container_name.as_str()];
        self.cpu_usage_percent
            .with_label_values(&labels)
            .set(stats.cpu_percent);
        self.memory_usage_percent
            .with_label_values(&labels)
            .set(stats.memory_percent);
        self.memory_usage_bytes
            .with_label_values(&labels)
            .set(saturating_i64(stats.memory_usage_bytes));
        self.network_tx_bytes
            .with_label_values(&labels)
            .set(saturating_i64(stats.tx_bytes_total));
        self.network_rx_bytes
            .with_label_values(&labels)
            .set(saturating_i64(stats.rx_bytes_total));
    }

    fn remove(&self, container_name: &str) {
        let labels = [container_name];
        // Missing label sets only mean nothing was pushed yet
        let _ = self.cpu_usage_percent.remove_label_values(&labels);
        let _ = self.memory_usage_percent.remove_label_values(&labels);
        let _ = self.memory_usage_bytes.remove_label_values(&labels);
        let _ = self.network_tx_bytes.remove_label_values(&labels);
        let _ = self.network_rx_bytes.remove_label_values(&labels);
    }

    fn render(&self) -> Result<String, SinkError> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

fn saturating_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Exposes per-container gauges for scraping
pub struct PrometheusSink {
    gauges: Arc<ContainerGauges>,
    endpoint: Option<HttpEndpoint>,
}

impl PrometheusSink {
    /// Sink without a listener, for embedding [`PrometheusSink::router`] elsewhere
    pub fn detached() -> Result<Self, SinkError> {
        Ok(Self {
            gauges: Arc::new(ContainerGauges::new()?),
            endpoint: None,
        })
    }

    pub async fn bind(options: &PrometheusOptions) -> Result<Self, SinkError> {
        let mut sink = Self::detached()?;
        let router = sink.router();
        sink.endpoint = Some(HttpEndpoint::bind("prometheus", &options.address, router).await?);
        Ok(sink)
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/metrics", get(scrape))
            .with_state(self.gauges.clone())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.endpoint.as_ref().map(HttpEndpoint::local_addr)
    }

    /// Current exposition text
    pub fn render(&self) -> Result<String, SinkError> {
        self.gauges.render()
    }
}

async fn scrape(State(gauges): State<Arc<ContainerGauges>>) -> impl IntoResponse {
    match gauges.render() {
        Ok(body) => (
            axum::http::StatusCode::OK,
            [(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)],
            body,
        ),
        Err(err) => {
            warn!(error = %err, "Failed to encode container metrics");
            (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, "text/plain")],
                err.to_string(),
            )
        }
    }
}

#[async_trait]
impl Sink for PrometheusSink {
    fn name(&self) -> &'static str {
        "prometheus"
    }

    async fn push(&self, stats: &ContainerStats) -> Result<(), SinkError> {
        self.gauges.set(stats);
        Ok(())
    }

    async fn clear(&self, container_name: &str) {
        self.gauges.remove(container_name);
    }

    async fn close(&self) {
        if let Some(endpoint) = &self.endpoint {
            endpoint.close().await;
        }
    }
}

pub struct PrometheusFactory;

#[async_trait]
impl SinkFactory for PrometheusFactory {
    fn name(&self) -> &'static str {
        "prometheus"
    }

    async fn create(&self, options: &SinkOptions) -> Result<Arc<dyn Sink>, SinkError> {
        Ok(Arc::new(PrometheusSink::bind(&options.prometheus).await?))
    }
}
