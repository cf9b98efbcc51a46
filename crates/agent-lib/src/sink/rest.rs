//! HTTP query sink
//!
//! Keeps the latest sample per container and serves all of them as a JSON
//! list on a configurable path.

use super::server::HttpEndpoint;
use super::{Sink, SinkError, SinkFactory, SinkOptions};
use crate::models::ContainerStats;
use async_trait::async_trait;
use axum::{extract::State, routing::get, Json, Router};
use dashmap::DashMap;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Debug, Clone, Deserialize)]
pub struct RestOptions {
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default = "default_path")]
    pub path: String,
}

fn default_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_path() -> String {
    "/stats".to_string()
}

impl Default for RestOptions {
    fn default() -> Self {
        Self {
            address: default_address(),
            path: default_path(),
        }
    }
}

/// Route path with exactly one leading `/`
fn normalize_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}

type LatestSamples = Arc<DashMap<String, ContainerStats>>;

/// Serves the most recent sample of every container
pub struct RestSink {
    latest: LatestSamples,
    endpoint: Option<HttpEndpoint>,
}

impl RestSink {
    /// Sink without a listener, for embedding [`RestSink::router`] elsewhere
    pub fn detached() -> Self {
        Self {
            latest: Arc::new(DashMap::new()),
            endpoint: None,
        }
    }

    /// Bind the configured address and start serving
    pub async fn bind(options: &RestOptions) -> Result<Self, SinkError> {
        let mut sink = Self::detached();
        let router = sink.router(&options.path);
        sink.endpoint = Some(HttpEndpoint::bind("rest", &options.address, router).await?);
        Ok(sink)
    }

    pub fn router(&self, path: &str) -> Router {
        Router::new()
            .route(&normalize_path(path), get(list_samples))
            .with_state(self.latest.clone())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.endpoint.as_ref().map(HttpEndpoint::local_addr)
    }

    /// Latest samples sorted by container name
    pub fn samples(&self) -> Vec<ContainerStats> {
        sorted_samples(&self.latest)
    }
}

fn sorted_samples(latest: &DashMap<String, ContainerStats>) -> Vec<ContainerStats> {
    let mut samples: Vec<ContainerStats> =
        latest.iter().map(|entry| entry.value().clone()).collect();
    samples.sort_by(|a, b| a.container_name.cmp(&b.container_name));
    samples
}

async fn list_samples(State(latest): State<LatestSamples>) -> Json<Vec<ContainerStats>> {
    Json(sorted_samples(&latest))
}

#[async_trait]
impl Sink for RestSink {
    fn name(&self) -> &'static str {
        "rest"
    }

    async fn push(&self, stats: &ContainerStats) -> Result<(), SinkError> {
        self.latest
            .insert(stats.container_name.clone(), stats.clone());
        Ok(())
    }

    async fn clear(&self, container_name: &str) {
        self.latest.remove(container_name);
    }

    async fn close(&self) {
        if let Some(endpoint) = &self.endpoint {
            endpoint.close().await;
        }
    }
}

pub struct RestFactory;

#[async_trait]
impl SinkFactory for RestFactory {
    fn name(&self) -> &'static str {
        "rest"
    }

    async fn create(&self, options: &SinkOptions) -> Result<Arc<dyn Sink>, SinkError> {
        Ok(Arc::new(RestSink::bind(&options.rest).await?))
    }
}
