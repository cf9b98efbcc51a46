//! Sinks receiving normalised container samples
//!
//! A sink is selected by name at startup through the [`SinkCatalog`]. Every
//! sink must accept concurrent `push` calls from the stats workers and
//! concurrent `clear` calls from the event monitor.

mod influxdb;
mod mongodb;
mod prometheus;
mod rest;
mod server;
mod stdout;

pub use self::influxdb::{InfluxDbFactory, InfluxDbOptions, InfluxDbSink};
pub use self::mongodb::{MongoFactory, MongoOptions, MongoSink};
pub use self::prometheus::{PrometheusFactory, PrometheusOptions, PrometheusSink};
pub use self::rest::{RestFactory, RestOptions, RestSink};
pub use self::stdout::{StdoutFactory, StdoutSink};

use crate::models::ContainerStats;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// Errors raised by sinks and the sink catalog
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("unknown sink `{0}`")]
    Unknown(String),
    #[error("sink name must not be empty")]
    EmptyName,
    #[error("sink `{0}` is already registered")]
    Duplicate(String),
    #[error("invalid options for sink `{sink}`: {reason}")]
    InvalidOptions { sink: &'static str, reason: String },
    #[error("failed to bind `{address}`: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("write rejected with status {status}: {body}")]
    Rejected {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("metric error: {0}")]
    Metrics(#[from] ::prometheus::Error),
    #[error("document store error: {0}")]
    Mongo(#[from] ::mongodb::error::Error),
    #[error("failed to encode document: {0}")]
    Document(#[from] ::mongodb::bson::ser::Error),
    #[error("sink is closed")]
    Closed,
}

/// Consumer of normalised samples
#[async_trait]
pub trait Sink: Send + Sync {
    /// Canonical identifier used for selection
    fn name(&self) -> &'static str;

    /// Deliver one sample
    async fn push(&self, stats: &ContainerStats) -> Result<(), SinkError>;

    /// Drop any state retained for a container that stopped or was renamed
    async fn clear(&self, container_name: &str);

    /// Release resources; called once at shutdown
    async fn close(&self);
}

/// Options for every provided sink; each factory reads its own section
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SinkOptions {
    #[serde(default)]
    pub rest: RestOptions,
    #[serde(default)]
    pub prometheus: PrometheusOptions,
    #[serde(default)]
    pub influxdb: InfluxDbOptions,
    #[serde(default)]
    pub mongodb: MongoOptions,
}

/// Builds one kind of sink from its options
#[async_trait]
pub trait SinkFactory: Send + Sync {
    fn name(&self) -> &'static str;

    async fn create(&self, options: &SinkOptions) -> Result<Arc<dyn Sink>, SinkError>;
}

/// Named sink factories
#[derive(Default)]
pub struct SinkCatalog {
    factories: BTreeMap<String, Arc<dyn SinkFactory>>,
}

impl SinkCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog holding every provided sink
    pub fn with_defaults() -> Self {
        let mut catalog = Self::new();
        let defaults: [Arc<dyn SinkFactory>; 5] = [
            Arc::new(StdoutFactory),
            Arc::new(RestFactory),
            Arc::new(PrometheusFactory),
            Arc::new(InfluxDbFactory),
            Arc::new(MongoFactory),
        ];
        for factory in defaults {
            // Built-in names are distinct and non-empty
            let _ = catalog.register(factory);
        }
        catalog
    }

    /// Register a factory; empty and duplicate names are rejected
    pub fn register(&mut self, factory: Arc<dyn SinkFactory>) -> Result<(), SinkError> {
        let name = factory.name();
        if name.is_empty() {
            return Err(SinkError::EmptyName);
        }
        if self.factories.contains_key(name) {
            return Err(SinkError::Duplicate(name.to_string()));
        }
        self.factories.insert(name.to_string(), factory);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Create the sink registered under `name`
    pub async fn create(
        &self,
        name: &str,
        options: &SinkOptions,
    ) -> Result<Arc<dyn Sink>, SinkError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| SinkError::Unknown(name.to_string()))?;
        let sink = factory.create(options).await?;
        info!(sink = %sink.name(), "Sink created");
        Ok(sink)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NamedFactory(&'static str);

    #[async_trait]
    impl SinkFactory for NamedFactory {
        fn name(&self) -> &'static str {
            self.0
        }

        async fn create(&self, _options: &SinkOptions) -> Result<Arc<dyn Sink>, SinkError> {
            Ok(Arc::new(StdoutSink::new()))
        }
    }

    #[test]
    fn test_defaults_registered() {
        let catalog = SinkCatalog::with_defaults();
        assert_eq!(
            catalog.names(),
            vec!["influxdb", "mongodb", "prometheus", "rest", "stdout"]
        );
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut catalog = SinkCatalog::with_defaults();
        let err = catalog.register(Arc::new(NamedFactory("stdout"))).unwrap_err();
        assert!(matches!(err, SinkError::Duplicate(name) if name == "stdout"));
    }

    #[test]
    fn test_empty_name_rejected() {
        let mut catalog = SinkCatalog::new();
        let err = catalog.register(Arc::new(NamedFactory(""))).unwrap_err();
        assert!(matches!(err, SinkError::EmptyName));
    }

    #[tokio::test]
    async fn test_create_unknown() {
        let catalog = SinkCatalog::with_defaults();
        let err = catalog
            .create("elasticsearch", &SinkOptions::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SinkError::Unknown(name) if name == "elasticsearch"));
    }

    #[tokio::test]
    async fn test_create_registered() {
        let mut catalog = SinkCatalog::new();
        catalog.register(Arc::new(NamedFactory("custom"))).unwrap();

        let sink = catalog
            .create("custom", &SinkOptions::default())
            .await
            .unwrap();
        assert_eq!(sink.name(), "stdout");
    }
}
