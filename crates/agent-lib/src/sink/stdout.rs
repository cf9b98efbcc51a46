//! Console sink

use super::{Sink, SinkError, SinkFactory, SinkOptions};
use crate::models::ContainerStats;
use async_trait::async_trait;
use std::io::Write;
use std::sync::Arc;
use tracing::debug;

/// Prints every sample on its own line
#[derive(Debug, Default)]
pub struct StdoutSink;

impl StdoutSink {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Sink for StdoutSink {
    fn name(&self) -> &'static str {
        "stdout"
    }

    async fn push(&self, stats: &ContainerStats) -> Result<(), SinkError> {
        println!("{}", stats);
        Ok(())
    }

    async fn clear(&self, container_name: &str) {
        debug!(container = %container_name, "Nothing retained for container");
    }

    async fn close(&self) {
        let _ = std::io::stdout().flush();
    }
}

pub struct StdoutFactory;

#[async_trait]
impl SinkFactory for StdoutFactory {
    fn name(&self) -> &'static str {
        "stdout"
    }

    async fn create(&self, _options: &SinkOptions) -> Result<Arc<dyn Sink>, SinkError> {
        Ok(Arc::new(StdoutSink::new()))
    }
}
