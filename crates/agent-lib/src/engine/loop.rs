//! Poll loop
//!
//! Ticks at a fixed interval and asks the stats client to query every
//! registered container that is not on the ignore list.

use super::registry::ContainerRegistry;
use super::stats_client::StatsClient;
use super::worker_pool::PoolError;
use crate::observability::SpoutMetrics;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Something that can fetch stats for a container by name
#[async_trait]
pub trait StatsQuery: Send + Sync {
    async fn query(&self, name: &str) -> Result<(), PoolError>;
}

#[async_trait]
impl StatsQuery for StatsClient {
    async fn query(&self, name: &str) -> Result<(), PoolError> {
        StatsClient::query(self, name).await
    }
}

/// Configuration for the poll loop
#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Time between ticks (default: 5 seconds)
    pub interval: Duration,
    /// Container names never polled
    pub ignore: HashSet<String>,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            ignore: HashSet::new(),
        }
    }
}

/// Outcome of one tick
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TickResults {
    pub dispatched: usize,
    pub ignored: usize,
}

/// Periodically dispatches stats queries for all registered containers
pub struct PollLoop {
    stats: Arc<dyn StatsQuery>,
    registry: Arc<ContainerRegistry>,
    config: PollConfig,
    metrics: SpoutMetrics,
}

impl PollLoop {
    pub fn new(
        stats: Arc<dyn StatsQuery>,
        registry: Arc<ContainerRegistry>,
        config: PollConfig,
        metrics: SpoutMetrics,
    ) -> Self {
        Self {
            stats,
            registry,
            config,
            metrics,
        }
    }

    /// Run until `shutdown` is cancelled or the worker pool closes
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            ignored = self.config.ignore.len(),
            "Starting poll loop"
        );

        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut tick_count = 0u64;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Shutting down poll loop");
                    break;
                }
                _ = ticker.tick() => {
                    let start = Instant::now();
                    let results = tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => {
                            info!("Shutting down poll loop");
                            break;
                        }
                        results = self.tick() => results,
                    };
                    let elapsed = start.elapsed();
                    tick_count += 1;

                    self.metrics.observe_poll_dispatch(elapsed.as_secs_f64());

                    match results {
                        Ok(results) => debug!(
                            tick = tick_count,
                            dispatched = results.dispatched,
                            ignored = results.ignored,
                            elapsed_ms = elapsed.as_millis() as u64,
                            "Poll tick dispatched"
                        ),
                        Err(err) => {
                            warn!(error = %err, "Stats client closed, stopping poll loop");
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Dispatch one query per registered, non-ignored container
    pub async fn tick(&self) -> Result<TickResults, PoolError> {
        let names = self.registry.names();
        self.metrics.set_containers_tracked(names.len());

        let mut results = TickResults::default();
        for name in names {
            if self.config.ignore.contains(&name) {
                results.ignored += 1;
                continue;
            }
            self.stats.query(&name).await?;
            results.dispatched += 1;
        }

        Ok(results)
    }
}

/// Builder for creating the poll loop
pub struct PollLoopBuilder {
    stats: Option<Arc<dyn StatsQuery>>,
    registry: Option<Arc<ContainerRegistry>>,
    config: PollConfig,
    metrics: Option<SpoutMetrics>,
}

impl PollLoopBuilder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self {
            stats: None,
            registry: None,
            config: PollConfig::default(),
            metrics: None,
        }
    }

    /// Set the stats client
    pub fn stats(mut self, stats: Arc<dyn StatsQuery>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Set the container registry
    pub fn registry(mut self, registry: Arc<ContainerRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Set the tick interval
    pub fn interval(mut self, interval: Duration) -> Self {
        self.config.interval = interval;
        self
    }

    /// Set the names excluded from polling
    pub fn ignore<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.ignore = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn metrics(mut self, metrics: SpoutMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Build the poll loop
    pub fn build(self) -> Result<PollLoop> {
        let stats = self
            .stats
            .ok_or_else(|| anyhow::anyhow!("Stats client is required"))?;
        let registry = self
            .registry
            .ok_or_else(|| anyhow::anyhow!("Registry is required"))?;
        if self.config.interval.is_zero() {
            anyhow::bail!("Poll interval must be at least one second");
        }

        Ok(PollLoop::new(
            stats,
            registry,
            self.config,
            self.metrics.unwrap_or_default(),
        ))
    }
}

impl Default for PollLoopBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ContainerRef;
    use std::sync::Mutex;

    /// Records every queried name
    #[derive(Default)]
    struct MockStats {
        queried: Mutex<Vec<String>>,
        closed: bool,
    }

    #[async_trait]
    impl StatsQuery for MockStats {
        async fn query(&self, name: &str) -> Result<(), PoolError> {
            if self.closed {
                return Err(PoolError::Closed);
            }
            self.queried.lock().unwrap().push(name.to_string());
            Ok(())
        }
    }

    fn registry_of(names: &[&str]) -> Arc<ContainerRegistry> {
        Arc::new(ContainerRegistry::with_containers(
            names
                .iter()
                .map(|name| ContainerRef::new(format!("id-{}", name), *name, "img")),
        ))
    }

    #[test]
    fn test_poll_config_default() {
        let config = PollConfig::default();
        assert_eq!(config.interval, Duration::from_secs(5));
        assert!(config.ignore.is_empty());
    }

    #[tokio::test]
    async fn test_builder_missing_stats() {
        let result = PollLoopBuilder::new().registry(registry_of(&[])).build();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_builder_rejects_zero_interval() {
        let result = PollLoopBuilder::new()
            .stats(Arc::new(MockStats::default()))
            .registry(registry_of(&[]))
            .interval(Duration::ZERO)
            .build();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_tick_skips_ignored() {
        let stats = Arc::new(MockStats::default());
        let poll = PollLoopBuilder::new()
            .stats(stats.clone())
            .registry(registry_of(&["web", "db", "sidecar"]))
            .ignore(["sidecar"])
            .build()
            .unwrap();

        let results = poll.tick().await.unwrap();
        assert_eq!(
            results,
            TickResults {
                dispatched: 2,
                ignored: 1
            }
        );
        assert_eq!(
            *stats.queried.lock().unwrap(),
            vec!["db".to_string(), "web".to_string()]
        );
    }

    #[tokio::test]
    async fn test_tick_sees_registry_changes() {
        let stats = Arc::new(MockStats::default());
        let registry = registry_of(&["a"]);
        let poll = PollLoopBuilder::new()
            .stats(stats.clone())
            .registry(registry.clone())
            .build()
            .unwrap();

        poll.tick().await.unwrap();
        registry.unregister("a");
        registry.register(ContainerRef::new("id-b", "b", "img"));
        poll.tick().await.unwrap();

        assert_eq!(
            *stats.queried.lock().unwrap(),
            vec!["a".to_string(), "b".to_string()]
        );
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let stats = Arc::new(MockStats::default());
        let poll = PollLoopBuilder::new()
            .stats(stats.clone())
            .registry(registry_of(&["a"]))
            .interval(Duration::from_millis(10))
            .build()
            .unwrap();

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(poll.run(shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(!stats.queried.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_when_pool_closed() {
        let stats = Arc::new(MockStats {
            queried: Mutex::new(Vec::new()),
            closed: true,
        });
        let poll = PollLoopBuilder::new()
            .stats(stats)
            .registry(registry_of(&["a"]))
            .interval(Duration::from_millis(10))
            .build()
            .unwrap();

        tokio::time::timeout(Duration::from_secs(1), poll.run(CancellationToken::new()))
            .await
            .unwrap();
    }
}
