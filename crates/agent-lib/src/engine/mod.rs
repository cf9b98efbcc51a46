//! Collection engine
//!
//! This module turns a runtime connection into a stream of normalised
//! samples. The poll loop ticks over the container registry and hands each
//! name to the stats client, which fans the requests out over a
//! self-healing worker pool backed by a fixed set of persistent
//! connections. The event monitor keeps the registry in step with
//! container start, stop and rename events.

mod connection_pool;
mod events;
mod r#loop;
mod registry;
mod stats_client;
mod usage;
mod worker_pool;


pub use connection_pool::{ConnectionPool, PooledConnection};
pub use events::{apply_event, EventMonitor, MonitorError, MonitorExit};
pub use r#loop::{PollConfig, PollLoop, PollLoopBuilder, StatsQuery, TickResults};
pub use registry::ContainerRegistry;
pub use stats_client::{process, StatsClient, StatsError, Workload};
pub use usage::{core_count, cpu_percent, memory_percent, network_totals};
pub use worker_pool::{Failure, PoolError, WorkerPool};

use crate::runtime::{ContainerLookup, RuntimeError};
use tracing::info;

/// Seed the registry with every running container
///
/// Returns the number of containers discovered.
pub async fn discover_running(
    lookup: &dyn ContainerLookup,
    registry: &ContainerRegistry,
) -> Result<usize, RuntimeError> {
    let containers = lookup.list_running().await?;
    let count = containers.len();
    registry.replace_all(containers);
    info!(count, "Discovered running containers");
    Ok(count)
}
