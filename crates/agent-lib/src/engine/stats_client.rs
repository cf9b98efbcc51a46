//! Stats client
//!
//! `query` checks out a pooled connection and hands it, together with the
//! container name, to the worker pool. A worker then requests one-shot stats,
//! decodes every frame of the response, derives the normalised sample and
//! pushes it to the sink.

use super::connection_pool::{ConnectionPool, PooledConnection};
use super::worker_pool::{Failure, PoolError, WorkerPool};
use crate::health::{components, HealthRegistry};
use crate::models::ContainerStats;
use crate::observability::SpoutMetrics;
use crate::runtime::{FrameDecoder, RawStatSample, RuntimeClient, RuntimeError};
use crate::sink::{Sink, SinkError};
use hyper::body::Incoming;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// One dispatch unit: fetch current stats for one container
#[derive(Debug)]
pub struct Workload {
    pub connection: PooledConnection,
    pub container_name: String,
}

/// Why a workload produced no sample
#[derive(Debug, thiserror::Error)]
pub enum StatsError {
    #[error("stats request for `{container}` failed: {source}")]
    Runtime {
        container: String,
        #[source]
        source: RuntimeError,
    },
    #[error("sink rejected sample for `{container}`: {source}")]
    Sink {
        container: String,
        #[source]
        source: SinkError,
    },
    #[error("unusable stats for `{container}`: {reason}")]
    InvalidSample { container: String, reason: String },
}

impl StatsError {
    pub fn container(&self) -> &str {
        match self {
            StatsError::Runtime { container, .. }
            | StatsError::Sink { container, .. }
            | StatsError::InvalidSample { container, .. } => container,
        }
    }
}

/// Rejects frames the runtime sends for containers that are gone
fn validate(sample: &RawStatSample) -> Result<(), String> {
    if sample.read.timestamp() <= 0 {
        return Err("frame carries no read timestamp, container is not running".to_string());
    }
    Ok(())
}

/// Push every frame of one stats response; returns the number pushed.
///
/// Stops at the first frame that cannot be decoded, validated or delivered.
async fn deliver_frames(
    frames: &mut FrameDecoder<Incoming>,
    container_name: &str,
    sink: &dyn Sink,
    metrics: &SpoutMetrics,
) -> Result<usize, StatsError> {
    let mut pushed = 0usize;
    while let Some(sample) = frames
        .next_record::<RawStatSample>("stats frame")
        .await
        .map_err(|source| StatsError::Runtime {
            container: container_name.to_string(),
            source,
        })?
    {
        validate(&sample).map_err(|reason| StatsError::InvalidSample {
            container: container_name.to_string(),
            reason,
        })?;

        let stats = ContainerStats::from_raw(container_name, &sample);
        sink.push(&stats).await.map_err(|source| StatsError::Sink {
            container: container_name.to_string(),
            source,
        })?;
        metrics.inc_samples_pushed();
        pushed += 1;
    }
    Ok(pushed)
}

/// Worker-side processing of one workload
pub async fn process(
    runtime: &RuntimeClient,
    sink: &dyn Sink,
    metrics: &SpoutMetrics,
    workload: Workload,
) -> Result<(), StatsError> {
    let Workload {
        mut connection,
        container_name,
    } = workload;
    let runtime_error = |source: RuntimeError| StatsError::Runtime {
        container: container_name.clone(),
        source,
    };

    let conn = connection.connection().await.map_err(runtime_error)?;
    let mut frames = match runtime.request_stats(conn, &container_name).await {
        Ok(frames) => frames,
        Err(err) => {
            if err.is_connection_fatal() {
                connection.invalidate();
            }
            return Err(runtime_error(err));
        }
    };

    let pushed = match deliver_frames(&mut frames, &container_name, sink, metrics).await {
        Ok(pushed) => pushed,
        Err(err) => {
            // The response was not read to its end, so the connection cannot be reused
            connection.invalidate();
            return Err(err);
        }
    };

    if pushed == 0 {
        return Err(StatsError::InvalidSample {
            container: container_name,
            reason: "empty stats response".to_string(),
        });
    }

    debug!(container = %container_name, frames = pushed, slot = connection.index(), "Stats pushed");
    Ok(())
}

/// Report a failed or faulted workload
fn report(metrics: &SpoutMetrics, health: &HealthRegistry, failure: Failure<StatsError>) {
    match failure {
        Failure::Error(err) => {
            metrics.inc_workload_errors();
            warn!(container = %err.container(), error = %err, "Stats workload failed");
            match &err {
                StatsError::Sink { source, .. } => {
                    health.set_degraded(components::SINK, source.to_string());
                }
                StatsError::Runtime { source, .. } if source.is_connection_fatal() => {
                    health.set_degraded(components::RUNTIME, source.to_string());
                }
                _ => {}
            }
        }
        Failure::Fault { worker, message } => {
            metrics.inc_worker_faults();
            error!(worker, fault = %message, "Stats worker faulted");
            health.set_degraded(components::WORKER_POOL, format!("worker {} faulted: {}", worker, message));
        }
    }
}

/// A delivered sample proves the runtime, the sink and the workers are fine
fn record_success(health: &HealthRegistry) {
    for name in [components::RUNTIME, components::SINK, components::WORKER_POOL] {
        health.recover(name);
    }
}

/// Dispatches per-container stats requests over the worker and connection pools
pub struct StatsClient {
    connections: ConnectionPool,
    workers: WorkerPool<Workload, StatsError>,
}

impl StatsClient {
    /// Start `workers` workers, each with a connection slot of its own.
    ///
    /// Workload outcomes drive the runtime, sink and worker pool entries of
    /// `health`.
    pub fn start(
        runtime: Arc<RuntimeClient>,
        sink: Arc<dyn Sink>,
        workers: usize,
        metrics: SpoutMetrics,
        health: HealthRegistry,
    ) -> Self {
        let connections = ConnectionPool::new(runtime.factory().clone(), workers);

        let routine_health = health.clone();
        let routine = move |workload: Workload| {
            let runtime = runtime.clone();
            let sink = sink.clone();
            let health = routine_health.clone();
            async move {
                process(&runtime, sink.as_ref(), &metrics, workload).await?;
                record_success(&health);
                Ok(())
            }
        };
        let on_error = move |failure| report(&metrics, &health, failure);

        Self {
            workers: WorkerPool::new(connections.size(), routine, on_error),
            connections,
        }
    }

    /// Open every pooled connection up front
    pub async fn warm_up(&self) -> crate::runtime::Result<()> {
        self.connections.connect_all().await
    }

    /// Schedule a stats fetch for `name`.
    ///
    /// Returns as soon as a worker accepts the workload; failures while
    /// processing go to the error notifier, never to the caller.
    pub async fn query(&self, name: &str) -> Result<(), PoolError> {
        let connection = self.connections.acquire().await?;
        self.workers
            .submit(Workload {
                connection,
                container_name: name.to_string(),
            })
            .await
    }

    /// Stop the workers, waiting for in-flight pushes
    pub async fn shutdown(&self) {
        self.workers.shutdown().await;
    }

    pub fn workers(&self) -> &WorkerPool<Workload, StatsError> {
        &self.workers
    }

    pub fn connections(&self) -> &ConnectionPool {
        &self.connections
    }
}
