//! Event monitor
//!
//! Follows the runtime's lifecycle-event feed on a dedicated connection and
//! keeps the container registry and the sink's per-container state in line
//! with it. Events are applied one at a time by a single task, so registry
//! updates for concurrent start/stop/rename events are serialized.

use super::registry::ContainerRegistry;
use crate::health::{components, HealthRegistry};
use crate::models::{LifecycleAction, LifecycleEvent};
use crate::observability::{SpoutMetrics, StructuredLogger};
use crate::runtime::{ContainerLookup, EventRecord, FrameDecoder, RuntimeClient, RuntimeError};
use crate::sink::Sink;
use bytes::Bytes;
use hyper::body::Body;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Errors of the event monitor lifecycle
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("event monitor is already streaming")]
    AlreadyStarted,
    #[error("event monitor is closed")]
    Closed,
    #[error("failed to open the event feed: {0}")]
    Open(#[source] RuntimeError),
    #[error("failed to list running containers: {0}")]
    Discover(#[source] RuntimeError),
}

/// Read errors in a row after which the feed is given up
const MAX_CONSECUTIVE_READ_ERRORS: u32 = 3;

/// How the streaming task ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorExit {
    /// Stopped by [`EventMonitor::close`]
    Closed,
    /// The feed was severed; the owning process must act on it
    Failed(String),
}

enum MonitorState {
    Idle,
    Streaming {
        cancel: CancellationToken,
        task: JoinHandle<()>,
    },
    Closed,
}

/// Apply one lifecycle event to the registry and the sink.
///
/// A failed lookup on start or rename leaves the new name out of the
/// registry; the old name of a rename is removed and cleared regardless.
pub async fn apply_event(
    event: &LifecycleEvent,
    registry: &ContainerRegistry,
    sink: &dyn Sink,
    lookup: &dyn ContainerLookup,
) -> Result<(), RuntimeError> {
    match event.action {
        LifecycleAction::Stop => {
            registry.unregister(&event.container_name);
            sink.clear(&event.container_name).await;
        }
        LifecycleAction::Start => {
            let container = lookup.inspect(&event.container_name).await?;
            registry.register(container);
        }
        LifecycleAction::Rename => {
            if let Some(old_name) = &event.old_name {
                registry.unregister(old_name);
                sink.clear(old_name).await;
            }
            let container = lookup.inspect(&event.container_name).await?;
            registry.register(container);
        }
    }
    Ok(())
}

/// Everything the streaming task needs
#[derive(Clone)]
struct EventContext {
    registry: Arc<ContainerRegistry>,
    sink: Arc<dyn Sink>,
    lookup: Arc<dyn ContainerLookup>,
    metrics: SpoutMetrics,
    logger: StructuredLogger,
    health: HealthRegistry,
}

impl EventContext {
    async fn handle(&self, event: LifecycleEvent) {
        match event.action {
            LifecycleAction::Start => self.logger.log_container_started(&event.container_name),
            LifecycleAction::Stop => self.logger.log_container_stopped(&event.container_name),
            LifecycleAction::Rename => self.logger.log_container_renamed(
                event.old_name.as_deref().unwrap_or_default(),
                &event.container_name,
            ),
        }

        if let Err(err) = apply_event(
            &event,
            &self.registry,
            self.sink.as_ref(),
            self.lookup.as_ref(),
        )
        .await
        {
            error!(
                container = %event.container_name,
                action = event.action.as_str(),
                error = %err,
                "Cannot retrieve container data, container will not be polled"
            );
            if err.is_connection_fatal() {
                self.health.set_degraded(components::RUNTIME, err.to_string());
            }
        }

        self.metrics.inc_lifecycle_event(event.action.as_str());
        self.metrics.set_containers_tracked(self.registry.len());
    }

    /// Read the feed until cancelled or severed.
    ///
    /// A read error is logged and reading goes on; the feed counts as
    /// severed at end of body or after a run of consecutive read errors.
    async fn follow<B>(
        &self,
        decoder: &mut FrameDecoder<B>,
        cancel: CancellationToken,
    ) -> MonitorExit
    where
        B: Body<Data = Bytes> + Unpin,
        B::Error: Into<RuntimeError>,
    {
        let mut read_errors = 0u32;
        let mut last_error: Option<String> = None;
        loop {
            let line = tokio::select! {
                biased;
                _ = cancel.cancelled() => return MonitorExit::Closed,
                line = decoder.next_line() => line,
            };

            let line = match line {
                Ok(Some(line)) => {
                    read_errors = 0;
                    line
                }
                Ok(None) => {
                    let reason = match last_error {
                        Some(err) => {
                            format!("{} after read error: {}", RuntimeError::StreamClosed, err)
                        }
                        None => RuntimeError::StreamClosed.to_string(),
                    };
                    return MonitorExit::Failed(reason);
                }
                Err(err) => {
                    read_errors += 1;
                    warn!(error = %err, consecutive = read_errors, "Event feed read error");
                    if read_errors >= MAX_CONSECUTIVE_READ_ERRORS {
                        return MonitorExit::Failed(err.to_string());
                    }
                    last_error = Some(err.to_string());
                    continue;
                }
            };

            match serde_json::from_slice::<EventRecord>(&line) {
                Ok(record) => match record.into_lifecycle() {
                    Some(event) => self.handle(event).await,
                    None => debug!("Ignoring event"),
                },
                Err(err) => warn!(error = %err, "Undecodable event record, skipping"),
            }
        }
    }
}

/// Lifecycle-event listener with states idle, streaming and closed
pub struct EventMonitor {
    runtime: Arc<RuntimeClient>,
    sink: Arc<dyn Sink>,
    metrics: SpoutMetrics,
    logger: StructuredLogger,
    health: HealthRegistry,
    state: Mutex<MonitorState>,
    exit_tx: Arc<watch::Sender<Option<MonitorExit>>>,
}

impl EventMonitor {
    pub fn new(
        runtime: Arc<RuntimeClient>,
        sink: Arc<dyn Sink>,
        metrics: SpoutMetrics,
        logger: StructuredLogger,
        health: HealthRegistry,
    ) -> Self {
        let (exit_tx, _) = watch::channel(None);
        let exit_tx = Arc::new(exit_tx);
        Self {
            runtime,
            sink,
            metrics,
            logger,
            health,
            state: Mutex::new(MonitorState::Idle),
            exit_tx,
        }
    }

    /// Open the event feed and follow it on a background task
    pub async fn start(&self, registry: Arc<ContainerRegistry>) -> Result<(), MonitorError> {
        self.launch(registry, false).await.map(|_| ())
    }

    /// Open the event feed, then seed `registry` with the running containers
    /// before following the feed.
    ///
    /// Events raised while the listing runs wait on the open feed and are
    /// applied on top of it, so no start or stop is lost in between.
    /// Returns the number of containers listed.
    pub async fn start_and_discover(
        &self,
        registry: Arc<ContainerRegistry>,
    ) -> Result<usize, MonitorError> {
        self.launch(registry, true).await
    }

    async fn launch(
        &self,
        registry: Arc<ContainerRegistry>,
        discover: bool,
    ) -> Result<usize, MonitorError> {
        let mut state = self.state.lock().await;
        match *state {
            MonitorState::Idle => {}
            MonitorState::Streaming { .. } => return Err(MonitorError::AlreadyStarted),
            MonitorState::Closed => return Err(MonitorError::Closed),
        }

        let mut feed = self.runtime.open_events().await.map_err(MonitorError::Open)?;

        let discovered = if discover {
            super::discover_running(self.runtime.as_ref(), &registry)
                .await
                .map_err(MonitorError::Discover)?
        } else {
            0
        };

        let ctx = EventContext {
            registry,
            sink: self.sink.clone(),
            lookup: self.runtime.clone(),
            metrics: self.metrics,
            logger: self.logger.clone(),
            health: self.health.clone(),
        };
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let exit_tx = self.exit_tx.clone();
        self.health.set_healthy(components::EVENT_MONITOR);

        let task = tokio::spawn(async move {
            // The feed lives until this task returns; dropping it closes the connection
            let exit = ctx.follow(&mut feed.decoder, task_cancel).await;
            match &exit {
                MonitorExit::Closed => info!("Event monitor stopped"),
                MonitorExit::Failed(reason) => {
                    error!(reason = %reason, "Event feed severed");
                    ctx.health.set_unhealthy(components::EVENT_MONITOR, reason.clone());
                }
            }
            exit_tx.send_replace(Some(exit));
        });

        info!("Event monitor streaming");
        *state = MonitorState::Streaming { cancel, task };
        Ok(discovered)
    }

    /// Stop the background task; the feed connection is closed, unblocking any read
    pub async fn close(&self) {
        let previous = std::mem::replace(&mut *self.state.lock().await, MonitorState::Closed);
        if let MonitorState::Streaming { cancel, task } = previous {
            cancel.cancel();
            if let Err(err) = task.await {
                warn!(error = %err, "Event monitor task failed");
            }
        }
    }

    /// Wait until the streaming task ends and report why
    pub async fn terminated(&self) -> MonitorExit {
        let mut exit_rx = self.exit_tx.subscribe();
        let exit = match exit_rx.wait_for(Option::is_some).await {
            Ok(exit) => exit.clone().unwrap_or(MonitorExit::Closed),
            Err(_) => MonitorExit::Closed,
        };
        exit
    }

    pub async fn is_streaming(&self) -> bool {
        matches!(*self.state.lock().await, MonitorState::Streaming { .. })
    }
}
