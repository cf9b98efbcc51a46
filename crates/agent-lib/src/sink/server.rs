//! HTTP endpoint shared by the pull-based sinks

use super::SinkError;
use axum::Router;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// An axum server owned by a sink and stopped by [`HttpEndpoint::close`]
pub(crate) struct HttpEndpoint {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HttpEndpoint {
    /// Bind `address` now, so a taken port fails sink creation
    pub(crate) async fn bind(
        sink: &'static str,
        address: &str,
        router: Router,
    ) -> Result<Self, SinkError> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|source| SinkError::Bind {
                address: address.to_string(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| SinkError::Bind {
            address: address.to_string(),
            source,
        })?;

        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        let task = tokio::spawn(async move {
            let served = axum::serve(listener, router)
                .with_graceful_shutdown(async move { signal.cancelled().await })
                .await;
            if let Err(err) = served {
                warn!(sink, error = %err, "Sink HTTP server failed");
            }
        });

        info!(sink, address = %local_addr, "Sink HTTP endpoint listening");

        Ok(Self {
            local_addr,
            shutdown,
            task: Mutex::new(Some(task)),
        })
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting requests and wait for the server task
    pub(crate) async fn close(&self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
    }
}
