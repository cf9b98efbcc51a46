//! Runtime API client
//!
//! Listing and inspection go over an auxiliary connection owned by the
//! client. Stats requests use a caller-supplied pooled connection and the
//! event feed gets a connection of its own.

use super::api::{ApiErrorBody, ContainerInspect, ContainerSummary};
use super::decoder::FrameDecoder;
use super::error::{Result, RuntimeError};
use super::transport::{Connection, ConnectionFactory};
use super::ContainerLookup;
use crate::models::ContainerRef;
use async_trait::async_trait;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::Response;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::debug;

/// Filter restricting the event feed to container events
const CONTAINER_EVENT_FILTER: &str = r#"{"type":["container"]}"#;

/// Streaming lifecycle-event feed bound to its own connection.
///
/// Dropping the feed closes the connection, which also aborts a read that
/// is pending on it.
pub struct EventFeed {
    pub decoder: FrameDecoder<Incoming>,
    _connection: Connection,
}

/// Client for the runtime management API
pub struct RuntimeClient {
    factory: ConnectionFactory,
    aux: Mutex<Option<Connection>>,
}

impl RuntimeClient {
    pub fn new(factory: ConnectionFactory) -> Self {
        Self {
            factory,
            aux: Mutex::new(None),
        }
    }

    pub fn factory(&self) -> &ConnectionFactory {
        &self.factory
    }

    /// Open the auxiliary connection eagerly so an unreachable runtime fails fast
    pub async fn ping(&self) -> Result<()> {
        let mut aux = self.aux.lock().await;
        if aux.as_ref().map_or(true, Connection::is_closed) {
            *aux = Some(self.factory.connect().await?);
        }
        Ok(())
    }

    /// `GET` a JSON document over the auxiliary connection
    async fn get_json<T: DeserializeOwned>(&self, path: &str, what: &'static str) -> Result<T> {
        let mut aux = self.aux.lock().await;

        let connection = match aux.take() {
            Some(connection) if !connection.is_closed() => aux.insert(connection),
            _ => {
                debug!(
                    runtime = %self.factory.transport().target(),
                    "Opening auxiliary runtime connection"
                );
                aux.insert(self.factory.connect().await?)
            }
        };

        let result = match connection.get(path).await {
            Ok(response) => read_json(response, path, what).await,
            Err(err) => Err(err),
        };

        if let Err(err) = &result {
            if err.is_connection_fatal() {
                *aux = None;
            }
        }

        result
    }

    /// Issue a one-shot stats request for `name` over a pooled connection
    pub async fn request_stats(
        &self,
        connection: &mut Connection,
        name: &str,
    ) -> Result<FrameDecoder<Incoming>> {
        let path = format!("/containers/{}/stats?stream=false", name);
        let response = connection.get(&path).await?;
        let response = check_status(response, &path).await?;
        Ok(FrameDecoder::new(response.into_body()))
    }

    /// Open the container lifecycle-event feed on a dedicated connection
    pub async fn open_events(&self) -> Result<EventFeed> {
        let filters: String =
            url::form_urlencoded::byte_serialize(CONTAINER_EVENT_FILTER.as_bytes()).collect();
        let path = format!("/events?filters={}", filters);

        let mut connection = self.factory.connect().await?;
        let response = connection.get(&path).await?;
        let response = check_status(response, &path).await?;

        Ok(EventFeed {
            decoder: FrameDecoder::new(response.into_body()),
            _connection: connection,
        })
    }
}

#[async_trait]
impl ContainerLookup for RuntimeClient {
    async fn list_running(&self) -> Result<Vec<ContainerRef>> {
        let summaries: Vec<ContainerSummary> =
            self.get_json("/containers/json", "container list").await?;
        Ok(summaries
            .into_iter()
            .map(ContainerSummary::into_ref)
            .collect())
    }

    async fn inspect(&self, name: &str) -> Result<ContainerRef> {
        let path = format!("/containers/{}/json", name);
        let inspect: ContainerInspect = self.get_json(&path, "container details").await?;
        Ok(inspect.into())
    }
}

/// Pass 2xx responses through, turn anything else into [`RuntimeError::Api`]
async fn check_status(response: Response<Incoming>, path: &str) -> Result<Response<Incoming>> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.into_body().collect().await?.to_bytes();
    let message = match serde_json::from_slice::<ApiErrorBody>(&body) {
        Ok(error) => error.message,
        Err(_) => String::from_utf8_lossy(&body).trim().to_string(),
    };

    Err(RuntimeError::Api {
        status,
        path: path.to_string(),
        message,
    })
}

async fn read_json<T: DeserializeOwned>(
    response: Response<Incoming>,
    path: &str,
    what: &'static str,
) -> Result<T> {
    let response = check_status(response, path).await?;
    let body = response.into_body().collect().await?.to_bytes();
    serde_json::from_slice(&body).map_err(|source| RuntimeError::Decode { what, source })
}
