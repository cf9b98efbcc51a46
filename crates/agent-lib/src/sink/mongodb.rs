//! Document-store sink inserting one document per sample into MongoDB

use super::{Sink, SinkError, SinkFactory, SinkOptions};
use crate::models::ContainerStats;
use async_trait::async_trait;
use mongodb::bson::{doc, to_document, Document};
use mongodb::options::ClientOptions;
use mongodb::{Client, Collection};
use serde::Deserialize;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Deserialize)]
pub struct MongoOptions {
    /// `host:port` or a full `mongodb://` connection string
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default = "default_collection")]
    pub collection: String,
}

fn default_address() -> String {
    "localhost:27017".to_string()
}

fn default_database() -> String {
    "statspout".to_string()
}

fn default_collection() -> String {
    "stats".to_string()
}

impl Default for MongoOptions {
    fn default() -> Self {
        Self {
            address: default_address(),
            database: default_database(),
            collection: default_collection(),
        }
    }
}

const SERVER_SELECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Prefix a bare `host:port` with the connection-string scheme
fn connection_uri(address: &str) -> String {
    if address.starts_with("mongodb://") || address.starts_with("mongodb+srv://") {
        address.to_string()
    } else {
        format!("mongodb://{}", address)
    }
}

/// Document stored for one sample, keyed like the JSON rendering
pub fn render_document(stats: &ContainerStats) -> Result<Document, SinkError> {
    Ok(to_document(stats)?)
}

/// Filter matching every document of one container
fn container_filter(container_name: &str) -> Document {
    doc! { "name": container_name }
}

pub struct MongoSink {
    client: RwLock<Option<Client>>,
    database: String,
    collection: String,
}

impl MongoSink {
    /// Build the client; no server round trip happens until the first write
    pub async fn connect(options: &MongoOptions) -> Result<Self, SinkError> {
        let invalid = |reason: String| SinkError::InvalidOptions {
            sink: "mongodb",
            reason,
        };

        if options.database.is_empty() {
            return Err(invalid("database must not be empty".to_string()));
        }
        if options.collection.is_empty() {
            return Err(invalid("collection must not be empty".to_string()));
        }

        let uri = connection_uri(&options.address);
        let mut client_options = ClientOptions::parse(&uri)
            .await
            .map_err(|err| invalid(format!("address `{}`: {}", options.address, err)))?;
        client_options.app_name = Some("spout-agent".to_string());
        client_options.server_selection_timeout = Some(SERVER_SELECTION_TIMEOUT);

        let client = Client::with_options(client_options)?;
        info!(
            address = %options.address,
            database = %options.database,
            collection = %options.collection,
            "Document store client ready"
        );

        Ok(Self {
            client: RwLock::new(Some(client)),
            database: options.database.clone(),
            collection: options.collection.clone(),
        })
    }

    fn collection(&self) -> Result<Collection<Document>, SinkError> {
        let client = self.client.read().unwrap_or_else(PoisonError::into_inner);
        client
            .as_ref()
            .map(|client| client.database(&self.database).collection(&self.collection))
            .ok_or(SinkError::Closed)
    }
}

#[async_trait]
impl Sink for MongoSink {
    fn name(&self) -> &'static str {
        "mongodb"
    }

    async fn push(&self, stats: &ContainerStats) -> Result<(), SinkError> {
        let collection = self.collection()?;
        collection.insert_one(render_document(stats)?, None).await?;
        Ok(())
    }

    async fn clear(&self, container_name: &str) {
        let collection = match self.collection() {
            Ok(collection) => collection,
            Err(_) => return,
        };
        match collection
            .delete_many(container_filter(container_name), None)
            .await
        {
            Ok(result) => debug!(
                container = %container_name,
                deleted = result.deleted_count,
                "Documents removed"
            ),
            Err(err) => warn!(container = %container_name, error = %err, "Cannot remove documents"),
        }
    }

    async fn close(&self) {
        let client = self
            .client
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if client.is_some() {
            debug!("Document store client dropped");
        }
    }
}

pub struct MongoFactory;

#[async_trait]
impl SinkFactory for MongoFactory {
    fn name(&self) -> &'static str {
        "mongodb"
    }

    async fn create(&self, options: &SinkOptions) -> Result<Arc<dyn Sink>, SinkError> {
        Ok(Arc::new(MongoSink::connect(&options.mongodb).await?))
    }
}
