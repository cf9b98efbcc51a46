//! Container runtime API access
//!
//! Transport setup, wire types, the newline-delimited frame decoder and the
//! client used by the engine to list containers, fetch stats and follow the
//! lifecycle-event feed.

mod api;
mod client;
mod decoder;
mod error;
mod transport;

pub use api::{
    ContainerInspect, ContainerSummary, CpuStats, CpuUsage, EventRecord, MemoryStats,
    NetworkStats, RawStatSample,
};
pub use client::{EventFeed, RuntimeClient};
pub use decoder::FrameDecoder;
pub use error::{Result, RuntimeError};
pub use transport::{Connection, ConnectionFactory, Transport, TransportConfig, TransportKind};

use crate::models::ContainerRef;
use async_trait::async_trait;

/// Container lookups used for the initial listing and for start/rename events
#[async_trait]
pub trait ContainerLookup: Send + Sync {
    /// List all running containers
    async fn list_running(&self) -> Result<Vec<ContainerRef>>;

    /// Fetch details for one container by name
    async fn inspect(&self, name: &str) -> Result<ContainerRef>;
}
