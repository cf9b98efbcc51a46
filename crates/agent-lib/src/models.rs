//! Core data models shared by the engine and the sinks

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A running container as known to the registry.
///
/// Immutable once created. A rename replaces the entry wholesale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRef {
    pub id: String,
    /// Canonical name, without the runtime's leading `/`
    pub name: String,
    #[serde(default)]
    pub image: String,
}

impl ContainerRef {
    pub fn new(id: impl Into<String>, name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: strip_name_separator(&name.into()).to_string(),
            image: image.into(),
        }
    }

    /// First 12 characters of the id, as shown by the runtime CLI
    pub fn short_id(&self) -> &str {
        if self.id.len() >= 12 {
            &self.id[..12]
        } else {
            &self.id
        }
    }
}

/// Strips the single leading `/` the runtime prepends to container names.
pub fn strip_name_separator(name: &str) -> &str {
    name.strip_prefix('/').unwrap_or(name)
}

/// Normalized, sink-facing sample for one container.
///
/// This is the only shape that crosses into a [`crate::sink::Sink`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerStats {
    #[serde(rename = "name")]
    pub container_name: String,
    #[serde(rename = "@timestamp")]
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f64,
    #[serde(rename = "mem_percent")]
    pub memory_percent: f64,
    #[serde(rename = "mem_usage")]
    pub memory_usage_bytes: u64,
    #[serde(rename = "tx_bytes")]
    pub tx_bytes_total: u64,
    #[serde(rename = "rx_bytes")]
    pub rx_bytes_total: u64,
}

impl fmt::Display for ContainerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {{{}}} CPU: {:.6}%, MEM: {:.6}% [{} B] Tx/Rx: {}/{}",
            self.container_name,
            self.timestamp.format("%d %b %y %H:%M:%S UTC"),
            self.cpu_percent,
            self.memory_percent,
            self.memory_usage_bytes,
            self.tx_bytes_total,
            self.rx_bytes_total
        )
    }
}

/// Lifecycle actions the event monitor acts upon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleAction {
    Start,
    Stop,
    Rename,
}

impl LifecycleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleAction::Start => "start",
            LifecycleAction::Stop => "stop",
            LifecycleAction::Rename => "rename",
        }
    }
}

/// A container lifecycle event, already filtered to the actions we handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleEvent {
    pub action: LifecycleAction,
    pub container_name: String,
    /// Previous name for renames, separator already stripped
    pub old_name: Option<String>,
}

impl LifecycleEvent {
    pub fn start(name: impl Into<String>) -> Self {
        Self {
            action: LifecycleAction::Start,
            container_name: name.into(),
            old_name: None,
        }
    }

    pub fn stop(name: impl Into<String>) -> Self {
        Self {
            action: LifecycleAction::Stop,
            container_name: name.into(),
            old_name: None,
        }
    }

    pub fn rename(old_name: impl Into<String>, new_name: impl Into<String>) -> Self {
        Self {
            action: LifecycleAction::Rename,
            container_name: new_name.into(),
            old_name: Some(old_name.into()),
        }
    }
}
