//! Wire types of the runtime management API
//!
//! Only the fields the engine reads are modelled; everything else in the
//! payloads is ignored by serde.

use crate::models::{strip_name_separator, ContainerRef, LifecycleEvent};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;

/// Entry of `GET /containers/json`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerSummary {
    pub id: String,
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default)]
    pub image: String,
}

impl ContainerSummary {
    /// Canonical name, falling back to the short id when the runtime reports none
    pub fn into_ref(self) -> ContainerRef {
        let name = match self.names.first() {
            Some(name) => strip_name_separator(name).to_string(),
            None => self.id.chars().take(12).collect(),
        };
        ContainerRef::new(self.id, name, self.image)
    }
}

/// Body of `GET /containers/{name}/json`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerInspect {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub config: InspectConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InspectConfig {
    #[serde(default)]
    pub image: String,
}

impl From<ContainerInspect> for ContainerRef {
    fn from(inspect: ContainerInspect) -> Self {
        ContainerRef::new(inspect.id, inspect.name, inspect.config.image)
    }
}

/// One frame of `GET /containers/{name}/stats`
#[derive(Debug, Clone, Deserialize)]
pub struct RawStatSample {
    /// Zero-valued (`0001-01-01T00:00:00Z`) when the container is gone
    pub read: DateTime<Utc>,
    #[serde(default)]
    pub cpu_stats: CpuStats,
    #[serde(default)]
    pub precpu_stats: CpuStats,
    #[serde(default)]
    pub memory_stats: MemoryStats,
    #[serde(default)]
    pub networks: Option<HashMap<String, NetworkStats>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CpuStats {
    #[serde(default)]
    pub cpu_usage: CpuUsage,
    #[serde(default)]
    pub system_cpu_usage: u64,
    #[serde(default)]
    pub online_cpus: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CpuUsage {
    #[serde(default)]
    pub total_usage: u64,
    #[serde(default)]
    pub percpu_usage: Option<Vec<u64>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MemoryStats {
    #[serde(default)]
    pub usage: u64,
    #[serde(default)]
    pub limit: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetworkStats {
    #[serde(default)]
    pub rx_bytes: u64,
    #[serde(default)]
    pub rx_packets: u64,
    #[serde(default)]
    pub rx_errors: u64,
    #[serde(default)]
    pub rx_dropped: u64,
    #[serde(default)]
    pub tx_bytes: u64,
    #[serde(default)]
    pub tx_packets: u64,
    #[serde(default)]
    pub tx_errors: u64,
    #[serde(default)]
    pub tx_dropped: u64,
}

/// One record of `GET /events`
#[derive(Debug, Clone, Deserialize)]
pub struct EventRecord {
    #[serde(rename = "Type", default)]
    pub kind: String,
    #[serde(rename = "Action", default)]
    pub action: String,
    #[serde(rename = "Actor", default)]
    pub actor: EventActor,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventActor {
    #[serde(rename = "Attributes", default)]
    pub attributes: EventAttributes,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventAttributes {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "oldName", default)]
    pub old_name: Option<String>,
}

impl EventRecord {
    /// Maps the record to a lifecycle event, or `None` for records the engine ignores
    pub fn into_lifecycle(self) -> Option<LifecycleEvent> {
        if self.kind != "container" {
            return None;
        }

        let name = self.actor.attributes.name;
        match self.action.as_str() {
            "start" => Some(LifecycleEvent::start(name)),
            "stop" => Some(LifecycleEvent::stop(name)),
            "rename" => {
                let old_name = self.actor.attributes.old_name?;
                Some(LifecycleEvent::rename(
                    strip_name_separator(&old_name),
                    strip_name_separator(&name),
                ))
            }
            _ => None,
        }
    }
}

/// Error body returned by the runtime on non-2xx responses
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorBody {
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LifecycleAction;

    #[test]
    fn test_summary_into_ref() {
        let summary: ContainerSummary = serde_json::from_str(
            r#"{"Id":"4c01db0b339c1234","Names":["/web"],"Image":"nginx","State":"running"}"#,
        )
        .unwrap();
        let container = summary.into_ref();
        assert_eq!(container.name, "web");
        assert_eq!(container.image, "nginx");
    }

    #[test]
    fn test_inspect_into_ref() {
        let inspect: ContainerInspect = serde_json::from_str(
            r#"{"Id":"abc","Name":"/db","Config":{"Image":"postgres:16"}}"#,
        )
        .unwrap();
        let container = ContainerRef::from(inspect);
        assert_eq!(container.name, "db");
        assert_eq!(container.image, "postgres:16");
    }

    #[test]
    fn test_event_rename_strips_old_name() {
        let record: EventRecord = serde_json::from_str(
            r#"{"Type":"container","Action":"rename","Actor":{"ID":"abc","Attributes":{"name":"y","oldName":"/x"}}}"#,
        )
        .unwrap();
        let event = record.into_lifecycle().unwrap();
        assert_eq!(event.action, LifecycleAction::Rename);
        assert_eq!(event.old_name.as_deref(), Some("x"));
        assert_eq!(event.container_name, "y");
    }

    #[test]
    fn test_event_ignored_kinds() {
        let network: EventRecord =
            serde_json::from_str(r#"{"Type":"network","Action":"connect"}"#).unwrap();
        assert!(network.into_lifecycle().is_none());

        let exec: EventRecord = serde_json::from_str(
            r#"{"Type":"container","Action":"exec_start","Actor":{"Attributes":{"name":"web"}}}"#,
        )
        .unwrap();
        assert!(exec.into_lifecycle().is_none());
    }

    #[test]
    fn test_stat_sample_tolerates_missing_sections() {
        let sample: RawStatSample =
            serde_json::from_str(r#"{"read":"2024-01-02T03:04:05.123456789Z"}"#).unwrap();
        assert_eq!(sample.memory_stats.limit, 0);
        assert!(sample.networks.is_none());
    }
}
