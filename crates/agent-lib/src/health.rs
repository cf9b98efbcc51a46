//! Health of the stats spout
//!
//! The engine reports on four components: the runtime connection, the event
//! monitor, the worker pool and the sink. Liveness and readiness are derived
//! from the worst component status.
//!
//! Updates come from synchronous error notifiers inside the worker pool, so
//! the registry uses a blocking lock that is never held across an await.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{info, warn};

/// Health status of a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    /// Working normally
    Healthy,
    /// Failing some requests but still operational
    Degraded,
    /// Stopped working
    Unhealthy,
}

impl ComponentStatus {
    pub fn is_operational(&self) -> bool {
        matches!(self, ComponentStatus::Healthy | ComponentStatus::Degraded)
    }
}

/// Last reported state of one component
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Unix seconds of the last status change
    pub since: i64,
}

impl ComponentHealth {
    fn new(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            since: chrono::Utc::now().timestamp(),
        }
    }
}

/// Body of `/healthz`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: BTreeMap<String, ComponentHealth>,
}

impl HealthResponse {
    /// Worst status among `components`; healthy when there are none
    pub fn compute_status(components: &BTreeMap<String, ComponentHealth>) -> ComponentStatus {
        components
            .values()
            .map(|health| health.status)
            .max()
            .unwrap_or(ComponentStatus::Healthy)
    }
}

/// Body of `/readyz`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Component names
pub mod components {
    pub const RUNTIME: &str = "runtime";
    pub const EVENT_MONITOR: &str = "event_monitor";
    pub const WORKER_POOL: &str = "worker_pool";
    pub const SINK: &str = "sink";

    pub const ALL: [&str; 4] = [RUNTIME, EVENT_MONITOR, WORKER_POOL, SINK];
}

#[derive(Debug, Default)]
struct HealthState {
    components: BTreeMap<String, ComponentHealth>,
    ready: bool,
}

/// Shared, cloneable view of component health
#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    state: Arc<RwLock<HealthState>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component as healthy
    pub fn register(&self, name: &str) {
        self.write(|state| {
            state.components.insert(
                name.to_string(),
                ComponentHealth::new(ComponentStatus::Healthy, None),
            );
        });
    }

    /// Register every engine component
    pub fn register_all(&self) {
        for name in components::ALL {
            self.register(name);
        }
    }

    pub fn status(&self, name: &str) -> Option<ComponentStatus> {
        self.read(|state| state.components.get(name).map(|health| health.status))
    }

    pub fn set_healthy(&self, name: &str) {
        self.transition(name, ComponentStatus::Healthy, None);
    }

    pub fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.transition(name, ComponentStatus::Degraded, Some(message.into()));
    }

    pub fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.transition(name, ComponentStatus::Unhealthy, Some(message.into()));
    }

    /// Clear a degraded status after a success.
    ///
    /// Unhealthy components stay unhealthy; only an explicit `set_healthy`
    /// brings them back.
    pub fn recover(&self, name: &str) {
        if self.status(name) == Some(ComponentStatus::Degraded) {
            self.set_healthy(name);
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.write(|state| state.ready = ready);
    }

    pub fn health(&self) -> HealthResponse {
        let components = self.read(|state| state.components.clone());
        HealthResponse {
            status: HealthResponse::compute_status(&components),
            components,
        }
    }

    pub fn readiness(&self) -> ReadinessResponse {
        let (ready, status) = self.read(|state| {
            (
                state.ready,
                HealthResponse::compute_status(&state.components),
            )
        });

        let reason = if !ready {
            Some("Spout not yet initialized")
        } else if !status.is_operational() {
            Some("Critical component unhealthy")
        } else {
            None
        };

        ReadinessResponse {
            ready: reason.is_none(),
            reason: reason.map(str::to_string),
        }
    }

    /// Record a status; only changes of status are logged and re-stamped
    fn transition(&self, name: &str, status: ComponentStatus, message: Option<String>) {
        let previous = self.write(|state| {
            let previous = state.components.get(name).map(|health| health.status);
            match state.components.get_mut(name) {
                Some(health) if health.status == status => health.message = message.clone(),
                _ => {
                    state
                        .components
                        .insert(name.to_string(), ComponentHealth::new(status, message.clone()));
                }
            }
            previous
        });

        if previous == Some(status) {
            return;
        }
        match status {
            ComponentStatus::Healthy => info!(component = name, "Component recovered"),
            _ => warn!(
                component = name,
                status = ?status,
                reason = message.as_deref().unwrap_or(""),
                "Component health changed"
            ),
        }
    }

    fn read<T>(&self, f: impl FnOnce(&HealthState) -> T) -> T {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        f(&state)
    }

    fn write<T>(&self, f: impl FnOnce(&mut HealthState) -> T) -> T {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_registry_is_healthy() {
        let registry = HealthRegistry::new();
        let health = registry.health();

        assert_eq!(health.status, ComponentStatus::Healthy);
        assert!(health.components.is_empty());
    }

    #[test]
    fn test_register_all() {
        let registry = HealthRegistry::new();
        registry.register_all();

        assert_eq!(registry.health().components.len(), 4);
        assert_eq!(registry.status(components::SINK), Some(ComponentStatus::Healthy));
        assert_eq!(registry.status("unknown"), None);
    }

    #[test]
    fn test_worst_component_wins() {
        let registry = HealthRegistry::new();
        registry.register_all();

        registry.set_degraded(components::SINK, "insert failed");
        assert_eq!(registry.health().status, ComponentStatus::Degraded);

        registry.set_unhealthy(components::EVENT_MONITOR, "feed severed");
        assert_eq!(registry.health().status, ComponentStatus::Unhealthy);
    }

    #[test]
    fn test_recover_clears_degraded_only() {
        let registry = HealthRegistry::new();
        registry.register_all();

        registry.set_degraded(components::RUNTIME, "connection refused");
        registry.recover(components::RUNTIME);
        assert_eq!(registry.status(components::RUNTIME), Some(ComponentStatus::Healthy));
        assert!(registry.health().components[components::RUNTIME].message.is_none());

        registry.set_unhealthy(components::EVENT_MONITOR, "feed severed");
        registry.recover(components::EVENT_MONITOR);
        assert_eq!(
            registry.status(components::EVENT_MONITOR),
            Some(ComponentStatus::Unhealthy)
        );
    }

    #[test]
    fn test_repeated_status_keeps_since() {
        let registry = HealthRegistry::new();
        registry.register(components::SINK);
        registry.set_degraded(components::SINK, "first");
        let since = registry.health().components[components::SINK].since;

        registry.set_degraded(components::SINK, "second");
        let health = &registry.health().components[components::SINK];
        assert_eq!(health.since, since);
        assert_eq!(health.message.as_deref(), Some("second"));
    }

    #[test]
    fn test_readiness() {
        let registry = HealthRegistry::new();
        registry.register(components::EVENT_MONITOR);

        let readiness = registry.readiness();
        assert!(!readiness.ready);
        assert!(readiness.reason.is_some());

        registry.set_ready(true);
        assert!(registry.readiness().ready);

        registry.set_degraded(components::EVENT_MONITOR, "slow");
        assert!(registry.readiness().ready);

        registry.set_unhealthy(components::EVENT_MONITOR, "Failed");
        let readiness = registry.readiness();
        assert!(!readiness.ready);
        assert_eq!(readiness.reason.as_deref(), Some("Critical component unhealthy"));
    }
}
