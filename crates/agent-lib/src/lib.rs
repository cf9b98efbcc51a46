//! Agent library for container stats collection
//!
//! This crate provides the core functionality for:
//! - Talking to the container runtime API over a unix socket, TCP or TLS
//! - Polling per-container stats through a self-healing worker pool
//! - Following container lifecycle events
//! - Publishing normalised samples to pluggable sinks
//! - Health checks and observability

pub mod engine;
pub mod health;
pub mod models;
pub mod observability;
pub mod runtime;
pub mod sink;

pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{SpoutMetrics, StructuredLogger};
