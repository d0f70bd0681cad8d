//! Agent library for fleet liveness monitoring
//!
//! This crate provides the core functionality for:
//! - A persistent device registry (SQLite)
//! - Interval-bucketed probe scheduling with drift correction
//! - Reconciliation of out-of-band registry edits
//! - Remote commands and telemetry over an MQTT gateway
//! - Health checks and observability

pub mod aggregate;
pub mod command;
pub mod error;
pub mod gateway;
pub mod health;
pub mod models;
pub mod observability;
pub mod probe;
pub mod registry;
pub mod schedule;
pub mod status;

#[cfg(test)]
mod testing;

pub use error::{CommandError, ProbeError, RegistryError, TransportError};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{AgentMetrics, StructuredLogger};
