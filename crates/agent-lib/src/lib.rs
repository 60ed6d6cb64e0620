//! Core library for the netwatch bandwidth-anomaly agent
//!
//! This crate provides the detection pipeline:
//! - Telemetry polling and per-device feature construction
//! - One adaptive anomaly model per device with background retraining
//! - Threshold fallback detection and cooldown-gated notifications
//! - Maintenance jobs (retraining sweep, retention, reporting, health)
//! - Health checks and observability

pub mod detector;
pub mod error;
pub mod features;
pub mod gate;
pub mod health;
pub mod maintenance;
pub mod models;
pub mod monitor;
pub mod observability;
pub mod persist;
pub mod registry;
pub mod report;
pub mod source;
pub mod store;

pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{AgentMetrics, StructuredLogger};
