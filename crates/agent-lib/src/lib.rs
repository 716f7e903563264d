//! Core library for the game server host agent
//!
//! This crate provides:
//! - Telemetry collection with a latest-sample cache and live fan-out
//! - Cron evaluation and minute-aligned lifecycle scheduling
//! - Console sessions bridging clients to container stdin/stdout
//! - SQLite persistence, health checks and observability

pub mod clock;
pub mod collector;
pub mod console;
pub mod health;
pub mod models;
pub mod observability;
pub mod runtime;
pub mod scheduler;
pub mod store;

pub use health::{
    Component, ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse,
    ReadinessResponse,
};
pub use models::*;
pub use observability::{AgentMetrics, StructuredLogger};
