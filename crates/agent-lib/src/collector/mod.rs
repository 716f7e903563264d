//! Telemetry collection for running game servers
//!
//! A background loop samples every running server through a
//! [`MetricsSource`](crate::runtime::MetricsSource), persists the sample,
//! keeps the newest one per server in memory and pushes it to live
//! subscribers.

mod hub;
mod r#loop;
mod sample;

#[cfg(test)]
mod tests;

pub use hub::{SampleConduit, SampleHub};
pub use r#loop::{CollectionConfig, TelemetryCollector, TelemetryCollectorBuilder, TickReport};
pub use sample::{cpu_percent, sample_from_snapshot};
