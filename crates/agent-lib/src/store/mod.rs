//! Persistence seams for targets, samples and schedules
//!
//! The relational schema is owned by the CRUD layer; the agent only needs
//! the narrow views below. `SqliteStore` implements all three over a single
//! serialized connection.

mod sqlite;

pub use sqlite::{NewSchedule, SqliteStore};

use crate::models::{MetricSample, RunningTarget, ScheduledJob, Target, TargetState};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Read access to targets plus state write-back after scheduled actions
#[async_trait]
pub trait TargetStore: Send + Sync {
    /// Targets in `running` state that have a runtime handle
    async fn running_targets(&self) -> Result<Vec<RunningTarget>>;

    async fn lookup_target(&self, target_id: &str) -> Result<Option<Target>>;

    async fn record_state(&self, target_id: &str, state: TargetState) -> Result<()>;
}

/// Append-only telemetry storage
#[async_trait]
pub trait SampleStore: Send + Sync {
    async fn insert_sample(&self, sample: &MetricSample) -> Result<()>;

    /// Delete samples recorded before `cutoff`, for one target or all of them.
    /// Returns the number of rows removed.
    async fn delete_samples_older_than(
        &self,
        target_id: Option<&str>,
        cutoff: DateTime<Utc>,
    ) -> Result<u64>;

    async fn latest_sample(&self, target_id: &str) -> Result<Option<MetricSample>>;

    /// Samples recorded at or after `since`, oldest first
    async fn samples_since(
        &self,
        target_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<MetricSample>>;
}

/// Schedule access for the lifecycle scheduler
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// Enabled schedules in creation order, joined with their target's handle
    async fn enabled_schedules(&self) -> Result<Vec<ScheduledJob>>;

    async fn record_last_run(&self, schedule_id: &str, at: DateTime<Utc>) -> Result<()>;
}
