//! Cron-driven lifecycle scheduling
//!
//! [`cron`] holds the pure expression evaluator; the loop in this module
//! wakes at each top of the minute and dispatches start, stop, restart and
//! backup actions for the schedules that match.

pub mod cron;
mod r#loop;

pub use cron::{CronError, CronField, CronSet};
pub use r#loop::{
    next_boundary, CronZone, LifecycleScheduler, LifecycleSchedulerBuilder, PassReport,
    SchedulerConfig,
};
