//! Core data models for the host agent

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Last-known lifecycle state of a managed container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetState {
    Created,
    Running,
    Exited,
    Paused,
    Restarting,
    Dead,
    Unknown,
}

impl TargetState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetState::Created => "created",
            TargetState::Running => "running",
            TargetState::Exited => "exited",
            TargetState::Paused => "paused",
            TargetState::Restarting => "restarting",
            TargetState::Dead => "dead",
            TargetState::Unknown => "unknown",
        }
    }

    /// Map a stored or runtime-reported state string. Never fails.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "created" => TargetState::Created,
            "running" => TargetState::Running,
            // the CRUD layer writes "stopped" for servers that never ran
            "exited" | "stopped" => TargetState::Exited,
            "paused" => TargetState::Paused,
            "restarting" => TargetState::Restarting,
            "dead" => TargetState::Dead,
            _ => TargetState::Unknown,
        }
    }
}

impl fmt::Display for TargetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A managed game server container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub id: String,
    /// Container id in the runtime; absent until the container is created
    pub runtime_handle: Option<String>,
    pub state: TargetState,
}

/// A running target the collector should sample
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningTarget {
    pub id: String,
    pub runtime_handle: String,
}

/// One telemetry reading for a target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub target_id: String,
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub memory_limit: u64,
    pub network_rx: u64,
    pub network_tx: u64,
    pub disk_bytes: u64,
    pub recorded_at: DateTime<Utc>,
}

/// Cumulative CPU counters reported by the runtime
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuCounters {
    /// Nanoseconds of CPU consumed by the container
    pub total_usage: u64,
    /// Nanoseconds of CPU consumed by the whole host
    pub system_usage: u64,
}

/// Per-interface network counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkCounters {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// Point-in-time stats snapshot from the container runtime
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsSnapshot {
    /// Counters at the time of this read
    pub cpu: CpuCounters,
    /// The runtime's own previous read of the same counters
    pub precpu: CpuCounters,
    pub online_cpus: u32,
    pub memory_usage: u64,
    pub memory_limit: u64,
    pub networks: HashMap<String, NetworkCounters>,
    pub disk_bytes: u64,
}

/// Result of inspecting a container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InspectInfo {
    /// Whether the main process has a pseudo-terminal allocated
    pub tty: bool,
    pub state: TargetState,
}

/// Backup created by the backup service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: String,
    pub server_id: String,
    pub filename: String,
    pub size_bytes: i64,
    pub created_at: String,
}

/// Lifecycle action bound to a schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleAction {
    Start,
    Stop,
    Restart,
    Backup,
}

impl ScheduleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleAction::Start => "start",
            ScheduleAction::Stop => "stop",
            ScheduleAction::Restart => "restart",
            ScheduleAction::Backup => "backup",
        }
    }

    /// State recorded against the target after the action succeeds
    pub fn resulting_state(&self) -> Option<TargetState> {
        match self {
            ScheduleAction::Start | ScheduleAction::Restart => Some(TargetState::Running),
            ScheduleAction::Stop => Some(TargetState::Exited),
            ScheduleAction::Backup => None,
        }
    }
}

impl fmt::Display for ScheduleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScheduleAction {
    type Err = UnknownAction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(ScheduleAction::Start),
            "stop" => Ok(ScheduleAction::Stop),
            "restart" => Ok(ScheduleAction::Restart),
            "backup" => Ok(ScheduleAction::Backup),
            other => Err(UnknownAction(other.to_string())),
        }
    }
}

/// Action string that is not one of start, stop, restart, backup
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown schedule action {0:?}")]
pub struct UnknownAction(pub String);

/// A cron-driven lifecycle schedule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    pub target_id: String,
    pub name: String,
    pub cron_expr: String,
    pub action: ScheduleAction,
    pub enabled: bool,
    pub last_run: Option<DateTime<Utc>>,
}

/// An enabled schedule joined with its target's runtime handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledJob {
    pub schedule: Schedule,
    pub runtime_handle: Option<String>,
}
