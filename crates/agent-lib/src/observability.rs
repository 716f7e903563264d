//! Observability for the host agent
//!
//! Provides:
//! - Prometheus metrics (tick latency, samples, dispatch outcomes, console sessions)
//! - Event-tagged audit logging with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for tick latency (in seconds)
const TICK_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<AgentMetricsInner> = OnceLock::new();

struct AgentMetricsInner {
    tick_latency_seconds: Histogram,
    samples_collected: IntCounter,
    collection_errors: IntCounter,
    persist_errors: IntCounter,
    targets_monitored: IntGauge,
    live_subscribers: IntGauge,
    scheduled_dispatches: IntCounterVec,
    console_sessions: IntGauge,
    console_rejections: IntCounterVec,
}

impl AgentMetricsInner {
    fn new() -> Self {
        Self {
            tick_latency_seconds: register_histogram!(
                "gamehost_agent_tick_latency_seconds",
                "Time spent on one telemetry collection tick",
                TICK_BUCKETS.to_vec()
            )
            .expect("Failed to register tick_latency_seconds"),

            samples_collected: register_int_counter!(
                "gamehost_agent_samples_collected_total",
                "Total number of telemetry samples produced"
            )
            .expect("Failed to register samples_collected"),

            collection_errors: register_int_counter!(
                "gamehost_agent_collection_errors_total",
                "Total number of failed stats reads and target queries"
            )
            .expect("Failed to register collection_errors"),

            persist_errors: register_int_counter!(
                "gamehost_agent_persist_errors_total",
                "Total number of samples that could not be stored"
            )
            .expect("Failed to register persist_errors"),

            targets_monitored: register_int_gauge!(
                "gamehost_agent_servers_monitored",
                "Number of running servers sampled on the last tick"
            )
            .expect("Failed to register servers_monitored"),

            live_subscribers: register_int_gauge!(
                "gamehost_agent_live_subscribers",
                "Open live stats subscriptions"
            )
            .expect("Failed to register live_subscribers"),

            scheduled_dispatches: register_int_counter_vec!(
                "gamehost_agent_scheduled_dispatches_total",
                "Scheduled lifecycle actions by action and outcome",
                &["action", "outcome"]
            )
            .expect("Failed to register scheduled_dispatches"),

            console_sessions: register_int_gauge!(
                "gamehost_agent_console_sessions",
                "Console sessions currently attached"
            )
            .expect("Failed to register console_sessions"),

            console_rejections: register_int_counter_vec!(
                "gamehost_agent_console_rejections_total",
                "Console sessions refused before upgrade, by reason",
                &["reason"]
            )
            .expect("Failed to register console_rejections"),
        }
    }
}

/// Agent metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct AgentMetrics {
    _private: (),
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(AgentMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &AgentMetricsInner {
        GLOBAL_METRICS.get_or_init(AgentMetricsInner::new)
    }

    pub fn observe_tick_latency(&self, duration_secs: f64) {
        self.inner().tick_latency_seconds.observe(duration_secs);
    }

    pub fn inc_samples_collected(&self) {
        self.inner().samples_collected.inc();
    }

    pub fn inc_collection_errors(&self) {
        self.inner().collection_errors.inc();
    }

    pub fn inc_persist_errors(&self) {
        self.inner().persist_errors.inc();
    }

    pub fn set_targets_monitored(&self, count: i64) {
        self.inner().targets_monitored.set(count);
    }

    pub fn set_live_subscribers(&self, count: i64) {
        self.inner().live_subscribers.set(count);
    }

    /// Count one scheduled dispatch; `outcome` is "ok" or "error"
    pub fn inc_dispatch(&self, action: &str, outcome: &str) {
        self.inner()
            .scheduled_dispatches
            .with_label_values(&[action, outcome])
            .inc();
    }

    pub fn console_session_opened(&self) {
        self.inner().console_sessions.inc();
    }

    pub fn console_session_closed(&self) {
        self.inner().console_sessions.dec();
    }

    pub fn inc_console_rejections(&self, reason: &str) {
        self.inner()
            .console_rejections
            .with_label_values(&[reason])
            .inc();
    }
}

/// Structured logger for agent events
///
/// Every line carries an `event` field and the host name so audit tooling
/// can filter without parsing messages.
#[derive(Clone)]
pub struct StructuredLogger {
    host_name: String,
}

impl StructuredLogger {
    pub fn new(host_name: impl Into<String>) -> Self {
        Self {
            host_name: host_name.into(),
        }
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    /// Log a schedule that matched and was dispatched
    pub fn log_schedule_fired(
        &self,
        schedule_id: &str,
        target_id: &str,
        action: &str,
        at: &str,
        error: Option<&str>,
    ) {
        match error {
            None => info!(
                event = "schedule_fired",
                host = %self.host_name,
                schedule_id = %schedule_id,
                target_id = %target_id,
                action = %action,
                at = %at,
                outcome = "ok",
                "Scheduled action completed"
            ),
            Some(error) => warn!(
                event = "schedule_fired",
                host = %self.host_name,
                schedule_id = %schedule_id,
                target_id = %target_id,
                action = %action,
                at = %at,
                outcome = "error",
                error = %error,
                "Scheduled action failed"
            ),
        }
    }

    /// Log a schedule whose cron expression could not be parsed
    pub fn log_schedule_invalid(&self, schedule_id: &str, cron_expr: &str, error: &str) {
        warn!(
            event = "schedule_invalid",
            host = %self.host_name,
            schedule_id = %schedule_id,
            cron_expr = %cron_expr,
            error = %error,
            "Skipping schedule with invalid cron expression"
        );
    }

    pub fn log_console_opened(&self, target_id: &str, handle: &str, tty: bool) {
        info!(
            event = "console_session",
            host = %self.host_name,
            target_id = %target_id,
            handle = %handle,
            tty = tty,
            phase = "opened",
            "Console session opened"
        );
    }

    pub fn log_console_closed(
        &self,
        target_id: &str,
        bytes_out: u64,
        messages_in: u64,
        duration_secs: f64,
    ) {
        info!(
            event = "console_session",
            host = %self.host_name,
            target_id = %target_id,
            bytes_out = bytes_out,
            messages_in = messages_in,
            duration_secs = duration_secs,
            phase = "closed",
            "Console session closed"
        );
    }

    pub fn log_console_rejected(&self, target_id: &str, reason: &str) {
        warn!(
            event = "console_session",
            host = %self.host_name,
            target_id = %target_id,
            phase = "rejected",
            reason = %reason,
            "Console session rejected"
        );
    }

    /// Log agent startup
    pub fn log_startup(&self, version: &str) {
        info!(
            event = "agent_started",
            host = %self.host_name,
            agent_version = %version,
            "Host agent started"
        );
    }

    /// Log agent shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            host = %self.host_name,
            reason = %reason,
            "Host agent shutting down"
        );
    }
}
