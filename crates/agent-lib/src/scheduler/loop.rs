//! Minute-aligned lifecycle scheduling loop
//!
//! Sleeps until the next top of the minute, then evaluates every enabled
//! schedule against that boundary and dispatches the ones that match.

use super::cron::CronSet;
use crate::clock::{Clock, SystemClock};
use crate::health::{Component, HealthRegistry};
use crate::models::{ScheduleAction, ScheduledJob};
use crate::observability::{AgentMetrics, StructuredLogger};
use crate::runtime::{BackupService, LifecycleControl};
use crate::store::{ScheduleStore, TargetStore};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Local, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Calendar that cron fields are evaluated in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CronZone {
    /// The host's local time zone
    #[default]
    Local,
    Utc,
}

impl FromStr for CronZone {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(CronZone::Local),
            "utc" => Ok(CronZone::Utc),
            other => Err(anyhow!("unknown cron timezone {:?} (expected local or utc)", other)),
        }
    }
}

/// Configuration for the lifecycle scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub zone: CronZone,
    /// Stamp `last_run` even when the action failed (default: true)
    pub stamp_failed_runs: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            zone: CronZone::Local,
            stamp_failed_runs: true,
        }
    }
}

/// Outcome of one evaluation pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PassReport {
    /// Enabled schedules loaded from the store
    pub loaded: usize,
    /// Schedules skipped for an unparsable cron expression
    pub invalid: usize,
    pub matched: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Loading schedules failed; nothing was evaluated
    pub load_failed: bool,
}

/// Top-of-minute boundary the loop should wake at next.
///
/// Always strictly after `last`, so a clock that lags behind the previous
/// boundary never produces a second pass for the same minute.
pub fn next_boundary(now: DateTime<Utc>, last: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let minute_start = now
        .with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now);
    let next = minute_start + ChronoDuration::minutes(1);

    match last {
        Some(last) if next <= last => last + ChronoDuration::minutes(1),
        _ => next,
    }
}

struct Inner {
    schedules: Arc<dyn ScheduleStore>,
    targets: Arc<dyn TargetStore>,
    lifecycle: Arc<dyn LifecycleControl>,
    backups: Arc<dyn BackupService>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    metrics: AgentMetrics,
    logger: StructuredLogger,
    health: Option<HealthRegistry>,
}

struct RunningTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Background scheduler dispatching cron-driven lifecycle actions
pub struct LifecycleScheduler {
    inner: Arc<Inner>,
    task: Mutex<Option<RunningTask>>,
}

impl LifecycleScheduler {
    /// Spawn the scheduling loop. Does nothing if it is already running.
    pub fn start(&self) {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(running) = task.as_ref() {
            if !running.handle.is_finished() {
                debug!("Lifecycle scheduler already running");
                return;
            }
        }

        let token = CancellationToken::new();
        let handle = tokio::spawn(Self::run(Arc::clone(&self.inner), token.clone()));
        *task = Some(RunningTask { token, handle });
    }

    /// Signal the loop to exit. A pass already in progress finishes first.
    pub fn stop(&self) -> Option<JoinHandle<()>> {
        let running = self
            .task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()?;
        running.token.cancel();
        Some(running.handle)
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|running| !running.handle.is_finished())
            .unwrap_or(false)
    }

    /// Evaluate every enabled schedule against `at` and dispatch matches
    pub async fn run_pass(&self, at: DateTime<Utc>) -> PassReport {
        self.inner.run_pass(at).await
    }

    async fn run(inner: Arc<Inner>, token: CancellationToken) {
        info!(
            zone = ?inner.config.zone,
            stamp_failed_runs = inner.config.stamp_failed_runs,
            "Starting lifecycle scheduler"
        );

        let mut last: Option<DateTime<Utc>> = None;

        loop {
            let boundary = next_boundary(inner.clock.now(), last);
            let wait = (boundary - inner.clock.now())
                .to_std()
                .unwrap_or(Duration::ZERO);

            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    info!("Stopping lifecycle scheduler");
                    break;
                }
                _ = tokio::time::sleep(wait) => {}
            }

            // not raced against cancellation: a started pass always completes
            let report = inner.run_pass(boundary).await;
            debug!(
                at = %boundary,
                loaded = report.loaded,
                matched = report.matched,
                failed = report.failed,
                "Scheduler pass complete"
            );
            last = Some(boundary);
        }
    }
}

impl Inner {
    async fn run_pass(&self, at: DateTime<Utc>) -> PassReport {
        let mut report = PassReport::default();

        let jobs = match self.schedules.enabled_schedules().await {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!(error = %e, "Failed to load schedules");
                report.load_failed = true;
                if let Some(health) = &self.health {
                    let problem = format!("schedule query failed: {}", e);
                    health
                        .record_tick(Component::Scheduler, at, Some(problem))
                        .await;
                }
                return report;
            }
        };
        report.loaded = jobs.len();

        for job in &jobs {
            let schedule = &job.schedule;

            let cron = match CronSet::parse(&schedule.cron_expr) {
                Ok(cron) => cron,
                Err(e) => {
                    self.logger
                        .log_schedule_invalid(&schedule.id, &schedule.cron_expr, &e.to_string());
                    report.invalid += 1;
                    continue;
                }
            };

            let matched = match self.config.zone {
                CronZone::Local => cron.matches(&at.with_timezone(&Local)),
                CronZone::Utc => cron.matches(&at),
            };
            if !matched {
                continue;
            }
            report.matched += 1;

            let outcome = self.dispatch(job).await;
            let error = outcome.as_ref().err().map(|e| format!("{:#}", e));
            self.logger.log_schedule_fired(
                &schedule.id,
                &schedule.target_id,
                schedule.action.as_str(),
                &at.to_rfc3339(),
                error.as_deref(),
            );

            let succeeded = outcome.is_ok();
            if succeeded {
                report.succeeded += 1;
                self.metrics.inc_dispatch(schedule.action.as_str(), "ok");
            } else {
                report.failed += 1;
                self.metrics.inc_dispatch(schedule.action.as_str(), "error");
            }

            if succeeded || self.config.stamp_failed_runs {
                if let Err(e) = self.schedules.record_last_run(&schedule.id, at).await {
                    warn!(schedule_id = %schedule.id, error = %e, "Failed to record last run");
                }
            }
        }

        if let Some(health) = &self.health {
            let problem = (report.failed > 0).then(|| {
                format!(
                    "{} of {} scheduled actions failed",
                    report.failed, report.matched
                )
            });
            health
                .record_tick(Component::Scheduler, at, problem)
                .await;
        }

        report
    }

    async fn dispatch(&self, job: &ScheduledJob) -> Result<()> {
        let schedule = &job.schedule;
        let handle = || {
            job.runtime_handle
                .as_deref()
                .ok_or_else(|| anyhow!("server {} has no container", schedule.target_id))
        };

        let outcome = match schedule.action {
            ScheduleAction::Start => self.lifecycle.start(handle()?).await,
            ScheduleAction::Stop => self.lifecycle.stop(handle()?).await,
            ScheduleAction::Restart => self.lifecycle.restart(handle()?).await,
            ScheduleAction::Backup => self
                .backups
                .create_backup(&schedule.target_id)
                .await
                .map(|backup| {
                    info!(
                        target_id = %schedule.target_id,
                        backup_id = %backup.id,
                        filename = %backup.filename,
                        size_bytes = backup.size_bytes,
                        "Scheduled backup created"
                    );
                }),
        };
        outcome.with_context(|| format!("{} failed", schedule.action))?;

        if let Some(state) = schedule.action.resulting_state() {
            // the action itself went through; a stale status is only logged
            if let Err(e) = self.targets.record_state(&schedule.target_id, state).await {
                warn!(
                    target_id = %schedule.target_id,
                    state = %state,
                    error = %e,
                    "Failed to record server state"
                );
            }
        }

        Ok(())
    }
}

/// Builder for a lifecycle scheduler
pub struct LifecycleSchedulerBuilder {
    schedules: Option<Arc<dyn ScheduleStore>>,
    targets: Option<Arc<dyn TargetStore>>,
    lifecycle: Option<Arc<dyn LifecycleControl>>,
    backups: Option<Arc<dyn BackupService>>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    logger: StructuredLogger,
    health: Option<HealthRegistry>,
}

impl LifecycleSchedulerBuilder {
    pub fn new() -> Self {
        Self {
            schedules: None,
            targets: None,
            lifecycle: None,
            backups: None,
            clock: Arc::new(SystemClock),
            config: SchedulerConfig::default(),
            logger: StructuredLogger::new("localhost"),
            health: None,
        }
    }

    pub fn schedules(mut self, schedules: Arc<dyn ScheduleStore>) -> Self {
        self.schedules = Some(schedules);
        self
    }

    pub fn targets(mut self, targets: Arc<dyn TargetStore>) -> Self {
        self.targets = Some(targets);
        self
    }

    pub fn lifecycle(mut self, lifecycle: Arc<dyn LifecycleControl>) -> Self {
        self.lifecycle = Some(lifecycle);
        self
    }

    pub fn backups(mut self, backups: Arc<dyn BackupService>) -> Self {
        self.backups = Some(backups);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn build(self) -> Result<LifecycleScheduler> {
        let schedules = self
            .schedules
            .ok_or_else(|| anyhow!("Schedule store is required"))?;
        let targets = self
            .targets
            .ok_or_else(|| anyhow!("Target store is required"))?;
        let lifecycle = self
            .lifecycle
            .ok_or_else(|| anyhow!("Lifecycle control is required"))?;
        let backups = self
            .backups
            .ok_or_else(|| anyhow!("Backup service is required"))?;

        Ok(LifecycleScheduler {
            inner: Arc::new(Inner {
                schedules,
                targets,
                lifecycle,
                backups,
                clock: self.clock,
                config: self.config,
                metrics: AgentMetrics::new(),
                logger: self.logger,
                health: self.health,
            }),
            task: Mutex::new(None),
        })
    }
}

impl Default for LifecycleSchedulerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
