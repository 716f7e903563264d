//! Telemetry collection loop
//!
//! Polls every running target on a fixed interval, persists each sample,
//! refreshes the latest-sample cache, pushes to live subscribers and sweeps
//! samples past the retention window.

use super::hub::{SampleConduit, SampleHub};
use super::sample::sample_from_snapshot;
use crate::clock::{Clock, SystemClock};
use crate::health::{Component, HealthRegistry};
use crate::models::MetricSample;
use crate::observability::AgentMetrics;
use crate::runtime::MetricsSource;
use crate::store::{SampleStore, TargetStore};
use anyhow::Result;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Configuration for the telemetry collector
#[derive(Debug, Clone)]
pub struct CollectionConfig {
    /// Polling interval (default: 10 seconds)
    pub interval: Duration,
    /// Samples older than this are deleted after each tick (default: 24 hours)
    pub retention: chrono::Duration,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            retention: chrono::Duration::hours(24),
        }
    }
}

/// Outcome of one collection tick
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    /// Running targets returned by the store
    pub targets: usize,
    /// Samples produced (cached and fanned out)
    pub collected: usize,
    pub snapshot_errors: usize,
    pub persist_errors: usize,
    /// Conduits that received a sample
    pub delivered: usize,
    /// Rows removed by the retention sweep
    pub swept: u64,
    /// The running-target query failed; nothing else happened
    pub query_failed: bool,
}

struct Inner {
    targets: Arc<dyn TargetStore>,
    samples: Arc<dyn SampleStore>,
    source: Arc<dyn MetricsSource>,
    clock: Arc<dyn Clock>,
    hub: SampleHub,
    config: CollectionConfig,
    metrics: AgentMetrics,
    health: Option<HealthRegistry>,
}

struct RunningTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Background telemetry collector with a latest-sample cache and live fan-out
pub struct TelemetryCollector {
    inner: Arc<Inner>,
    task: Mutex<Option<RunningTask>>,
}

impl TelemetryCollector {
    pub fn new(
        targets: Arc<dyn TargetStore>,
        samples: Arc<dyn SampleStore>,
        source: Arc<dyn MetricsSource>,
        config: CollectionConfig,
    ) -> Self {
        Self::from_parts(targets, samples, source, Arc::new(SystemClock), config, None)
    }

    fn from_parts(
        targets: Arc<dyn TargetStore>,
        samples: Arc<dyn SampleStore>,
        source: Arc<dyn MetricsSource>,
        clock: Arc<dyn Clock>,
        config: CollectionConfig,
        health: Option<HealthRegistry>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                targets,
                samples,
                source,
                clock,
                hub: SampleHub::new(),
                config,
                metrics: AgentMetrics::new(),
                health,
            }),
            task: Mutex::new(None),
        }
    }

    /// Spawn the polling loop. Does nothing if it is already running.
    pub fn start(&self) {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(running) = task.as_ref() {
            if !running.handle.is_finished() {
                debug!("Telemetry collector already running");
                return;
            }
        }

        let token = CancellationToken::new();
        let handle = tokio::spawn(Self::run(Arc::clone(&self.inner), token.clone()));
        *task = Some(RunningTask { token, handle });
    }

    /// Signal the loop to exit. The returned handle resolves once it has.
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

    /// Most recent sample for a target, straight from the cache
    pub async fn latest(&self, target_id: &str) -> Option<MetricSample> {
        self.inner.hub.latest(target_id).await
    }

    pub async fn subscribe(&self, target_id: &str) -> SampleConduit {
        let conduit = self.inner.hub.subscribe(target_id).await;
        self.inner
            .metrics
            .set_live_subscribers(self.inner.hub.subscriber_count().await as i64);
        conduit
    }

    pub async fn unsubscribe(&self, target_id: &str, conduit: &SampleConduit) {
        if self.inner.hub.unsubscribe(target_id, conduit).await {
            self.inner
                .metrics
                .set_live_subscribers(self.inner.hub.subscriber_count().await as i64);
        }
    }

    /// Live conduits across all targets
    pub async fn subscriber_count(&self) -> usize {
        self.inner.hub.subscriber_count().await
    }

    /// Run a single collection tick
    pub async fn collect_once(&self) -> TickReport {
        self.inner.collect_once().await
    }

    async fn run(inner: Arc<Inner>, token: CancellationToken) {
        info!(
            interval_secs = inner.config.interval.as_secs(),
            retention_hours = inner.config.retention.num_hours(),
            "Starting telemetry collector"
        );

        // first tick completes immediately
        let mut ticker = interval(inner.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    info!("Stopping telemetry collector");
                    break;
                }
                _ = ticker.tick() => {
                    let report = inner.collect_once().await;
                    debug!(
                        targets = report.targets,
                        collected = report.collected,
                        snapshot_errors = report.snapshot_errors,
                        persist_errors = report.persist_errors,
                        swept = report.swept,
                        "Collection tick complete"
                    );
                }
            }
        }
    }
}

impl Inner {
    async fn collect_once(&self) -> TickReport {
        let start = Instant::now();
        let mut report = TickReport::default();

        let targets = match self.targets.running_targets().await {
            Ok(targets) => targets,
            Err(e) => {
                warn!(error = %e, "Failed to query running servers");
                self.metrics.inc_collection_errors();
                self.set_health(Some(format!("target query failed: {}", e)))
                    .await;
                report.query_failed = true;
                return report;
            }
        };
        report.targets = targets.len();
        self.metrics.set_targets_monitored(targets.len() as i64);

        for target in &targets {
            let snapshot = match self.source.stats_snapshot(&target.runtime_handle).await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!(
                        target_id = %target.id,
                        handle = %target.runtime_handle,
                        error = %e,
                        "Failed to read stats"
                    );
                    report.snapshot_errors += 1;
                    self.metrics.inc_collection_errors();
                    continue;
                }
            };

            let sample = sample_from_snapshot(&target.id, &snapshot, self.clock.now());

            if let Err(e) = self.samples.insert_sample(&sample).await {
                warn!(target_id = %target.id, error = %e, "Failed to persist sample");
                report.persist_errors += 1;
                self.metrics.inc_persist_errors();
            }

            report.delivered += self.hub.publish(sample).await;
            report.collected += 1;
            self.metrics.inc_samples_collected();
        }

        match self.clock.now().checked_sub_signed(self.config.retention) {
            Some(cutoff) => match self.samples.delete_samples_older_than(None, cutoff).await {
                Ok(deleted) => report.swept = deleted,
                Err(e) => warn!(error = %e, "Failed to sweep old samples"),
            },
            None => warn!(
                retention_hours = self.config.retention.num_hours(),
                "Retention window reaches past the earliest date, skipping sweep"
            ),
        }

        self.metrics
            .observe_tick_latency(start.elapsed().as_secs_f64());

        let problem = (report.snapshot_errors > 0).then(|| {
            format!(
                "{} of {} servers failed to report stats",
                report.snapshot_errors, report.targets
            )
        });
        self.set_health(problem).await;

        report
    }

    async fn set_health(&self, problem: Option<String>) {
        if let Some(health) = &self.health {
            health
                .record_tick(Component::Collector, self.clock.now(), problem)
                .await;
        }
    }
}

/// Builder for a telemetry collector
pub struct TelemetryCollectorBuilder {
    targets: Option<Arc<dyn TargetStore>>,
    samples: Option<Arc<dyn SampleStore>>,
    source: Option<Arc<dyn MetricsSource>>,
    clock: Arc<dyn Clock>,
    config: CollectionConfig,
    health: Option<HealthRegistry>,
}

impl TelemetryCollectorBuilder {
    pub fn new() -> Self {
        Self {
            targets: None,
            samples: None,
            source: None,
            clock: Arc::new(SystemClock),
            config: CollectionConfig::default(),
            health: None,
        }
    }

    pub fn targets(mut self, targets: Arc<dyn TargetStore>) -> Self {
        self.targets = Some(targets);
        self
    }

    pub fn samples(mut self, samples: Arc<dyn SampleStore>) -> Self {
        self.samples = Some(samples);
        self
    }

    pub fn source(mut self, source: Arc<dyn MetricsSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(mut self, config: CollectionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.config.interval = interval;
        self
    }

    pub fn retention(mut self, retention: chrono::Duration) -> Self {
        self.config.retention = retention;
        self
    }

    /// Report tick outcomes to the health registry
    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn build(self) -> Result<TelemetryCollector> {
        let targets = self
            .targets
            .ok_or_else(|| anyhow::anyhow!("Target store is required"))?;
        let samples = self
            .samples
            .ok_or_else(|| anyhow::anyhow!("Sample store is required"))?;
        let source = self
            .source
            .ok_or_else(|| anyhow::anyhow!("Metrics source is required"))?;
        if self.config.interval.is_zero() {
            anyhow::bail!("Collection interval must be positive");
        }

        Ok(TelemetryCollector::from_parts(
            targets,
            samples,
            source,
            self.clock,
            self.config,
            self.health,
        ))
    }
}

impl Default for TelemetryCollectorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
