//! Integration tests for telemetry collection
//!
//! These tests drive the collector against an in-memory SQLite store and a
//! scripted stats source, without a container runtime.

#[cfg(test)]
mod collector_tests {
    use crate::clock::ManualClock;
    use crate::collector::{CollectionConfig, TelemetryCollector, TelemetryCollectorBuilder};
    use crate::health::{Component, ComponentStatus, HealthRegistry};
    use crate::models::{
        CpuCounters, MetricSample, NetworkCounters, StatsSnapshot, Target, TargetState,
    };
    use crate::runtime::MetricsSource;
    use crate::store::{SampleStore, SqliteStore, TargetStore};
    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
    use std::collections::{HashMap, HashSet};
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Stats source returning a fixed snapshot per container handle
    struct ScriptedSource {
        snapshots: Mutex<HashMap<String, StatsSnapshot>>,
        failing: HashSet<String>,
        calls: AtomicUsize,
    }

    impl ScriptedSource {
        fn new() -> Self {
            Self {
                snapshots: Mutex::new(HashMap::new()),
                failing: HashSet::new(),
                calls: AtomicUsize::new(0),
            }
        }

        fn with(self, handle: &str, cpu_used: u64) -> Self {
            self.snapshots
                .lock()
                .unwrap()
                .insert(handle.to_string(), snapshot(cpu_used));
            self
        }

        fn failing(mut self, handle: &str) -> Self {
            self.failing.insert(handle.to_string());
            self
        }
    }

    #[async_trait]
    impl MetricsSource for ScriptedSource {
        async fn stats_snapshot(&self, handle: &str) -> Result<StatsSnapshot> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.contains(handle) {
                anyhow::bail!("container {} not found", handle);
            }
            self.snapshots
                .lock()
                .unwrap()
                .get(handle)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no snapshot for {}", handle))
        }
    }

    /// Sample store whose inserts always fail
    struct BrokenSamples;

    #[async_trait]
    impl SampleStore for BrokenSamples {
        async fn insert_sample(&self, _sample: &MetricSample) -> Result<()> {
            anyhow::bail!("disk I/O error")
        }

        async fn delete_samples_older_than(
            &self,
            _target_id: Option<&str>,
            _cutoff: DateTime<Utc>,
        ) -> Result<u64> {
            anyhow::bail!("disk I/O error")
        }

        async fn latest_sample(&self, _target_id: &str) -> Result<Option<MetricSample>> {
            Ok(None)
        }

        async fn samples_since(
            &self,
            _target_id: &str,
            _since: DateTime<Utc>,
        ) -> Result<Vec<MetricSample>> {
            Ok(vec![])
        }
    }

    /// Target store whose queries always fail
    struct BrokenTargets;

    #[async_trait]
    impl TargetStore for BrokenTargets {
        async fn running_targets(&self) -> Result<Vec<crate::models::RunningTarget>> {
            anyhow::bail!("database is locked")
        }

        async fn lookup_target(&self, _target_id: &str) -> Result<Option<Target>> {
            Ok(None)
        }

        async fn record_state(&self, _target_id: &str, _state: TargetState) -> Result<()> {
            Ok(())
        }
    }

    fn snapshot(cpu_used: u64) -> StatsSnapshot {
        let mut networks = HashMap::new();
        networks.insert(
            "eth0".to_string(),
            NetworkCounters {
                rx_bytes: 1000,
                tx_bytes: 500,
            },
        );
        StatsSnapshot {
            cpu: CpuCounters {
                total_usage: 1_000_000_000 + cpu_used,
                system_usage: 11_000_000_000,
            },
            precpu: CpuCounters {
                total_usage: 1_000_000_000,
                system_usage: 10_000_000_000,
            },
            online_cpus: 2,
            memory_usage: 512 * 1024 * 1024,
            memory_limit: 2048 * 1024 * 1024,
            networks,
            disk_bytes: 0,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 4, 18, 30, 0).unwrap()
    }

    async fn seeded_store() -> Arc<SqliteStore> {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        for (id, handle, state) in [
            ("alpha", Some("c-alpha"), TargetState::Running),
            ("beta", Some("c-beta"), TargetState::Running),
            ("idle", Some("c-idle"), TargetState::Exited),
            ("fresh", None, TargetState::Created),
        ] {
            store
                .put_target(&Target {
                    id: id.to_string(),
                    runtime_handle: handle.map(str::to_string),
                    state,
                })
                .await
                .unwrap();
        }
        store
    }

    fn collector(
        store: Arc<SqliteStore>,
        source: Arc<ScriptedSource>,
        clock: Arc<ManualClock>,
    ) -> TelemetryCollector {
        TelemetryCollectorBuilder::new()
            .targets(store.clone())
            .samples(store)
            .source(source)
            .clock(clock)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_tick_persists_caches_and_fans_out() {
        let store = seeded_store().await;
        let source = Arc::new(
            ScriptedSource::new()
                .with("c-alpha", 200_000_000)
                .with("c-beta", 100_000_000)
                .with("c-idle", 900_000_000),
        );
        let clock = Arc::new(ManualClock::new(now()));
        let collector = collector(store.clone(), source.clone(), clock);

        let mut conduit = collector.subscribe("alpha").await;
        let report = collector.collect_once().await;

        assert_eq!(report.targets, 2);
        assert_eq!(report.collected, 2);
        assert_eq!(report.delivered, 1);
        assert_eq!(report.snapshot_errors, 0);
        // stopped and handle-less servers are never sampled
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        assert!(collector.latest("idle").await.is_none());

        let live = conduit.try_recv().unwrap();
        assert!((live.cpu_percent - 40.0).abs() < 1e-9);
        assert_eq!(live.network_rx, 1000);
        assert_eq!(live.recorded_at, now());

        let cached = collector.latest("beta").await.unwrap();
        assert!((cached.cpu_percent - 20.0).abs() < 1e-9);

        let persisted = store.latest_sample("alpha").await.unwrap().unwrap();
        assert_eq!(persisted, live);
    }

    #[tokio::test]
    async fn test_snapshot_failure_skips_only_that_target() {
        let store = seeded_store().await;
        let source = Arc::new(
            ScriptedSource::new()
                .with("c-alpha", 200_000_000)
                .failing("c-beta"),
        );
        let clock = Arc::new(ManualClock::new(now()));
        let collector = collector(store.clone(), source, clock);

        let report = collector.collect_once().await;
        assert_eq!(report.collected, 1);
        assert_eq!(report.snapshot_errors, 1);
        assert!(collector.latest("alpha").await.is_some());
        assert!(collector.latest("beta").await.is_none());
        assert!(store.latest_sample("beta").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_persist_failure_still_caches_and_fans_out() {
        let targets = seeded_store().await;
        let source = Arc::new(
            ScriptedSource::new()
                .with("c-alpha", 200_000_000)
                .with("c-beta", 200_000_000),
        );
        let collector = TelemetryCollectorBuilder::new()
            .targets(targets)
            .samples(Arc::new(BrokenSamples))
            .source(source)
            .clock(Arc::new(ManualClock::new(now())))
            .build()
            .unwrap();

        let mut conduit = collector.subscribe("beta").await;
        let report = collector.collect_once().await;

        assert_eq!(report.persist_errors, 2);
        assert_eq!(report.collected, 2);
        assert_eq!(report.swept, 0);
        assert!(collector.latest("alpha").await.is_some());
        assert!(conduit.try_recv().is_some());
    }

    #[tokio::test]
    async fn test_target_query_failure_marks_collector_degraded() {
        let health = HealthRegistry::new();
        health
            .register_loop(Component::Collector, Duration::from_secs(10))
            .await;

        let collector = TelemetryCollectorBuilder::new()
            .targets(Arc::new(BrokenTargets))
            .samples(Arc::new(BrokenSamples))
            .source(Arc::new(ScriptedSource::new()))
            .health(health.clone())
            .build()
            .unwrap();

        let report = collector.collect_once().await;
        assert!(report.query_failed);
        assert_eq!(report.collected, 0);

        let status = health.health().await;
        assert_eq!(
            status.components["collector"].status,
            ComponentStatus::Degraded
        );
    }

    #[tokio::test]
    async fn test_tick_outcome_drives_collector_health() {
        let store = seeded_store().await;
        let health = HealthRegistry::new();
        health
            .register_loop(Component::Collector, Duration::from_secs(10))
            .await;
        let clock = Arc::new(ManualClock::new(now()));

        let collector = TelemetryCollectorBuilder::new()
            .targets(store.clone())
            .samples(store)
            .source(Arc::new(
                ScriptedSource::new()
                    .with("c-alpha", 200_000_000)
                    .failing("c-beta"),
            ))
            .clock(clock.clone())
            .health(health.clone())
            .build()
            .unwrap();

        collector.collect_once().await;

        let status = health.health_at(now()).await;
        let entry = &status.components["collector"];
        assert_eq!(entry.status, ComponentStatus::Degraded);
        assert_eq!(
            entry.message.as_deref(),
            Some("1 of 2 servers failed to report stats")
        );
        assert_eq!(entry.last_activity, Some(now()));

        // no tick for a minute: the collector is reported as stalled
        let later = health.health_at(now() + ChronoDuration::minutes(1)).await;
        assert!(later.components["collector"]
            .message
            .as_deref()
            .unwrap()
            .starts_with("no tick since"));
    }

    /// Shared buffer for capturing formatted log lines
    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_snapshot_failure_is_logged_at_default_level() {
        let logs = LogBuffer::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let store = seeded_store().await;
        let source = Arc::new(
            ScriptedSource::new()
                .with("c-alpha", 200_000_000)
                .failing("c-beta"),
        );
        let collector = collector(store, source, Arc::new(ManualClock::new(now())));
        collector.collect_once().await;

        let output = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        let line = output
            .lines()
            .find(|l| l.contains("Failed to read stats"))
            .expect("stats failure should be logged");
        assert!(line.contains("WARN"));
        assert!(line.contains("c-beta"));
    }

    #[tokio::test]
    async fn test_tick_sweeps_samples_past_retention() {
        let store = seeded_store().await;
        for hours_ago in [30, 25, 23, 1] {
            store
                .insert_sample(&MetricSample {
                    target_id: "idle".to_string(),
                    cpu_percent: 0.0,
                    memory_bytes: 0,
                    memory_limit: 0,
                    network_rx: 0,
                    network_tx: 0,
                    disk_bytes: 0,
                    recorded_at: now() - ChronoDuration::hours(hours_ago),
                })
                .await
                .unwrap();
        }

        let source = Arc::new(ScriptedSource::new().with("c-alpha", 1).with("c-beta", 1));
        let clock = Arc::new(ManualClock::new(now()));
        let collector = collector(store.clone(), source, clock);

        let report = collector.collect_once().await;
        assert_eq!(report.swept, 2);

        let kept = store
            .samples_since("idle", now() - ChronoDuration::hours(48))
            .await
            .unwrap();
        assert_eq!(kept.len(), 2);
    }

    #[tokio::test]
    async fn test_samples_persist_in_tick_order() {
        let store = seeded_store().await;
        let source = Arc::new(ScriptedSource::new().with("c-alpha", 1).with("c-beta", 1));
        let clock = Arc::new(ManualClock::new(now()));
        let collector = collector(store.clone(), source, clock.clone());

        for _ in 0..3 {
            collector.collect_once().await;
            clock.advance(ChronoDuration::seconds(10));
        }

        let history = store
            .samples_since("alpha", now() - ChronoDuration::minutes(1))
            .await
            .unwrap();
        let times: Vec<_> = history.iter().map(|s| s.recorded_at).collect();
        assert_eq!(
            times,
            vec![
                now(),
                now() + ChronoDuration::seconds(10),
                now() + ChronoDuration::seconds(20)
            ]
        );
    }

    #[tokio::test]
    async fn test_start_ticks_immediately_and_stop_exits() {
        let store = seeded_store().await;
        let source = Arc::new(ScriptedSource::new().with("c-alpha", 1).with("c-beta", 1));
        let collector = TelemetryCollectorBuilder::new()
            .targets(store.clone())
            .samples(store)
            .source(source)
            .config(CollectionConfig {
                interval: Duration::from_secs(3600),
                ..CollectionConfig::default()
            })
            .build()
            .unwrap();

        let mut conduit = collector.subscribe("alpha").await;
        collector.start();
        // second start is a no-op
        collector.start();
        assert!(collector.is_running());

        let first = tokio::time::timeout(Duration::from_secs(5), conduit.recv())
            .await
            .expect("first tick should run immediately");
        assert!(first.is_some());

        let handle = collector.stop().expect("collector was running");
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("loop should exit promptly")
            .unwrap();
        assert!(!collector.is_running());
        assert!(collector.stop().is_none());
    }

    #[tokio::test]
    async fn test_independent_collectors_do_not_share_state() {
        let store = seeded_store().await;
        let clock = Arc::new(ManualClock::new(now()));
        let first = collector(
            store.clone(),
            Arc::new(ScriptedSource::new().with("c-alpha", 1).with("c-beta", 1)),
            clock.clone(),
        );
        let second = collector(store, Arc::new(ScriptedSource::new()), clock);

        first.collect_once().await;

        assert!(first.latest("alpha").await.is_some());
        assert!(second.latest("alpha").await.is_none());
    }

    #[tokio::test]
    async fn test_unsubscribe_twice_is_noop() {
        let store = seeded_store().await;
        let source = Arc::new(ScriptedSource::new().with("c-alpha", 1).with("c-beta", 1));
        let collector = collector(store, source, Arc::new(ManualClock::new(now())));

        let mut conduit = collector.subscribe("alpha").await;
        collector.unsubscribe("alpha", &conduit).await;
        collector.unsubscribe("alpha", &conduit).await;

        let report = collector.collect_once().await;
        assert_eq!(report.delivered, 0);
        assert!(conduit.recv().await.is_none());
    }
}
