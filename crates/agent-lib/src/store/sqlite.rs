//! SQLite-backed store
//!
//! One connection behind a mutex, so every writer is serialized. Calls run
//! on the blocking pool to keep rusqlite off the async workers.
//! Timestamps are stored as Unix milliseconds.

use super::{SampleStore, ScheduleStore, TargetStore};
use crate::models::{
    MetricSample, RunningTarget, Schedule, ScheduleAction, ScheduledJob, Target, TargetState,
};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

const MIGRATIONS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS servers (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL DEFAULT '',
        container_id TEXT,
        status TEXT NOT NULL DEFAULT 'stopped',
        updated_at INTEGER
    )",
    "CREATE TABLE IF NOT EXISTS stats (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        server_id TEXT NOT NULL REFERENCES servers(id) ON DELETE CASCADE,
        cpu_percent REAL NOT NULL,
        memory_bytes INTEGER NOT NULL,
        memory_limit INTEGER NOT NULL,
        disk_bytes INTEGER NOT NULL,
        network_rx INTEGER NOT NULL,
        network_tx INTEGER NOT NULL,
        recorded_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_stats_server_time ON stats(server_id, recorded_at)",
    "CREATE TABLE IF NOT EXISTS schedules (
        id TEXT PRIMARY KEY,
        server_id TEXT NOT NULL REFERENCES servers(id) ON DELETE CASCADE,
        name TEXT NOT NULL,
        cron_expr TEXT NOT NULL,
        action TEXT NOT NULL,
        enabled INTEGER NOT NULL DEFAULT 1,
        last_run INTEGER,
        created_at INTEGER NOT NULL
    )",
];

const SAMPLE_COLUMNS: &str = "server_id, cpu_percent, memory_bytes, memory_limit, disk_bytes, \
                              network_rx, network_tx, recorded_at";

/// Schedule row as written by the CRUD layer
#[derive(Debug, Clone)]
pub struct NewSchedule {
    pub id: String,
    pub target_id: String,
    pub name: String,
    pub cron_expr: String,
    /// Stored verbatim; validated only when the scheduler loads it
    pub action: String,
    pub enabled: bool,
}

/// Store over a single SQLite connection
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database file and run migrations
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create database directory {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database {}", path.display()))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))
            .context("Failed to enable WAL journal")?;
        Self::from_connection(conn)
    }

    /// Fresh private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))
            .context("Failed to set busy timeout")?;
        conn.pragma_update(None, "foreign_keys", true)
            .context("Failed to enable foreign keys")?;

        for migration in MIGRATIONS {
            conn.execute_batch(migration)
                .with_context(|| format!("Migration failed: {}", migration))?;
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| anyhow!("database connection mutex poisoned"))?;
            f(&guard)
        })
        .await
        .context("Database task panicked")?
    }

    /// Insert or update a server row
    pub async fn put_target(&self, target: &Target) -> Result<()> {
        let target = target.clone();
        let now = Utc::now().timestamp_millis();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO servers (id, name, container_id, status, updated_at)
                 VALUES (?1, ?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                    container_id = excluded.container_id,
                    status = excluded.status,
                    updated_at = excluded.updated_at",
                params![target.id, target.runtime_handle, target.state.as_str(), now],
            )
            .with_context(|| format!("Failed to write server {}", target.id))?;
            Ok(())
        })
        .await
    }

    /// Insert a schedule row
    pub async fn put_schedule(&self, schedule: &NewSchedule) -> Result<()> {
        let schedule = schedule.clone();
        let now = Utc::now().timestamp_millis();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO schedules (id, server_id, name, cron_expr, action, enabled, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    schedule.id,
                    schedule.target_id,
                    schedule.name,
                    schedule.cron_expr,
                    schedule.action,
                    schedule.enabled,
                    now
                ],
            )
            .with_context(|| format!("Failed to write schedule {}", schedule.id))?;
            Ok(())
        })
        .await
    }

    /// Fetch one schedule by id, including disabled ones
    pub async fn schedule(&self, schedule_id: &str) -> Result<Option<Schedule>> {
        let schedule_id = schedule_id.to_string();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT id, server_id, name, cron_expr, action, enabled, last_run
                     FROM schedules WHERE id = ?1",
                    params![schedule_id],
                    schedule_row,
                )
                .optional()
                .context("Failed to query schedule")?;

            row.map(ScheduleRow::into_schedule).transpose()
        })
        .await
    }
}

fn millis_to_datetime(ms: i64, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(column, ms))
}

fn sample_row(row: &Row<'_>) -> rusqlite::Result<MetricSample> {
    Ok(MetricSample {
        target_id: row.get(0)?,
        cpu_percent: row.get(1)?,
        memory_bytes: row.get::<_, i64>(2)? as u64,
        memory_limit: row.get::<_, i64>(3)? as u64,
        disk_bytes: row.get::<_, i64>(4)? as u64,
        network_rx: row.get::<_, i64>(5)? as u64,
        network_tx: row.get::<_, i64>(6)? as u64,
        recorded_at: millis_to_datetime(row.get(7)?, 7)?,
    })
}

/// Schedule columns before the action string is resolved
struct ScheduleRow {
    id: String,
    target_id: String,
    name: String,
    cron_expr: String,
    action: String,
    enabled: bool,
    last_run: Option<DateTime<Utc>>,
}

impl ScheduleRow {
    fn into_schedule(self) -> Result<Schedule> {
        let action: ScheduleAction = self
            .action
            .parse()
            .with_context(|| format!("schedule {}", self.id))?;

        Ok(Schedule {
            id: self.id,
            target_id: self.target_id,
            name: self.name,
            cron_expr: self.cron_expr,
            action,
            enabled: self.enabled,
            last_run: self.last_run,
        })
    }
}

fn schedule_row(row: &Row<'_>) -> rusqlite::Result<ScheduleRow> {
    let last_run = match row.get::<_, Option<i64>>(6)? {
        Some(ms) => Some(millis_to_datetime(ms, 6)?),
        None => None,
    };

    Ok(ScheduleRow {
        id: row.get(0)?,
        target_id: row.get(1)?,
        name: row.get(2)?,
        cron_expr: row.get(3)?,
        action: row.get(4)?,
        enabled: row.get(5)?,
        last_run,
    })
}

#[async_trait]
impl TargetStore for SqliteStore {
    async fn running_targets(&self) -> Result<Vec<RunningTarget>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, container_id FROM servers
                 WHERE status = 'running' AND container_id IS NOT NULL AND container_id != ''
                 ORDER BY id",
            )?;
            let targets = stmt
                .query_map([], |row| {
                    Ok(RunningTarget {
                        id: row.get(0)?,
                        runtime_handle: row.get(1)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()
                .context("Failed to query running servers")?;
            Ok(targets)
        })
        .await
    }

    async fn lookup_target(&self, target_id: &str) -> Result<Option<Target>> {
        let target_id = target_id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT id, NULLIF(container_id, ''), status FROM servers WHERE id = ?1",
                params![target_id],
                |row| {
                    let status: String = row.get(2)?;
                    Ok(Target {
                        id: row.get(0)?,
                        runtime_handle: row.get(1)?,
                        state: TargetState::from_label(&status),
                    })
                },
            )
            .optional()
            .context("Failed to look up server")
        })
        .await
    }

    async fn record_state(&self, target_id: &str, state: TargetState) -> Result<()> {
        let target_id = target_id.to_string();
        let now = Utc::now().timestamp_millis();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE servers SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![state.as_str(), now, target_id],
            )
            .with_context(|| format!("Failed to record state for server {}", target_id))?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl SampleStore for SqliteStore {
    async fn insert_sample(&self, sample: &MetricSample) -> Result<()> {
        let sample = sample.clone();
        self.with_conn(move |conn| {
            conn.execute(
                &format!("INSERT INTO stats ({SAMPLE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
                params![
                    sample.target_id,
                    sample.cpu_percent,
                    sample.memory_bytes as i64,
                    sample.memory_limit as i64,
                    sample.disk_bytes as i64,
                    sample.network_rx as i64,
                    sample.network_tx as i64,
                    sample.recorded_at.timestamp_millis()
                ],
            )
            .with_context(|| format!("Failed to insert sample for {}", sample.target_id))?;
            Ok(())
        })
        .await
    }

    async fn delete_samples_older_than(
        &self,
        target_id: Option<&str>,
        cutoff: DateTime<Utc>,
    ) -> Result<u64> {
        let target_id = target_id.map(str::to_string);
        let cutoff_ms = cutoff.timestamp_millis();
        self.with_conn(move |conn| {
            let deleted = match &target_id {
                Some(id) => conn.execute(
                    "DELETE FROM stats WHERE server_id = ?1 AND recorded_at < ?2",
                    params![id, cutoff_ms],
                ),
                None => conn.execute(
                    "DELETE FROM stats WHERE recorded_at < ?1",
                    params![cutoff_ms],
                ),
            }
            .context("Failed to delete old samples")?;

            debug!(deleted, cutoff_ms, "Swept old samples");
            Ok(deleted as u64)
        })
        .await
    }

    async fn latest_sample(&self, target_id: &str) -> Result<Option<MetricSample>> {
        let target_id = target_id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                &format!(
                    "SELECT {SAMPLE_COLUMNS} FROM stats WHERE server_id = ?1
                     ORDER BY recorded_at DESC, id DESC LIMIT 1"
                ),
                params![target_id],
                sample_row,
            )
            .optional()
            .context("Failed to query latest sample")
        })
        .await
    }

    async fn samples_since(
        &self,
        target_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<MetricSample>> {
        let target_id = target_id.to_string();
        let since_ms = since.timestamp_millis();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SAMPLE_COLUMNS} FROM stats WHERE server_id = ?1 AND recorded_at >= ?2
                 ORDER BY recorded_at ASC, id ASC"
            ))?;
            let samples = stmt
                .query_map(params![target_id, since_ms], sample_row)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .context("Failed to query sample history")?;
            Ok(samples)
        })
        .await
    }
}

#[async_trait]
impl ScheduleStore for SqliteStore {
    async fn enabled_schedules(&self) -> Result<Vec<ScheduledJob>> {
        let rows = self
            .with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT s.id, s.server_id, s.name, s.cron_expr, s.action, s.enabled,
                            s.last_run, NULLIF(srv.container_id, '')
                     FROM schedules s
                     JOIN servers srv ON s.server_id = srv.id
                     WHERE s.enabled = 1
                     ORDER BY s.created_at ASC, s.rowid ASC",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        let handle: Option<String> = row.get(7)?;
                        Ok((schedule_row(row)?, handle))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .context("Failed to query enabled schedules")?;
                Ok(rows)
            })
            .await?;

        let mut jobs = Vec::with_capacity(rows.len());
        for (row, runtime_handle) in rows {
            let schedule_id = row.id.clone();
            match row.into_schedule() {
                Ok(schedule) => jobs.push(ScheduledJob {
                    schedule,
                    runtime_handle,
                }),
                Err(e) => {
                    warn!(
                        schedule_id = %schedule_id,
                        error = %e,
                        "Skipping schedule with unknown action"
                    );
                }
            }
        }

        Ok(jobs)
    }

    async fn record_last_run(&self, schedule_id: &str, at: DateTime<Utc>) -> Result<()> {
        let schedule_id = schedule_id.to_string();
        let at_ms = at.timestamp_millis();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE schedules SET last_run = ?1 WHERE id = ?2",
                params![at_ms, schedule_id],
            )
            .with_context(|| format!("Failed to record last run for schedule {}", schedule_id))?;
            Ok(())
        })
        .await
    }
}
