//! Health tracking for the host agent
//!
//! The collector and scheduler report every tick they finish; the store
//! reports whether it opened. A loop that stops ticking shows up as degraded
//! once it has missed [`STALE_PERIODS`] of its own periods.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Missed periods after which a loop counts as stalled
pub const STALE_PERIODS: u32 = 3;

/// Parts of the agent that report health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Component {
    Collector,
    Scheduler,
    Store,
}

impl Component {
    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Collector => "collector",
            Component::Scheduler => "scheduler",
            Component::Store => "store",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Working, but some of the last tick failed or the loop is late
    Degraded,
    Unhealthy,
}

impl ComponentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentStatus::Healthy => "healthy",
            ComponentStatus::Degraded => "degraded",
            ComponentStatus::Unhealthy => "unhealthy",
        }
    }

    pub fn is_operational(&self) -> bool {
        !matches!(self, ComponentStatus::Unhealthy)
    }
}

/// One component as served on `/healthz`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// When the component last finished a tick or reported in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: BTreeMap<String, ComponentHealth>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone)]
struct Entry {
    status: ComponentStatus,
    message: Option<String>,
    last_activity: Option<DateTime<Utc>>,
    /// Only set for loops
    stale_after: Option<chrono::Duration>,
}

impl Entry {
    /// Status as of `now`; a loop that has gone quiet is at best degraded
    fn view(&self, now: DateTime<Utc>) -> ComponentHealth {
        let stalled = match (self.stale_after, self.last_activity) {
            (Some(limit), Some(last)) => now - last > limit,
            _ => false,
        };

        if stalled && self.status == ComponentStatus::Healthy {
            let since = self
                .last_activity
                .map(|t| t.to_rfc3339())
                .unwrap_or_default();
            return ComponentHealth {
                status: ComponentStatus::Degraded,
                message: Some(format!("no tick since {}", since)),
                last_activity: self.last_activity,
            };
        }

        ComponentHealth {
            status: self.status,
            message: self.message.clone(),
            last_activity: self.last_activity,
        }
    }
}

/// Shared registry the loops report into
#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    entries: Arc<RwLock<HashMap<Component, Entry>>>,
    ready: Arc<RwLock<bool>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a component that reports on its own, such as the store
    pub async fn register(&self, component: Component) {
        self.insert(component, None).await;
    }

    /// Track a loop expected to report once per `period`
    pub async fn register_loop(&self, component: Component, period: Duration) {
        let stale_after = chrono::Duration::from_std(period)
            .ok()
            .and_then(|p| p.checked_mul(STALE_PERIODS as i32));
        self.insert(component, stale_after).await;
    }

    async fn insert(&self, component: Component, stale_after: Option<chrono::Duration>) {
        self.entries.write().await.insert(
            component,
            Entry {
                status: ComponentStatus::Healthy,
                message: None,
                last_activity: None,
                stale_after,
            },
        );
    }

    /// Record a finished tick; `problem` describes anything that failed in it
    pub async fn record_tick(
        &self,
        component: Component,
        at: DateTime<Utc>,
        problem: Option<String>,
    ) {
        let status = if problem.is_some() {
            ComponentStatus::Degraded
        } else {
            ComponentStatus::Healthy
        };
        self.set(component, status, problem, Some(at)).await;
    }

    pub async fn set_healthy(&self, component: Component) {
        self.set(component, ComponentStatus::Healthy, None, Some(Utc::now()))
            .await;
    }

    pub async fn set_unhealthy(&self, component: Component, message: impl Into<String>) {
        self.set(
            component,
            ComponentStatus::Unhealthy,
            Some(message.into()),
            Some(Utc::now()),
        )
        .await;
    }

    async fn set(
        &self,
        component: Component,
        status: ComponentStatus,
        message: Option<String>,
        at: Option<DateTime<Utc>>,
    ) {
        let mut entries = self.entries.write().await;
        let entry = entries.entry(component).or_insert(Entry {
            status,
            message: None,
            last_activity: None,
            stale_after: None,
        });
        entry.status = status;
        entry.message = message;
        entry.last_activity = at.or(entry.last_activity);
    }

    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    pub async fn health(&self) -> HealthResponse {
        self.health_at(Utc::now()).await
    }

    /// Health as of `now`, with stalled loops degraded
    pub async fn health_at(&self, now: DateTime<Utc>) -> HealthResponse {
        let components: BTreeMap<String, ComponentHealth> = self
            .entries
            .read()
            .await
            .iter()
            .map(|(component, entry)| (component.as_str().to_string(), entry.view(now)))
            .collect();

        let status = components
            .values()
            .map(|c| c.status)
            .max_by_key(|status| match status {
                ComponentStatus::Healthy => 0,
                ComponentStatus::Degraded => 1,
                ComponentStatus::Unhealthy => 2,
            })
            .unwrap_or(ComponentStatus::Healthy);

        HealthResponse { status, components }
    }

    pub async fn readiness(&self) -> ReadinessResponse {
        if !*self.ready.read().await {
            return ReadinessResponse {
                ready: false,
                reason: Some("agent still starting".to_string()),
            };
        }

        let health = self.health().await;
        let failed: Vec<&str> = health
            .components
            .iter()
            .filter(|(_, c)| c.status == ComponentStatus::Unhealthy)
            .map(|(name, _)| name.as_str())
            .collect();

        if failed.is_empty() {
            ReadinessResponse {
                ready: true,
                reason: None,
            }
        } else {
            ReadinessResponse {
                ready: false,
                reason: Some(format!("unhealthy: {}", failed.join(", "))),
            }
        }
    }
}
