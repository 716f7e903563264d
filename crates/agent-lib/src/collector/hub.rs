//! Latest-sample cache and per-target live fan-out
//!
//! Cache and subscriber registry share one lock. Mutations take the write
//! side for the map change only; fan-out runs under the read side because
//! publishing into a conduit never blocks.

use crate::models::MetricSample;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{watch, RwLock};
use tracing::debug;

/// Single-slot receiver of live samples for one target.
///
/// The slot holds at most one unread sample. A newer sample replaces an
/// unread one, so a slow reader always sees the freshest value.
#[derive(Debug)]
pub struct SampleConduit {
    id: u64,
    target_id: String,
    slot: watch::Receiver<Option<MetricSample>>,
}

impl SampleConduit {
    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    /// Wait for the next unread sample. Returns `None` once unsubscribed.
    pub async fn recv(&mut self) -> Option<MetricSample> {
        loop {
            if self.slot.changed().await.is_err() {
                return None;
            }
            if let Some(sample) = self.slot.borrow_and_update().clone() {
                return Some(sample);
            }
        }
    }

    /// Take the unread sample, if any, without waiting
    pub fn try_recv(&mut self) -> Option<MetricSample> {
        match self.slot.has_changed() {
            Ok(true) => self.slot.borrow_and_update().clone(),
            _ => None,
        }
    }
}

struct Subscriber {
    id: u64,
    slot: watch::Sender<Option<MetricSample>>,
}

#[derive(Default)]
struct HubState {
    latest: HashMap<String, MetricSample>,
    subscribers: HashMap<String, Vec<Subscriber>>,
}

/// Shared cache and subscriber registry for one collector
#[derive(Default)]
pub struct SampleHub {
    state: RwLock<HubState>,
    next_id: AtomicU64,
}

impl SampleHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn latest(&self, target_id: &str) -> Option<MetricSample> {
        self.state.read().await.latest.get(target_id).cloned()
    }

    /// Cache `sample` as the target's latest and push it to every conduit.
    /// Returns the number of conduits that received it.
    pub async fn publish(&self, sample: MetricSample) -> usize {
        let target_id = sample.target_id.clone();
        {
            let mut state = self.state.write().await;
            state.latest.insert(target_id.clone(), sample.clone());
        }

        let state = self.state.read().await;
        let Some(subscribers) = state.subscribers.get(&target_id) else {
            return 0;
        };

        let mut delivered = 0;
        for subscriber in subscribers {
            if subscriber.slot.is_closed() {
                continue;
            }
            subscriber.slot.send_replace(Some(sample.clone()));
            delivered += 1;
        }
        delivered
    }

    pub async fn subscribe(&self, target_id: &str) -> SampleConduit {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(None);

        let mut state = self.state.write().await;
        let subscribers = state.subscribers.entry(target_id.to_string()).or_default();
        // conduits dropped without unsubscribing
        subscribers.retain(|s| !s.slot.is_closed());
        subscribers.push(Subscriber { id, slot: tx });

        debug!(target_id = %target_id, conduit = id, "Live subscriber added");

        SampleConduit {
            id,
            target_id: target_id.to_string(),
            slot: rx,
        }
    }

    /// Remove and close `conduit`. Returns false when it was already gone.
    pub async fn unsubscribe(&self, target_id: &str, conduit: &SampleConduit) -> bool {
        let mut state = self.state.write().await;
        let Some(subscribers) = state.subscribers.get_mut(target_id) else {
            return false;
        };

        let before = subscribers.len();
        subscribers.retain(|s| s.id != conduit.id);
        let removed = subscribers.len() != before;

        if subscribers.is_empty() {
            state.subscribers.remove(target_id);
        }
        if removed {
            debug!(target_id = %target_id, conduit = conduit.id, "Live subscriber removed");
        }
        removed
    }

    /// Open conduits across all targets
    pub async fn subscriber_count(&self) -> usize {
        self.state
            .read()
            .await
            .subscribers
            .values()
            .map(|subs| subs.iter().filter(|s| !s.slot.is_closed()).count())
            .sum()
    }
}
