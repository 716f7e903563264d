//! Conversion from runtime stats snapshots to metric samples

use crate::models::{MetricSample, StatsSnapshot};
use chrono::{DateTime, Utc};

/// CPU usage as a percentage of one core, scaled by the number of online CPUs.
///
/// Both deltas are differences between the snapshot's current and previous
/// counters. Returns 0 when either delta is not positive; `online_cpus` of 0
/// counts as 1.
pub fn cpu_percent(cpu_delta: f64, system_delta: f64, online_cpus: u32) -> f64 {
    if cpu_delta <= 0.0 || system_delta <= 0.0 {
        return 0.0;
    }

    let cpus = online_cpus.max(1) as f64;
    (cpu_delta / system_delta) * cpus * 100.0
}

/// Build the sample recorded for `target_id` from one snapshot
pub fn sample_from_snapshot(
    target_id: &str,
    snapshot: &StatsSnapshot,
    recorded_at: DateTime<Utc>,
) -> MetricSample {
    // counters are cumulative u64; subtract as f64 so a counter reset goes negative
    let cpu_delta = snapshot.cpu.total_usage as f64 - snapshot.precpu.total_usage as f64;
    let system_delta = snapshot.cpu.system_usage as f64 - snapshot.precpu.system_usage as f64;

    let (network_rx, network_tx) = snapshot
        .networks
        .values()
        .fold((0u64, 0u64), |(rx, tx), iface| {
            (rx.saturating_add(iface.rx_bytes), tx.saturating_add(iface.tx_bytes))
        });

    MetricSample {
        target_id: target_id.to_string(),
        cpu_percent: cpu_percent(cpu_delta, system_delta, snapshot.online_cpus),
        memory_bytes: snapshot.memory_usage,
        memory_limit: snapshot.memory_limit,
        network_rx,
        network_tx,
        disk_bytes: snapshot.disk_bytes,
        recorded_at,
    }
}
