//! Server telemetry commands

use agent_lib::models::MetricSample;
use anyhow::Result;
use colored::Colorize;
use tabled::Tabled;

use crate::client::ApiClient;
use crate::output::{
    color_cpu, format_bytes, format_memory, format_timestamp, print_json, print_table,
    print_warning, OutputFormat,
};

/// Row for the history table
#[derive(Tabled)]
struct SampleRow {
    #[tabled(rename = "Recorded")]
    recorded_at: String,
    #[tabled(rename = "CPU")]
    cpu: String,
    #[tabled(rename = "Memory")]
    memory: String,
    #[tabled(rename = "Net RX")]
    network_rx: String,
    #[tabled(rename = "Net TX")]
    network_tx: String,
    #[tabled(rename = "Disk I/O")]
    disk: String,
}

impl From<&MetricSample> for SampleRow {
    fn from(s: &MetricSample) -> Self {
        Self {
            recorded_at: format_timestamp(&s.recorded_at),
            cpu: color_cpu(s.cpu_percent),
            memory: format_memory(s.memory_bytes, s.memory_limit),
            network_rx: format_bytes(s.network_rx),
            network_tx: format_bytes(s.network_tx),
            disk: format_bytes(s.disk_bytes),
        }
    }
}

/// Show the latest sample for a server
pub async fn show_stats(client: &ApiClient, server_id: &str, format: OutputFormat) -> Result<()> {
    let path = format!("api/v1/servers/{}/stats", server_id);
    let sample: MetricSample = client.get(&path).await?;

    match format {
        OutputFormat::Json => print_json(&sample)?,
        OutputFormat::Table => {
            println!("{}", "Server Stats".bold());
            println!("{}", "=".repeat(40));
            println!("Server:   {}", sample.target_id.cyan());
            println!("Recorded: {}", format_timestamp(&sample.recorded_at));
            println!();
            println!("CPU:      {}", color_cpu(sample.cpu_percent));
            println!(
                "Memory:   {}",
                format_memory(sample.memory_bytes, sample.memory_limit)
            );
            println!(
                "Network:  {} rx, {} tx",
                format_bytes(sample.network_rx),
                format_bytes(sample.network_tx)
            );
            println!("Disk I/O: {}", format_bytes(sample.disk_bytes));
        }
    }

    Ok(())
}

/// Show samples recorded within `period` (e.g. 30m, 6h, 1d)
pub async fn show_history(
    client: &ApiClient,
    server_id: &str,
    period: &str,
    format: OutputFormat,
) -> Result<()> {
    let path = format!("api/v1/servers/{}/stats/history?period={}", server_id, period);
    let samples: Vec<MetricSample> = client.get(&path).await?;

    match format {
        OutputFormat::Json => print_json(&samples)?,
        OutputFormat::Table => {
            if samples.is_empty() {
                print_warning(&format!("No samples for {} in the last {}", server_id, period));
                return Ok(());
            }

            println!(
                "{} {} ({})",
                "Stats history for".bold(),
                server_id.cyan(),
                period
            );
            print_table(samples.iter().map(SampleRow::from).collect());

            let peak = samples
                .iter()
                .map(|s| s.cpu_percent)
                .fold(0.0_f64, f64::max);
            println!("\nTotal: {} samples, peak CPU {}", samples.len(), color_cpu(peak));
        }
    }

    Ok(())
}
