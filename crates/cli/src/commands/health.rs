//! Agent health command

use agent_lib::health::{HealthResponse, ReadinessResponse};
use anyhow::Result;
use colored::Colorize;
use reqwest::StatusCode;
use serde::Serialize;
use tabled::Tabled;

use crate::client::ApiClient;
use crate::output::{color_status, print_json, print_table, OutputFormat};

#[derive(Tabled)]
struct ComponentRow {
    #[tabled(rename = "Component")]
    name: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Message")]
    message: String,
}

#[derive(Serialize)]
struct HealthReport {
    health: HealthResponse,
    readiness: ReadinessResponse,
}

fn health_or_unavailable(status: StatusCode) -> bool {
    status.is_success() || status == StatusCode::SERVICE_UNAVAILABLE
}

/// Show component health and readiness; fails when the agent is unhealthy
pub async fn show_health(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let (_, health): (_, HealthResponse) = client
        .get_with_status("healthz", health_or_unavailable)
        .await?;
    let (_, readiness): (_, ReadinessResponse) = client
        .get_with_status("readyz", health_or_unavailable)
        .await?;

    let operational = health.status.is_operational();
    let report = HealthReport { health, readiness };

    match format {
        OutputFormat::Json => print_json(&report)?,
        OutputFormat::Table => {
            println!(
                "{} {}",
                "Agent:".bold(),
                color_status(report.health.status.as_str())
            );

            let ready = if report.readiness.ready {
                "ready"
            } else {
                "not ready"
            };
            match &report.readiness.reason {
                Some(reason) => {
                    println!("{} {} ({})", "Ready:".bold(), color_status(ready), reason)
                }
                None => println!("{} {}", "Ready:".bold(), color_status(ready)),
            }
            println!();

            let mut rows: Vec<ComponentRow> = report
                .health
                .components
                .iter()
                .map(|(name, c)| ComponentRow {
                    name: name.clone(),
                    status: color_status(c.status.as_str()),
                    message: c.message.clone().unwrap_or_default(),
                })
                .collect();
            rows.sort_by(|a, b| a.name.cmp(&b.name));
            print_table(rows);
        }
    }

    if !operational {
        anyhow::bail!("agent is unhealthy");
    }
    Ok(())
}
