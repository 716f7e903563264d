//! Game server host CLI
//!
//! Queries a host agent for server telemetry and health, and checks cron
//! expressions offline before they go into a schedule.

mod client;
mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{cron, health, stats};

/// Game server host CLI
#[derive(Parser)]
#[command(name = "ghctl")]
#[command(author, version, about = "CLI for the game server host agent", long_about = None)]
pub struct Cli {
    /// Agent API URL (can also be set via GHCTL_API_URL env var)
    #[arg(long, env = "GHCTL_API_URL", default_value = "http://localhost:8080")]
    pub api_url: String,

    /// Output format
    #[arg(long, short, global = true, default_value = "table")]
    pub format: output::OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show the latest stats sample for a server
    Stats {
        /// Server ID
        id: String,
    },

    /// Show recent stats samples for a server
    History {
        /// Server ID
        id: String,

        /// Look-back period (e.g. 90s, 30m, 6h, 1d)
        #[arg(long, default_value = "1h")]
        period: String,
    },

    /// Show agent health and readiness
    Health,

    /// Check a cron expression and list its next fire times (offline)
    Cron {
        /// Five-field cron expression, quoted (e.g. "0 4 * * *")
        expr: String,

        /// Number of upcoming fire times to list
        #[arg(long, short = 'n', default_value_t = 5)]
        count: usize,

        /// Evaluate in UTC instead of local time
        #[arg(long)]
        utc: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Only the agent-backed commands need a client
    let connect = || client::ApiClient::new(&cli.api_url);

    match cli.command {
        Commands::Stats { id } => {
            stats::show_stats(&connect()?, &id, cli.format).await?;
        }
        Commands::History { id, period } => {
            stats::show_history(&connect()?, &id, &period, cli.format).await?;
        }
        Commands::Health => {
            health::show_health(&connect()?, cli.format).await?;
        }
        Commands::Cron { expr, count, utc } => {
            cron::explain(&expr, count, utc, cli.format)?;
        }
    }

    Ok(())
}
