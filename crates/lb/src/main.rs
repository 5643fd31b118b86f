// Switchyard load balancer operator binary
//
// Design Decision: Use clap derive with env fallbacks so every flag can come from .env.
// Design Decision: Logs go to stderr; stdout carries only response bodies and reports.

mod commands;
mod config;
mod telemetry;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::commands::place::PlaceArgs;
use crate::commands::watch::WatchArgs;
use crate::config::{LbConfig, PoolKind};
use crate::telemetry::{init_telemetry, TelemetryConfig};

#[derive(Parser)]
#[command(name = "switchyard-lb")]
#[command(about = "Switchyard - place function calls onto a pool of runners")]
#[command(version)]
pub struct Cli {
    /// Runner addresses (overrides RUNNER_ADDRESSES)
    #[arg(long = "runners", global = true, value_delimiter = ',')]
    pub runners: Vec<String>,

    /// Pool implementation: static or consistent_hash (overrides RUNNER_POOL)
    #[arg(long, global = true)]
    pub pool: Option<PoolKind>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Query every runner's status once and print it as JSON
    Status {
        /// Per-runner probe timeout in milliseconds
        #[arg(long, default_value = "2000")]
        timeout_ms: u64,
    },

    /// Place one call; the body is read from --body or stdin
    Place {
        /// Application ID
        #[arg(long)]
        app: String,

        /// Function ID
        #[arg(long)]
        function: String,

        /// Container image
        #[arg(long)]
        image: String,

        /// Routing key (defaults to the call's slot key)
        #[arg(long)]
        slot: Option<String>,

        /// Memory limit in MB
        #[arg(long, default_value = "128")]
        memory: u64,

        /// Execution timeout in seconds
        #[arg(long, default_value = "30")]
        timeout: u32,

        /// Request body file (reads stdin if omitted)
        #[arg(long)]
        body: Option<PathBuf>,

        /// Extension forwarded to the runner, as key=value
        #[arg(long = "ext", value_parser = parse_key_value)]
        extensions: Vec<(String, String)>,
    },

    /// Keep a consistent-hash pool alive and log runner health
    Watch {
        /// File listing runner addresses, re-read periodically
        #[arg(long, env = "RUNNER_MEMBERSHIP_FILE")]
        membership_file: Option<PathBuf>,

        /// Membership file reload interval in milliseconds
        #[arg(long, default_value = "5000")]
        reload_interval_ms: u64,

        /// Health report interval in milliseconds
        #[arg(long, default_value = "10000")]
        report_interval_ms: u64,
    },
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected key=value, got {:?}", raw))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut telemetry_config = TelemetryConfig::from_env();
    if telemetry_config.log_filter.is_none() {
        telemetry_config.log_filter =
            Some("switchyard_lb=info,switchyard_placement=info".to_string());
    }
    // Keep the guard alive for the lifetime of the application
    let _telemetry_guard = init_telemetry(telemetry_config);

    let mut config = LbConfig::from_env().context("Invalid load balancer configuration")?;
    if !cli.runners.is_empty() {
        config.runner_addresses = cli
            .runners
            .iter()
            .flat_map(|raw| crate::config::parse_addresses(raw))
            .collect();
    }
    if let Some(pool) = cli.pool {
        config.pool = pool;
    }

    tracing::debug!(
        runners = config.runner_addresses.len(),
        pool = %config.pool,
        tls = config.tls.is_some(),
        "Configuration loaded"
    );

    match cli.command {
        Commands::Status { timeout_ms } => {
            let factory = commands::build_factory(&config).await?;
            commands::status::run(&config, factory, Duration::from_millis(timeout_ms)).await
        }
        Commands::Place {
            app,
            function,
            image,
            slot,
            memory,
            timeout,
            body,
            extensions,
        } => {
            commands::place::run(
                &config,
                PlaceArgs {
                    app,
                    function,
                    image,
                    slot,
                    memory_mb: memory,
                    timeout_secs: timeout,
                    body,
                    extensions,
                },
            )
            .await
        }
        Commands::Watch {
            membership_file,
            reload_interval_ms,
            report_interval_ms,
        } => {
            commands::watch::run(
                &config,
                WatchArgs {
                    membership_file,
                    reload_interval: Duration::from_millis(reload_interval_ms.max(1)),
                    report_interval: Duration::from_millis(report_interval_ms.max(1)),
                },
            )
            .await
        }
    }
}
