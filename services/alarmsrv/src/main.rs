//! Alarm Service (alarmsrv)
//!
//! Polls fire panels, keeps the alarm table current and notifies recipients.

use std::sync::Arc;

use alarmsrv::config::{AppConfig, DEFAULT_CONFIG_PATH};
use alarmsrv::poller::connectivity::{check_all_sites, DEFAULT_PROBE_TIMEOUT};
use alarmsrv::service::{build_sink, probe_targets, AlarmPipeline};
use anyhow::{anyhow, Context, Result};
use clap::Parser;
use common::sqlite::{ensure_schema, SqliteStore};
use common::DataStore;
use tracing::info;

/// Service startup arguments
#[derive(Debug, Clone, Parser)]
#[clap(author, version, about)]
struct Args {
    /// Configuration file (YAML)
    #[clap(short, long, env = "IGNIS_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Console log level, overrides the configured one
    #[clap(short = 'l', long)]
    log_level: Option<String>,

    /// Probe every configured site, print the report and exit
    #[clap(long)]
    check: bool,

    /// Print the effective configuration as YAML and exit
    #[clap(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = AppConfig::load(&args.config)
        .with_context(|| format!("Failed to load configuration from {}", args.config))?;
    if args.print_config {
        print!("{}", serde_yaml::to_string(&config)?);
        return Ok(());
    }
    if let Some(level) = &args.log_level {
        config.service.log.console_level = level.clone();
    }
    common::logging::init_with_config(&config.service.log)
        .map_err(|e| anyhow!("Failed to initialize logging: {e}"))?;
    info!("Starting {} ({})", config.service.name, args.config);

    let store = Arc::new(
        SqliteStore::connect(&config.database.url, config.database.max_connections)
            .await
            .context("Failed to open database")?,
    );
    if config.database.ensure_schema {
        ensure_schema(store.as_ref())
            .await
            .context("Failed to ensure schema")?;
    }

    if args.check {
        let targets = probe_targets(&config, store.as_ref()).await?;
        let report = check_all_sites(&targets, DEFAULT_PROBE_TIMEOUT).await;
        println!("{}", serde_json::to_string_pretty(&report)?);
        store.close().await;
        return Ok(());
    }

    let sink = build_sink(&config.events)
        .await
        .context("Failed to build event sink")?;
    let pipeline = AlarmPipeline::start(&config, Arc::clone(&store) as Arc<dyn DataStore>, sink)
        .await
        .context("Failed to start pipeline")?;

    let signal = common::shutdown::wait_for_shutdown().await;
    info!("{} received, stopping", signal);

    pipeline.shutdown().await;
    store.close().await;
    info!("{} stopped", config.service.name);
    Ok(())
}
