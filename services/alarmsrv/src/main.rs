//! AlarmSrv main program

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use alarmsrv::{AlarmService, AlarmsrvConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "AlarmSrv - realtime alarm service")]
struct Args {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "ALARMSRV_CONFIG")]
    config: Option<PathBuf>,

    /// Rule file, overrides `rules_file` from the configuration
    #[arg(short, long, value_name = "FILE")]
    rules: Option<PathBuf>,

    /// Log filter when RUST_LOG is unset (e.g. "debug", "info,scada_alarm=trace")
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = AlarmsrvConfig::load(args.config.as_deref())?;
    if let Some(rules) = args.rules {
        config.rules_file = rules;
    }
    if args.log_level.is_some() {
        config.service.log_level = args.log_level;
    }

    let log_dir = common::logging::init_log_root(config.service.log_dir.as_deref());
    common::logging::init_with_config(common::logging::LogConfig {
        service_name: config.service.name.clone(),
        log_dir,
        level: config.service.log_level.clone(),
        enable_json: config.service.log_json,
        enable_file: true,
    })?;

    info!("Starting AlarmSrv v{}", env!("CARGO_PKG_VERSION"));

    let service = AlarmService::build(config).await?;
    service.start().await?;

    let signal = common::wait_for_shutdown().await;
    info!("{} received, shutting down", signal);

    service.shutdown().await
}
