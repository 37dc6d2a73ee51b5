// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the solar-gateway project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

// Main entry point for the solar inverter field gateway

use anyhow::Result;
use clap::Parser;
use log::info;

use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::RwLock;

use solar_gateway::config::Config;
use solar_gateway::daemon::launch_daemon::Daemon;

/// Field gateway polling a simulated solar inverter and uploading
/// compressed, authenticated sample windows to the cloud
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file (YAML format)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Device identifier override
    #[arg(long)]
    device_id: Option<String>,

    /// Inverter simulator base URL override
    #[arg(long)]
    inverter_url: Option<String>,

    /// Cloud collector base URL override
    #[arg(long)]
    cloud_url: Option<String>,

    /// Upload window length in seconds
    #[arg(long)]
    upload_interval: Option<u64>,

    /// Sampling period in milliseconds
    #[arg(long)]
    sample_period: Option<u32>,

    /// HMAC pre-shared key override
    #[arg(long)]
    psk: Option<String>,

    /// Disable the security envelope (development mode)
    #[arg(long, default_value_t = false)]
    no_envelope: bool,

    /// Enable verbose logging (debug level)
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Disable all logging output
    #[arg(short = 'q', long = "quiet")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.quiet {
        log::LevelFilter::Off
    } else if args.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    // Load configuration
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from("config.yaml"));
    let mut config = Config::from_file(&config_path)?;

    // Apply command line overrides
    config.apply_args(
        args.device_id.clone(),
        args.inverter_url.clone(),
        args.cloud_url.clone(),
        args.upload_interval,
        args.sample_period,
        args.psk.clone(),
        args.no_envelope,
    );
    config.validate()?;

    info!("starting in daemon mode");
    let mut daemon = Daemon::new();

    // Shared configuration for all daemon components
    let config_arc = Arc::new(RwLock::new(config));
    daemon.launch(config_arc).await?;

    // Wait for termination signal
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("received shutdown signal, terminating daemon");
            daemon.shutdown();
            daemon.join().await?;
        }
        Err(err) => {
            eprintln!("error waiting for shutdown signal: {err}");
        }
    }

    Ok(())
}
