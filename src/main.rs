//! Gateway service binary
//!
//! Loads the configuration file, starts one worker per configured device
//! against the in-process simulators, and runs until Ctrl-C, then walks the
//! ordered shutdown protocol.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use gatesrv::core::aggregator::DataAggregator;
use gatesrv::core::events::event_channel;
use gatesrv::manager::DeviceManager;
use gatesrv::sim::SimProvider;
use gatesrv::utils::logger::init_logger;
use gatesrv::GatewayConfig;

#[derive(Parser, Debug)]
#[command(name = "gatesrv", about = "Industrial device communication gateway")]
struct Args {
    /// Path to the gateway configuration file
    #[arg(short, long, default_value = "gatesrv.yaml", env = "GATESRV_CONFIG")]
    config: String,

    /// Validate the configuration and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = GatewayConfig::from_file(&args.config)?;
    init_logger(
        &config.service.log_dir,
        &config.service.name,
        &config.service.log_level,
        config.service.console_log,
    )?;

    if args.validate {
        let (events, _rx) = event_channel();
        let mut manager = DeviceManager::new(Arc::new(SimProvider::new()), events);
        for device in config.devices {
            // Registration constructs the driver and runs every structural
            // check without spawning a worker.
            manager.add_device(device)?;
        }
        info!("configuration valid: {} devices", manager.device_ids().len());
        return Ok(());
    }

    info!(
        service = %config.service.name,
        devices = config.devices.len(),
        "starting gateway"
    );

    let (events, event_rx) = event_channel();
    let aggregator = DataAggregator::new();
    let aggregator_task = aggregator.start(event_rx);

    let mut manager = DeviceManager::new(Arc::new(SimProvider::new()), events);
    for device in config.devices {
        let id = device.device_id.clone();
        if let Err(e) = manager.add_device(device) {
            error!(device = %id, "registration failed: {e}");
        }
    }
    manager.start_all()?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to install shutdown signal handler")?;
    info!("shutdown signal received");

    manager.shutdown().await;
    // Workers are gone; dropping the manager releases the last event sender
    // and lets the aggregator task drain out.
    drop(manager);
    let _ = aggregator_task.await;

    info!("gateway stopped");
    Ok(())
}
