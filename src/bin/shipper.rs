//! Flotilla Shipper Binary
//!
//! Background service that ships local TSDB blocks to the remote bucket.

use flotilla::config::ComponentFactory;
use flotilla::labels::LabelSet;
use flotilla::shipper::{Shipper, ShipperConfig};
use flotilla::telemetry;

use clap::Parser;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};

/// Flotilla Shipper
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Local TSDB data directory to watch for blocks
    #[arg(long, env = "FLOTILLA_DATA_DIR", default_value = "./data")]
    data_dir: String,

    /// Seconds between sync passes
    #[arg(long, default_value = "30")]
    sync_interval_secs: u64,

    /// Also upload compacted blocks already present on disk
    #[arg(long)]
    upload_compacted: bool,

    /// Tolerate per-block upload failures instead of aborting a pass
    #[arg(long)]
    allow_out_of_order_uploads: bool,

    /// Skip unreadable blocks instead of aborting a pass
    #[arg(long)]
    skip_corrupted_blocks: bool,

    /// External labels attached to uploaded blocks, as name=value pairs
    #[arg(long = "label", value_parser = parse_label)]
    labels: Vec<(String, String)>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn parse_label(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .ok_or_else(|| format!("label must be name=value, got {s:?}"))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    telemetry::init_tracing(&args.log_level)?;

    info!("Starting Flotilla Shipper");

    let bucket = ComponentFactory::create_bucket()?;
    let labels: LabelSet = args.labels.iter().cloned().collect();

    let config = ShipperConfig {
        upload_compacted: args.upload_compacted,
        allow_out_of_order_uploads: args.allow_out_of_order_uploads,
        skip_corrupted_blocks: args.skip_corrupted_blocks,
        ..Default::default()
    };
    let shipper = Shipper::new(bucket, args.data_dir.as_str(), labels, config);

    info!(
        data_dir = %args.data_dir,
        sync_interval_secs = args.sync_interval_secs,
        upload_compacted = args.upload_compacted,
        "Shipper ready"
    );

    let mut interval = tokio::time::interval(Duration::from_secs(args.sync_interval_secs));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                match shipper.sync().await {
                    Ok(uploaded) if uploaded > 0 => info!(uploaded, "sync pass finished"),
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "sync pass failed"),
                }
            }
            _ = shutdown_signal() => break,
        }
    }

    info!("Shipper shutting down");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
