//! Reccaster demo announcer
//!
//! Reads a record manifest and announces it to one or more receivers until
//! interrupted.
//!
//! # Usage
//!
//! ```bash
//! # Announce to a single receiver
//! reccaster --manifest records.json --receiver 127.0.0.1:5049
//!
//! # Receivers and tuning from a config file
//! reccaster --config announcer.json --manifest records.json
//! ```
//!
//! The manifest is JSON:
//!
//! ```json
//! {
//!   "records": [{ "name": "DEV:RECCASTER:RUST", "type": "ai", "properties": { "recordDesc": "Rust Reccaster" } }],
//!   "properties": { "HOSTNAME": "Example-Host-Machine" }
//! }
//! ```

use std::path::{Path, PathBuf};

use clap::Parser;
use serde::Deserialize;
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use reccaster::{
    AnnounceEvent, Announcer, AnnouncerConfig, AnnouncementState, GlobalProperties, Record,
    RecsyncError, TargetId,
};

/// Reccaster - announce records to recsync receivers
#[derive(Parser, Debug)]
#[command(name = "reccaster")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (JSON format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Record manifest (JSON format)
    #[arg(short, long)]
    manifest: PathBuf,

    /// Receiver as host:port; may be repeated, replaces the configured list
    #[arg(short, long = "receiver")]
    receivers: Vec<String>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Debug, Default, Deserialize)]
struct Manifest {
    #[serde(default)]
    records: Vec<Record>,
    #[serde(default)]
    properties: GlobalProperties,
}

impl Manifest {
    fn from_file(path: &Path) -> Result<Self, RecsyncError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| RecsyncError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        serde_json::from_str(&content)
            .map_err(|e| RecsyncError::Config(format!("cannot parse {}: {}", path.display(), e)))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    let mut config = match &args.config {
        Some(path) => {
            info!("Loading config from {:?}", path);
            AnnouncerConfig::from_file(path)?
        }
        None => AnnouncerConfig::default(),
    };
    if !args.receivers.is_empty() {
        config.receivers = args.receivers;
    }

    let manifest = Manifest::from_file(&args.manifest)?;
    info!(
        records = manifest.records.len(),
        properties = manifest.properties.len(),
        receivers = ?config.receivers,
        "Starting reccaster v{}",
        env!("CARGO_PKG_VERSION")
    );

    let announcer = Announcer::setup(manifest.records, manifest.properties, config).await?;
    let targets: Vec<_> = announcer.targets().map(|t| t.address).collect();
    let mut events = announcer.subscribe();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutdown signal received, stopping announcer...");
        let _ = shutdown_tx.send(true);
    });

    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(AnnounceEvent::Acknowledged { target, records, .. }) => {
                    info!(%target, records = records.len(), "Records acknowledged");
                }
                Ok(AnnounceEvent::Failed { error }) => warn!(error = %error, "Announcement failed"),
                Ok(AnnounceEvent::Sent { .. }) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event listener lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let registry = announcer.run(shutdown_rx).await;

    for (index, address) in targets.iter().enumerate() {
        let acked = registry
            .records()
            .filter(|(id, _)| registry.state(TargetId(index), *id) == Some(AnnouncementState::Acked))
            .count();
        info!(%address, acked, total = registry.len(), "Final delivery state");
    }

    info!("Reccaster stopped");
    Ok(())
}
