//! btrelay - Main entry point
//!
//! Runs the relay daemon against the in-process simulated backend: a
//! synthesized capture source, a simulated transport with one sink that
//! connects shortly after startup, and simulated volume and power
//! services. Platform deployments swap the simulated services for real
//! driver shims through [`btrelay::RelayDeps`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use btrelay::services::sim::{SimCapture, SimPower, SimSystemAudio, SimTransport};
use btrelay::services::{capture, power, transport};
use btrelay::{DeviceAddress, RelayConfig, RelayDaemon, RelayDeps};
use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for btrelay
#[derive(Parser, Debug)]
#[command(name = "btrelay")]
#[command(about = "Bluetooth audio relay daemon")]
#[command(version)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "BTRELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Override the preference record path
    #[arg(short, long, env = "BTRELAY_PREFS")]
    prefs: Option<PathBuf>,

    /// Simulated sink address
    #[arg(long, default_value = "aa:bb:cc:dd:ee:ff")]
    sink: DeviceAddress,

    /// Simulated capture tone frequency (Hz)
    #[arg(long, default_value = "440.0")]
    tone: f64,

    /// Simulated system volume level (0-15)
    #[arg(long, default_value = "10")]
    volume_level: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "btrelay=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let mut config = RelayConfig::load(args.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(prefs) = args.prefs {
        config.prefs_path = prefs;
    }

    info!("preference record: {}", config.prefs_path.display());

    let transport_ctl = SimTransport::new();
    let power_ctl = SimPower::new();
    let deps = RelayDeps {
        transport: transport::shared(transport_ctl.clone()),
        capture: capture::shared(SimCapture::paced(args.tone)),
        sysaudio: Arc::new(SimSystemAudio::new(args.volume_level)),
        power: power::shared(power_ctl),
    };

    let daemon = RelayDaemon::start(deps, config)
        .await
        .context("Failed to start relay daemon")?;

    // Let the simulated sink show up the way a real headset would.
    let sink = args.sink;
    let sim = transport_ctl.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        info!("simulated sink {sink} connecting");
        sim.set_connected(vec![sink]);
    });

    // Periodic relay statistics until shutdown
    let stats = transport_ctl.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(10));
        tick.tick().await;
        loop {
            tick.tick().await;
            info!(
                "relayed {} blocks ({} bytes)",
                stats.sent_block_count(),
                stats.bytes_sent()
            );
        }
    });

    shutdown_signal().await;
    daemon.shutdown().await;

    info!("shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
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
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
