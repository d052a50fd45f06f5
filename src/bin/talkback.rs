//! Camlink Talk-back
//!
//! Captures the local microphone and streams it to the capture device's
//! speaker until Ctrl+C.

use anyhow::Result;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use camlink::{audio::device::list_devices, config::AppConfig, network::Uplink};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Camlink Talk-back");

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = AppConfig::load_or_default(config_path.as_deref())?;

    // List available input devices
    println!("\n=== Available Input Devices ===");
    for device in list_devices().iter().filter(|d| d.is_input) {
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  {}{}:", device.name, default_marker);
        println!("    Sample rates: {:?}", device.sample_rates);
        println!("    Channels: {:?}", device.channels);
    }
    println!();

    let mut uplink = Uplink::connect(&config).await?;
    uplink.start_capture(&config)?;

    tracing::info!(
        "Streaming microphone at {} Hz to {}. Press Ctrl+C to stop.",
        config.uplink.sample_rate,
        config.network.uplink_addr()
    );

    let mut ticker = tokio::time::interval(Duration::from_secs(5));
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down...");
                break;
            }
            _ = ticker.tick() => {
                let stats = uplink.stats();
                tracing::info!(
                    "Uplink stats: {} blocks ({} samples) sent, {} dropped (backpressure), {:?}",
                    stats.blocks_sent,
                    stats.samples_sent,
                    stats.dropped_backpressure,
                    uplink.state()
                );
                if uplink.state().is_closed() {
                    tracing::warn!("Device closed the talk-back channel");
                    break;
                }
            }
        }
    }

    let reason = uplink.shutdown().await;
    tracing::info!("Talk-back ended: {}", reason);
    Ok(())
}
