//! Camlink Viewer
//!
//! Receives video and audio from the capture device, plays the audio,
//! serves the latest frame and detection events locally, and optionally
//! talks back through the microphone.

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use camlink::{
    audio::{device::list_devices, AudioPlayback},
    config::AppConfig,
    inference,
    network::{run_downlink, Uplink},
    pipeline::DownlinkParts,
    ui::{AppState, WebServer},
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Camlink Viewer");

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = AppConfig::load_or_default(config_path.as_deref())?;

    // List available output devices
    println!("\n=== Available Output Devices ===");
    for device in list_devices().iter().filter(|d| d.is_output) {
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  {}{}:", device.name, default_marker);
        println!("    Sample rates: {:?}", device.sample_rates);
        println!("    Channels: {:?}", device.channels);
    }
    println!();

    let events = inference::event_channel();
    let state = Arc::new(AppState::new(events.clone()));

    if config.ui.enabled {
        let _web_handle = WebServer::new(config.ui.clone(), state.clone()).start_background();
        tracing::info!(
            "Frames at http://{}:{}/frame.jpg",
            config.ui.bind_address,
            config.ui.http_port
        );
    }

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutting down...");
            let _ = shutdown_tx.send(true);
        }
    });

    let mut uplink = None;
    if config.uplink.enabled {
        match Uplink::connect(&config).await {
            Ok(mut session) => {
                if let Err(e) = session.start_capture(&config) {
                    tracing::warn!("Talk-back capture unavailable: {}", e);
                }
                uplink = Some(session);
            }
            Err(e) => tracing::warn!("Talk-back disabled: {}", e),
        }
    }

    // Periodic stats
    let stats_state = state.clone();
    let uplink_encoder = uplink.as_ref().and_then(|u: &Uplink| u.encoder().cloned());
    let stats_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(5));
        ticker.tick().await;
        loop {
            ticker.tick().await;

            if let Some(encoder) = &uplink_encoder {
                let uplink_stats = encoder.stats();
                tracing::info!(
                    "Uplink stats: {} blocks sent, {} dropped (backpressure), {} dropped (not streaming)",
                    uplink_stats.blocks_sent,
                    uplink_stats.dropped_backpressure,
                    uplink_stats.dropped_not_streaming
                );
                stats_state.set_uplink_stats(Some(uplink_stats));
            }

            let Some(downlink) = stats_state.downlink() else {
                continue;
            };
            let status = downlink.status();
            tracing::info!(
                "Downlink {} {:?}: {} packets, {} bytes, {} pending",
                status.id,
                status.state,
                status.demux.units,
                status.demux.bytes,
                status.demux.pending
            );
            if let Some(audio) = &status.audio {
                tracing::info!(
                    "Audio: {} ms buffered ({:.0}% full), {} underruns, {} overrun samples",
                    audio.buffered as u64 * 1000 / audio.sample_rate as u64,
                    audio.fill_level() * 100.0,
                    audio.underruns,
                    audio.overrun_samples
                );
            }
            tracing::info!(
                "Video: {} decoded, {} skipped, {} decode errors",
                status.video.decoded,
                status.video.skipped,
                status.video.decode_errors
            );
            if let Some(inference) = &status.inference {
                tracing::info!(
                    "Inference: {} dispatched, {} throttled, {} detections, {} failures",
                    inference.dispatched,
                    inference.throttled,
                    inference.detections,
                    inference.failures
                );
            }
        }
    });

    let reconnect_delay = Duration::from_millis(config.network.reconnect_delay_ms);
    loop {
        let parts = DownlinkParts::from_config(&config, events.clone())?;
        let ui_state = state.clone();
        let audio_config = config.audio.clone();

        let reason = run_downlink(&config, parts, shutdown_rx.clone(), move |downlink| {
            ui_state.set_downlink(downlink.handle());

            let Some(jitter) = downlink.jitter() else {
                return;
            };
            let mut playback = AudioPlayback::new(audio_config.output_device, audio_config.output_block, jitter);
            match playback.start() {
                Ok(()) => downlink.attach_output(playback),
                Err(e) => tracing::warn!("Audio output unavailable, video only: {}", e),
            }
        })
        .await;

        tracing::info!("Downlink ended: {}", reason);
        if *shutdown_rx.borrow() {
            break;
        }

        tokio::select! {
            _ = tokio::time::sleep(reconnect_delay) => {}
            _ = shutdown_rx.changed() => break,
        }
    }

    // Release the encoder clone before the uplink drains its queue
    stats_task.abort();
    let _ = stats_task.await;

    if let Some(session) = uplink {
        let reason = session.shutdown().await;
        tracing::info!("Talk-back ended: {}", reason);
    }

    Ok(())
}
