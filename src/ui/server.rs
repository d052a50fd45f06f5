//! HTTP server for the local render surface

use axum::{routing::get, Router};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};

use crate::config::UiConfig;
use crate::error::Result;
use crate::inference::DetectionEvent;
use crate::network::UplinkStats;
use crate::pipeline::DownlinkHandle;
use crate::ui::{handlers, websocket};

/// State shared by every request
pub struct AppState {
    downlink: RwLock<Option<DownlinkHandle>>,
    uplink: RwLock<Option<UplinkStats>>,
    events: broadcast::Sender<DetectionEvent>,
    started_at: Instant,
}

impl AppState {
    pub fn new(events: broadcast::Sender<DetectionEvent>) -> Self {
        Self {
            downlink: RwLock::new(None),
            uplink: RwLock::new(None),
            events,
            started_at: Instant::now(),
        }
    }

    /// Point the surface at the current connection
    pub fn set_downlink(&self, handle: DownlinkHandle) {
        *self.downlink.write() = Some(handle);
    }

    pub fn downlink(&self) -> Option<DownlinkHandle> {
        self.downlink.read().clone()
    }

    pub fn set_uplink_stats(&self, stats: Option<UplinkStats>) {
        *self.uplink.write() = stats;
    }

    pub fn uplink_stats(&self) -> Option<UplinkStats> {
        self.uplink.read().clone()
    }

    pub fn subscribe_detections(&self) -> broadcast::Receiver<DetectionEvent> {
        self.events.subscribe()
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

/// Build the router
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/status", get(handlers::get_status))
        .route("/api/devices", get(handlers::get_devices))
        .route("/frame.jpg", get(handlers::get_frame))
        .route("/ws/detections", get(websocket::detections_handler))
        .fallback(handlers::not_found)
        .layer(cors)
        .with_state(state)
}

/// Web server
pub struct WebServer {
    config: UiConfig,
    state: Arc<AppState>,
}

impl WebServer {
    pub fn new(config: UiConfig, state: Arc<AppState>) -> Self {
        Self { config, state }
    }

    /// Serve until the process exits
    pub async fn run(self) -> Result<()> {
        let addr = self.config.socket_addr()?;
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("Web UI listening on http://{}", addr);

        axum::serve(listener, router(self.state)).await?;
        Ok(())
    }

    /// Serve on a background task
    pub fn start_background(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.run().await {
                tracing::error!("Web server error: {}", e);
            }
        })
    }
}
