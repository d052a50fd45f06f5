//! HTTP API handlers

use axum::{
    extract::State,
    http::{header, StatusCode, Uri},
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;

use crate::audio::device::{list_devices, AudioDeviceInfo};
use crate::network::UplinkStats;
use crate::pipeline::DownlinkStatus;
use crate::ui::server::AppState;

/// API response wrapper
#[derive(serde::Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// System status
#[derive(serde::Serialize)]
pub struct SystemStatus {
    pub uptime_seconds: u64,
    /// `null` until the first connection attempt
    pub downlink: Option<DownlinkStatus>,
    pub uplink: Option<UplinkStats>,
}

/// Get connection state and pipeline statistics
pub async fn get_status(State(state): State<Arc<AppState>>) -> Json<ApiResponse<SystemStatus>> {
    let status = SystemStatus {
        uptime_seconds: state.uptime_seconds(),
        downlink: state.downlink().map(|d| d.status()),
        uplink: state.uplink_stats(),
    };

    Json(ApiResponse::ok(status))
}

/// Get available audio devices
pub async fn get_devices() -> Json<ApiResponse<Vec<AudioDeviceInfo>>> {
    let devices = list_devices();
    Json(ApiResponse::ok(devices))
}

/// Latest frame exactly as received; 204 before the first frame
pub async fn get_frame(State(state): State<Arc<AppState>>) -> Response {
    match state.downlink().and_then(|d| d.current_video_frame()) {
        Some(frame) => (
            [
                (header::CONTENT_TYPE, "image/jpeg"),
                (header::CACHE_CONTROL, "no-store"),
            ],
            frame.encoded.clone(),
        )
            .into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

/// JSON 404 for unknown routes
pub async fn not_found(uri: Uri) -> (StatusCode, Json<ApiResponse<()>>) {
    (
        StatusCode::NOT_FOUND,
        Json(ApiResponse::error(format!("No route for {}", uri.path()))),
    )
}
