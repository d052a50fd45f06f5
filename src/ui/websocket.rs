//! Detection event stream over WebSocket
//!
//! Each connected client receives every detection as one JSON text message.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::inference::DetectionEvent;
use crate::ui::server::AppState;

pub async fn detections_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    let rx = state.subscribe_detections();
    ws.on_upgrade(move |socket| forward_detections(socket, rx))
}

async fn forward_detections(socket: WebSocket, mut rx: broadcast::Receiver<DetectionEvent>) {
    let (mut sender, mut receiver) = socket.split();
    tracing::debug!("Detection listener connected");

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(event) => {
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            tracing::warn!("Failed to serialize detection: {}", e);
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!("WebSocket client lagged, {} detection(s) missed", missed);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    tracing::debug!("Detection listener disconnected");
}
