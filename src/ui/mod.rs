//! Local HTTP surface: latest frame, status and detection events

pub mod handlers;
pub mod server;
pub mod websocket;

pub use server::{router, AppState, WebServer};
