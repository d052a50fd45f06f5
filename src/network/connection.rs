//! Per-connection lifecycle
//!
//! Each media direction owns one state machine. Transitions are driven by
//! discrete events from the transport and the pipeline; `Closed` is terminal
//! and a reconnect starts a fresh machine.

use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Why a connection ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum CloseReason {
    /// Torn down by this side
    Local,
    /// Peer closed the stream
    RemoteClosed,
    /// Peer violated the wire format
    Protocol(String),
    /// Transport reported an error
    Transport(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Local => write!(f, "closed locally"),
            CloseReason::RemoteClosed => write!(f, "closed by peer"),
            CloseReason::Protocol(detail) => write!(f, "protocol error: {}", detail),
            CloseReason::Transport(detail) => write!(f, "transport error: {}", detail),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Streaming,
    Closing,
    Closed(CloseReason),
}

impl ConnectionState {
    pub fn is_streaming(&self) -> bool {
        matches!(self, ConnectionState::Streaming)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, ConnectionState::Closed(_))
    }
}

/// Inputs to the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Connection attempt started
    Connect,
    /// Channel is open and media may flow
    Opened,
    /// Peer sent something unrecoverable
    ProtocolViolation(String),
    /// Local teardown requested
    Shutdown,
    /// Peer closed the channel
    TransportClosed,
    /// Channel failed
    TransportError(String),
}

impl ConnectionState {
    /// Next state for `event`, or `None` if the event is not valid here
    pub fn next(&self, event: &ConnectionEvent) -> Option<ConnectionState> {
        use ConnectionEvent as E;
        use ConnectionState as S;

        match (self, event) {
            (S::Closed(_), _) => None,

            (S::Idle, E::Connect) => Some(S::Connecting),
            (S::Connecting, E::Opened) => Some(S::Streaming),

            (S::Idle | S::Connecting | S::Streaming, E::ProtocolViolation(_) | E::Shutdown) => {
                Some(S::Closing)
            }

            (S::Connecting | S::Streaming | S::Closing, E::TransportClosed) => {
                Some(S::Closed(CloseReason::RemoteClosed))
            }
            (S::Idle | S::Connecting | S::Streaming | S::Closing, E::TransportError(detail)) => {
                Some(S::Closed(CloseReason::Transport(detail.clone())))
            }

            _ => None,
        }
    }
}

/// Shared handle to one connection's state
#[derive(Debug, Clone)]
pub struct ConnectionCell {
    inner: Arc<Mutex<ConnectionState>>,
    label: &'static str,
}

impl ConnectionCell {
    pub fn new(label: &'static str) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ConnectionState::Idle)),
            label,
        }
    }

    pub fn get(&self) -> ConnectionState {
        self.inner.lock().clone()
    }

    pub fn is_streaming(&self) -> bool {
        self.inner.lock().is_streaming()
    }

    /// Apply an event. Invalid transitions are logged and leave the state
    /// unchanged; returns whether the state changed.
    pub fn apply(&self, event: ConnectionEvent) -> bool {
        let mut state = self.inner.lock();
        match state.next(&event) {
            Some(next) => {
                tracing::debug!("{} connection: {:?} -> {:?}", self.label, *state, next);
                *state = next;
                true
            }
            None => {
                tracing::debug!("{} connection: ignoring {:?} in {:?}", self.label, event, *state);
                false
            }
        }
    }

    /// Terminal transition from `Closing` (or any live state) to `Closed`
    pub fn finish(&self, reason: CloseReason) {
        let mut state = self.inner.lock();
        if state.is_closed() {
            return;
        }
        tracing::info!("{} connection {}", self.label, reason);
        *state = ConnectionState::Closed(reason);
    }
}
