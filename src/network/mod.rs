//! Network subsystem: TCP transport, demultiplexing and connection state

pub mod connection;
pub mod demux;
pub mod transport;
pub mod uplink;

pub use connection::{CloseReason, ConnectionCell, ConnectionEvent, ConnectionState};
pub use demux::{ChannelDemuxer, ChannelEvent, DemuxStats, MediaKind, StreamDemuxer};
pub use transport::{connect, negotiate_sample_rate, run_downlink};
pub use uplink::{SendOutcome, Uplink, UplinkEncoder, UplinkStats};
