//! TCP transport
//!
//! Opens the device connections, reads chunks into a [`Downlink`] and
//! drives the connection state machine from what the socket reports.
//! Timeouts live here; the pipeline only reacts to close and error.

use bytes::{Bytes, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::config::{AppConfig, NetworkConfig, ProtocolProfile};
use crate::error::{Error, NetworkError};
use crate::network::connection::{CloseReason, ConnectionCell, ConnectionEvent};
use crate::network::demux::{ChannelDemuxer, MediaKind};
use crate::pipeline::{Downlink, DownlinkParts};

/// Connect with the configured timeout and socket options
pub async fn connect(addr: &str, config: &NetworkConfig) -> Result<TcpStream, NetworkError> {
    let timeout = Duration::from_millis(config.connect_timeout_ms);
    let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            return Err(NetworkError::ConnectionFailed {
                addr: addr.to_string(),
                reason: e.to_string(),
            })
        }
        Err(_) => return Err(NetworkError::Timeout(addr.to_string())),
    };

    tune_socket(&stream, config);
    tracing::debug!("Connected to {}", addr);
    Ok(stream)
}

fn tune_socket(stream: &TcpStream, config: &NetworkConfig) {
    if let Err(e) = stream.set_nodelay(config.tcp_nodelay) {
        tracing::warn!("Failed to set TCP_NODELAY: {}", e);
    }
    if let Some(size) = config.recv_buffer_size {
        let socket = socket2::SockRef::from(stream);
        if let Err(e) = socket.set_recv_buffer_size(size) {
            tracing::warn!("Failed to set receive buffer to {} bytes: {}", size, e);
        }
    }
}

/// Resolves once shutdown is requested or the requester is gone
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Read the split audio channel up to the end of its sample-rate preamble.
///
/// Returns the announced rate and any bytes read past the preamble, which
/// belong to the steady-state stream.
pub async fn negotiate_sample_rate<S>(
    stream: &mut S,
    config: &NetworkConfig,
) -> Result<(u32, BytesMut), Error>
where
    S: AsyncRead + Unpin,
{
    let mut demux = ChannelDemuxer::new(MediaKind::Audio, config.max_payload_size, true);
    let mut buf = vec![0u8; config.read_chunk_size];
    let timeout = Duration::from_millis(config.connect_timeout_ms);

    let negotiate = async {
        loop {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                return Err(Error::Network(NetworkError::ClosedEarly("sample rate preamble")));
            }
            if let Some(rate) = demux.push_preamble(&buf[..n])? {
                return Ok(rate);
            }
        }
    };

    let rate = tokio::time::timeout(timeout, negotiate)
        .await
        .map_err(|_| NetworkError::Timeout("sample rate preamble".to_string()))??;

    tracing::info!("Device announced {} Hz audio", rate);
    Ok((rate, demux.into_pending()))
}

/// Feed a multiplexed stream into `downlink` until it ends
pub async fn pump_multiplexed<S>(
    downlink: &mut Downlink,
    stream: &mut S,
    chunk_size: usize,
    shutdown: &mut watch::Receiver<bool>,
) -> CloseReason
where
    S: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; chunk_size];
    loop {
        tokio::select! {
            read = stream.read(&mut buf) => match read {
                Ok(0) => return CloseReason::RemoteClosed,
                Ok(n) => {
                    if let Err(e) = downlink.submit_chunk(&buf[..n]) {
                        return CloseReason::Protocol(e.to_string());
                    }
                }
                Err(e) => return CloseReason::Transport(e.to_string()),
            },
            _ = shutdown_requested(shutdown) => return CloseReason::Local,
        }
    }
}

/// Feed the two split-profile channels into `downlink` until either ends
pub async fn pump_split<V, A>(
    downlink: &mut Downlink,
    video: &mut V,
    audio: &mut A,
    chunk_size: usize,
    shutdown: &mut watch::Receiver<bool>,
) -> CloseReason
where
    V: AsyncRead + Unpin,
    A: AsyncRead + Unpin,
{
    let mut video_buf = vec![0u8; chunk_size];
    let mut audio_buf = vec![0u8; chunk_size];
    loop {
        tokio::select! {
            read = video.read(&mut video_buf) => match read {
                Ok(0) => return CloseReason::RemoteClosed,
                Ok(n) => {
                    if let Err(e) = downlink.submit_video_chunk(&video_buf[..n]) {
                        return CloseReason::Protocol(e.to_string());
                    }
                }
                Err(e) => return CloseReason::Transport(e.to_string()),
            },
            read = audio.read(&mut audio_buf) => match read {
                Ok(0) => return CloseReason::RemoteClosed,
                Ok(n) => {
                    if let Err(e) = downlink.submit_audio_chunk(&audio_buf[..n]) {
                        return CloseReason::Protocol(e.to_string());
                    }
                }
                Err(e) => return CloseReason::Transport(e.to_string()),
            },
            _ = shutdown_requested(shutdown) => return CloseReason::Local,
        }
    }
}

/// Tear the downlink down and close its sockets, in that order
async fn close_downlink(downlink: &mut Downlink, reason: CloseReason, streams: &mut [&mut TcpStream]) -> CloseReason {
    match &reason {
        CloseReason::RemoteClosed => {
            downlink.connection().apply(ConnectionEvent::TransportClosed);
        }
        CloseReason::Transport(detail) => {
            downlink
                .connection()
                .apply(ConnectionEvent::TransportError(detail.clone()));
        }
        CloseReason::Local | CloseReason::Protocol(_) => {}
    }

    downlink.teardown();
    for stream in streams.iter_mut() {
        let _ = stream.shutdown().await;
    }
    downlink.finish(reason.clone());
    reason
}

fn connect_failed(state: &ConnectionCell, error: impl std::fmt::Display) -> CloseReason {
    tracing::error!("Downlink failed to start: {}", error);
    let reason = CloseReason::Transport(error.to_string());
    state.apply(ConnectionEvent::TransportError(error.to_string()));
    reason
}

/// Run one downlink connection from connect to `Closed`.
///
/// `on_open` runs once the pipeline exists and the connection is
/// streaming; it is where audio output gets attached.
pub async fn run_downlink<F>(
    config: &AppConfig,
    parts: DownlinkParts,
    mut shutdown: watch::Receiver<bool>,
    on_open: F,
) -> CloseReason
where
    F: FnOnce(&mut Downlink),
{
    let state = ConnectionCell::new("downlink");
    state.apply(ConnectionEvent::Connect);
    let net = &config.network;

    match net.profile {
        ProtocolProfile::Multiplexed => {
            let addr = net.media_addr();
            let mut stream = match connect(&addr, net).await {
                Ok(stream) => stream,
                Err(e) => return connect_failed(&state, e),
            };
            let mut downlink = match Downlink::new(config, config.audio.sample_rate, state.clone(), parts) {
                Ok(downlink) => downlink,
                Err(e) => return connect_failed(&state, e),
            };

            state.apply(ConnectionEvent::Opened);
            tracing::info!("Downlink {} streaming from {}", downlink.id(), addr);
            on_open(&mut downlink);

            let span = tracing::info_span!("downlink", id = %downlink.id());
            async {
                let reason =
                    pump_multiplexed(&mut downlink, &mut stream, net.read_chunk_size, &mut shutdown).await;
                close_downlink(&mut downlink, reason, &mut [&mut stream]).await
            }
            .instrument(span)
            .await
        }
        ProtocolProfile::SplitChannels => {
            let mut video = match connect(&net.video_addr(), net).await {
                Ok(stream) => stream,
                Err(e) => return connect_failed(&state, e),
            };
            let mut audio = match connect(&net.audio_addr(), net).await {
                Ok(stream) => stream,
                Err(e) => return connect_failed(&state, e),
            };

            let (sample_rate, leftover) = if net.sample_rate_preamble {
                match negotiate_sample_rate(&mut audio, net).await {
                    Ok(negotiated) => negotiated,
                    Err(Error::Protocol(e)) => {
                        tracing::error!("Invalid sample rate preamble: {}", e);
                        state.apply(ConnectionEvent::ProtocolViolation(e.to_string()));
                        let _ = video.shutdown().await;
                        let _ = audio.shutdown().await;
                        let reason = CloseReason::Protocol(e.to_string());
                        state.finish(reason.clone());
                        return reason;
                    }
                    Err(e) => return connect_failed(&state, e),
                }
            } else {
                (config.audio.sample_rate, BytesMut::new())
            };

            let mut downlink = match Downlink::new(config, sample_rate, state.clone(), parts) {
                Ok(downlink) => downlink,
                Err(e) => return connect_failed(&state, e),
            };

            state.apply(ConnectionEvent::Opened);
            tracing::info!(
                "Downlink {} streaming from {} (video) and {} (audio)",
                downlink.id(),
                net.video_addr(),
                net.audio_addr()
            );
            on_open(&mut downlink);

            let span = tracing::info_span!("downlink", id = %downlink.id());
            async {
                if !leftover.is_empty() {
                    if let Err(e) = downlink.submit_audio_chunk(&leftover) {
                        let reason = CloseReason::Protocol(e.to_string());
                        return close_downlink(&mut downlink, reason, &mut [&mut video, &mut audio]).await;
                    }
                }
                let reason =
                    pump_split(&mut downlink, &mut video, &mut audio, net.read_chunk_size, &mut shutdown).await;
                close_downlink(&mut downlink, reason, &mut [&mut video, &mut audio]).await
            }
            .instrument(span)
            .await
        }
    }
}

/// Background task writing queued packets to a socket
pub struct WriterHandle {
    task: JoinHandle<()>,
}

impl WriterHandle {
    /// Wait for the writer to drain its queue and close the socket.
    /// The queue's senders must all be dropped first.
    pub async fn finish(self) {
        if let Err(e) = self.task.await {
            tracing::warn!("Uplink writer task failed: {}", e);
        }
    }
}

/// Spawn a task that writes every packet from `rx` to `writer`.
///
/// When the queue closes, remaining packets are written and the socket is
/// shut down. A write error closes the connection.
pub fn spawn_writer<W>(mut writer: W, mut rx: mpsc::Receiver<Bytes>, state: ConnectionCell) -> WriterHandle
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let task = tokio::spawn(async move {
        while let Some(packet) = rx.recv().await {
            if let Err(e) = writer.write_all(&packet).await {
                tracing::error!("Uplink write failed: {}", e);
                state.apply(ConnectionEvent::TransportError(e.to_string()));
                return;
            }
        }
        if let Err(e) = writer.shutdown().await {
            tracing::debug!("Uplink socket shutdown: {}", e);
        }
    });
    WriterHandle { task }
}
