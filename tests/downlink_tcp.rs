//! End-to-end tests over real TCP sockets on localhost

use bytes::Bytes;
use image::{Rgb, RgbImage};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};

use camlink::audio::JitterBuffer;
use camlink::codec::jpeg::encode_jpeg;
use camlink::codec::{pcm, Decoded, FrameCodec};
use camlink::config::{AppConfig, PcmEndian, ProtocolProfile};
use camlink::inference;
use camlink::network::{run_downlink, CloseReason, ConnectionState, SendOutcome, Uplink};
use camlink::pipeline::{DownlinkHandle, DownlinkParts};

fn jpeg(shade: u8) -> Vec<u8> {
    encode_jpeg(&RgbImage::from_pixel(16, 12, Rgb([shade, 0, 0]))).unwrap()
}

fn pcm_le(codes: &[i16]) -> Vec<u8> {
    codes.iter().flat_map(|c| c.to_le_bytes()).collect()
}

fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.network.device_host = "127.0.0.1".to_string();
    config.network.connect_timeout_ms = 2_000;
    config.network.max_payload_size = 1024 * 1024;
    config.video.decode_worker = false;
    config.ui.enabled = false;
    config
}

fn parts() -> DownlinkParts {
    DownlinkParts::from_config(&test_config(), inference::event_channel()).unwrap()
}

type Opened = (DownlinkHandle, Arc<JitterBuffer>);

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_multiplexed_stream_until_remote_close() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut config = test_config();
    config.network.media_port = listener.local_addr().unwrap().port();

    let v1 = jpeg(10);
    let a1 = pcm_le(&[16384, -16384, 8192, 0]);
    let v2 = Vec::new();
    let a2 = pcm_le(&[4096, 4096]);
    let mut wire = FrameCodec::encode(&v1, &a1).to_vec();
    wire.extend_from_slice(&FrameCodec::encode(&v2, &a2));

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        // Split inside the first packet's audio payload
        let cut = 8 + v1.len() + 3;
        socket.write_all(&wire[..cut]).await.unwrap();
        socket.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        socket.write_all(&wire[cut..]).await.unwrap();
        socket.shutdown().await.unwrap();
    });

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let (opened_tx, opened_rx) = oneshot::channel::<Opened>();
    let reason = run_downlink(&config, parts(), shutdown_rx, move |downlink| {
        let _ = opened_tx.send((downlink.handle(), downlink.jitter().unwrap()));
    })
    .await;
    server.await.unwrap();

    assert_eq!(reason, CloseReason::RemoteClosed);
    let (handle, jitter) = opened_rx.await.unwrap();
    let status = handle.status();
    assert_eq!(status.state, ConnectionState::Closed(CloseReason::RemoteClosed));
    assert_eq!(status.demux.units, 2);
    assert_eq!(status.demux.pending, 0);
    assert_eq!(status.video.decoded, 1);

    // Ring was detached at teardown; only this test's reference keeps it alive
    assert!(jitter.is_detached());
    assert_eq!(jitter.stats().samples_in, 6);
    assert!(handle.current_video_frame().is_some());
}

#[tokio::test]
async fn test_oversized_header_is_protocol_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut config = test_config();
    config.network.media_port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        socket.write_all(&FrameCodec::encode(b"", &pcm_le(&[1]))).await.unwrap();
        socket
            .write_all(&[0x7f, 0xff, 0xff, 0xff, 0, 0, 0, 0])
            .await
            .unwrap();
        // The viewer must hang up on us
        let mut rest = Vec::new();
        let _ = socket.read_to_end(&mut rest).await;
    });

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let (opened_tx, opened_rx) = oneshot::channel::<Opened>();
    let reason = run_downlink(&config, parts(), shutdown_rx, move |downlink| {
        let _ = opened_tx.send((downlink.handle(), downlink.jitter().unwrap()));
    })
    .await;
    tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap();

    assert!(matches!(reason, CloseReason::Protocol(_)));
    let (handle, jitter) = opened_rx.await.unwrap();
    assert!(matches!(
        handle.state(),
        ConnectionState::Closed(CloseReason::Protocol(_))
    ));
    assert_eq!(jitter.stats().samples_in, 1);
}

#[tokio::test]
async fn test_local_shutdown() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut config = test_config();
    config.network.media_port = listener.local_addr().unwrap().port();

    let (hold_tx, hold_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        socket
            .write_all(&FrameCodec::encode(b"", &pcm_le(&[1, 2, 3])))
            .await
            .unwrap();
        let _ = hold_rx.await;
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (opened_tx, opened_rx) = oneshot::channel::<Opened>();
    let downlink = tokio::spawn(async move {
        run_downlink(&config, parts(), shutdown_rx, move |downlink| {
            let _ = opened_tx.send((downlink.handle(), downlink.jitter().unwrap()));
        })
        .await
    });

    let (handle, jitter) = opened_rx.await.unwrap();
    wait_until(|| jitter.stats().samples_in == 3).await;
    assert!(handle.state().is_streaming());

    shutdown_tx.send(true).unwrap();
    let reason = downlink.await.unwrap();
    let _ = hold_tx.send(());
    server.await.unwrap();

    assert_eq!(reason, CloseReason::Local);
    assert_eq!(handle.state(), ConnectionState::Closed(CloseReason::Local));
    assert!(jitter.is_detached());
}

#[tokio::test]
async fn test_split_channels_with_preamble() {
    let video_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let audio_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut config = test_config();
    config.network.profile = ProtocolProfile::SplitChannels;
    config.network.video_port = video_listener.local_addr().unwrap().port();
    config.network.audio_port = audio_listener.local_addr().unwrap().port();
    config.network.sample_rate_preamble = true;

    let (hold_tx, hold_rx) = watch::channel(false);
    let mut video_hold = hold_rx.clone();
    let mut audio_hold = hold_rx;

    let video_server = tokio::spawn(async move {
        let (mut socket, _) = video_listener.accept().await.unwrap();
        socket.write_all(&FrameCodec::encode_frame(&jpeg(200))).await.unwrap();
        let _ = video_hold.changed().await;
    });
    let audio_server = tokio::spawn(async move {
        let (mut socket, _) = audio_listener.accept().await.unwrap();
        let mut wire = FrameCodec::encode_frame(b"44100").to_vec();
        wire.extend_from_slice(&FrameCodec::encode_frame(&pcm_le(&[100, 200])));
        socket.write_all(&wire).await.unwrap();
        let _ = audio_hold.changed().await;
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (opened_tx, opened_rx) = oneshot::channel::<Opened>();
    let downlink = tokio::spawn(async move {
        run_downlink(&config, parts(), shutdown_rx, move |downlink| {
            let _ = opened_tx.send((downlink.handle(), downlink.jitter().unwrap()));
        })
        .await
    });

    let (handle, jitter) = opened_rx.await.unwrap();
    assert_eq!(jitter.sample_rate(), 44_100);
    wait_until(|| jitter.stats().samples_in == 2 && handle.status().video.decoded == 1).await;

    shutdown_tx.send(true).unwrap();
    assert_eq!(downlink.await.unwrap(), CloseReason::Local);
    let _ = hold_tx.send(true);
    video_server.await.unwrap();
    audio_server.await.unwrap();
}

#[tokio::test]
async fn test_connect_failure_closes() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut config = test_config();
    config.network.media_port = listener.local_addr().unwrap().port();
    drop(listener);

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let reason = run_downlink(&config, parts(), shutdown_rx, |_| {
        panic!("must not open");
    })
    .await;
    assert!(matches!(reason, CloseReason::Transport(_)));
}

#[tokio::test]
async fn test_uplink_sends_audio_only_packets() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut config = test_config();
    config.network.uplink_port = listener.local_addr().unwrap().port();
    config.uplink.pcm_endian = PcmEndian::Little;

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut received = Vec::new();
        socket.read_to_end(&mut received).await.unwrap();
        received
    });

    let uplink = Uplink::connect(&config).await.unwrap();
    assert!(uplink.state().is_streaming());
    let encoder = uplink.encoder().unwrap().clone();
    assert_eq!(encoder.send_uplink_audio(&[0.5, -0.5]), SendOutcome::Sent);
    drop(encoder);

    assert_eq!(uplink.shutdown().await, CloseReason::Local);
    let received = server.await.unwrap();

    let codec = FrameCodec::new(1024);
    match codec.try_decode(&received) {
        Decoded::Complete(packet, consumed) => {
            assert_eq!(consumed, received.len());
            assert!(packet.video.is_empty());
            assert_eq!(packet.audio, Bytes::from_static(&[0xff, 0x3f, 0x00, 0xc0]));
            let samples = pcm::decode(&packet.audio, PcmEndian::Little).unwrap();
            assert!((samples[0] - 0.5).abs() < 1e-3);
            assert_eq!(samples[1], -0.5);
        }
        other => panic!("expected one packet, got {:?}", other),
    }
}
