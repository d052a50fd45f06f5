//! Stream demultiplexing
//!
//! Transports deliver arbitrary-sized chunks. A demuxer keeps the unconsumed
//! tail of the stream and emits complete units in byte-stream order. The
//! tail never holds more than one partial unit: consumed bytes are split off
//! immediately after each emitted unit.

use bytes::{Bytes, BytesMut};
use serde::Serialize;

use crate::codec::{FrameCodec, Packet};
use crate::constants::{MAX_SAMPLE_RATE, MIN_SAMPLE_RATE};
use crate::error::ProtocolError;

/// Demultiplexer counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct DemuxStats {
    pub chunks: u64,
    pub bytes: u64,
    pub units: u64,
    pub pending: usize,
}

/// Demultiplexer for the multiplexed packet stream
pub struct StreamDemuxer {
    codec: FrameCodec,
    pending: BytesMut,
    failed: bool,
    stats: DemuxStats,
}

impl StreamDemuxer {
    pub fn new(max_payload: u32) -> Self {
        Self {
            codec: FrameCodec::new(max_payload),
            pending: BytesMut::new(),
            failed: false,
            stats: DemuxStats::default(),
        }
    }

    /// Append a chunk and emit every packet it completes, in order.
    ///
    /// Returns the number of packets emitted. After an error the demuxer is
    /// poisoned and later chunks fail with [`ProtocolError::Rejected`].
    pub fn push(
        &mut self,
        chunk: &[u8],
        mut emit: impl FnMut(Packet),
    ) -> Result<usize, ProtocolError> {
        if self.failed {
            return Err(ProtocolError::Rejected);
        }

        self.stats.chunks += 1;
        self.stats.bytes += chunk.len() as u64;
        self.pending.extend_from_slice(chunk);

        let mut emitted = 0;
        loop {
            match self.codec.decode_from(&mut self.pending) {
                Ok(Some(packet)) => {
                    emitted += 1;
                    emit(packet);
                }
                Ok(None) => break,
                Err(e) => {
                    self.failed = true;
                    self.pending = BytesMut::new();
                    self.stats.units += emitted as u64;
                    self.stats.pending = 0;
                    return Err(e);
                }
            }
        }

        self.stats.units += emitted as u64;
        self.stats.pending = self.pending.len();
        Ok(emitted)
    }

    /// Bytes held waiting for the rest of a packet
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> DemuxStats {
        self.stats.clone()
    }
}

/// Which payload a split channel carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
        }
    }
}

/// What a split channel yields
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// One-shot sample-rate announcement
    SampleRate(u32),
    Payload(Bytes),
}

/// Demultiplexer for one channel of the split-channel profile
pub struct ChannelDemuxer {
    kind: MediaKind,
    codec: FrameCodec,
    pending: BytesMut,
    expect_preamble: bool,
    failed: bool,
    stats: DemuxStats,
}

impl ChannelDemuxer {
    /// `expect_preamble` makes the first frame a sample-rate announcement
    pub fn new(kind: MediaKind, max_payload: u32, expect_preamble: bool) -> Self {
        Self {
            kind,
            codec: FrameCodec::new(max_payload),
            pending: BytesMut::new(),
            expect_preamble,
            failed: false,
            stats: DemuxStats::default(),
        }
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Append a chunk and emit every event it completes, in order
    pub fn push(
        &mut self,
        chunk: &[u8],
        mut emit: impl FnMut(ChannelEvent),
    ) -> Result<usize, ProtocolError> {
        if self.failed {
            return Err(ProtocolError::Rejected);
        }

        self.stats.chunks += 1;
        self.stats.bytes += chunk.len() as u64;
        self.pending.extend_from_slice(chunk);

        let mut emitted = 0;
        let result = loop {
            let frame = match self.codec.decode_frame_from(self.kind.as_str(), &mut self.pending) {
                Ok(Some(frame)) => frame,
                Ok(None) => break Ok(emitted),
                Err(e) => break Err(e),
            };

            let event = if self.expect_preamble {
                self.expect_preamble = false;
                match parse_sample_rate(&frame) {
                    Ok(rate) => ChannelEvent::SampleRate(rate),
                    Err(e) => break Err(e),
                }
            } else {
                ChannelEvent::Payload(frame)
            };
            emitted += 1;
            emit(event);
        };

        self.stats.units += emitted as u64;
        if result.is_err() {
            self.failed = true;
            self.pending = BytesMut::new();
        }
        self.stats.pending = self.pending.len();
        result
    }

    /// Consume only the sample-rate preamble.
    ///
    /// Returns `Ok(None)` until the preamble frame is complete. Bytes past
    /// the preamble stay pending untouched, see [`into_pending`](Self::into_pending).
    pub fn push_preamble(&mut self, chunk: &[u8]) -> Result<Option<u32>, ProtocolError> {
        if self.failed {
            return Err(ProtocolError::Rejected);
        }
        if !self.expect_preamble {
            return Err(ProtocolError::InvalidPreamble("already received".into()));
        }

        self.stats.chunks += 1;
        self.stats.bytes += chunk.len() as u64;
        self.pending.extend_from_slice(chunk);

        let result = match self.codec.decode_frame_from(self.kind.as_str(), &mut self.pending) {
            Ok(Some(frame)) => {
                self.expect_preamble = false;
                self.stats.units += 1;
                parse_sample_rate(&frame).map(Some)
            }
            Ok(None) => Ok(None),
            Err(e) => Err(e),
        };
        if result.is_err() {
            self.failed = true;
            self.pending = BytesMut::new();
        }
        self.stats.pending = self.pending.len();
        result
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Whether the preamble is still outstanding
    pub fn awaiting_preamble(&self) -> bool {
        self.expect_preamble
    }

    /// Hand back buffered bytes that belong to the steady-state stream
    pub fn into_pending(self) -> BytesMut {
        self.pending
    }

    pub fn stats(&self) -> DemuxStats {
        self.stats.clone()
    }
}

/// Parse an ASCII decimal sample-rate announcement
pub fn parse_sample_rate(payload: &[u8]) -> Result<u32, ProtocolError> {
    let text = std::str::from_utf8(payload)
        .map_err(|_| ProtocolError::InvalidPreamble("not UTF-8".into()))?
        .trim();
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ProtocolError::InvalidPreamble(format!("{:?} is not a number", text)));
    }
    let rate: u32 = text
        .parse()
        .map_err(|_| ProtocolError::InvalidPreamble(format!("{:?} out of range", text)))?;
    if !(MIN_SAMPLE_RATE..=MAX_SAMPLE_RATE).contains(&rate) {
        return Err(ProtocolError::InvalidPreamble(format!("{} Hz unsupported", rate)));
    }
    Ok(rate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn encode_all(packets: &[(Vec<u8>, Vec<u8>)]) -> Vec<u8> {
        packets
            .iter()
            .flat_map(|(v, a)| FrameCodec::encode(v, a).to_vec())
            .collect()
    }

    fn collect(demux: &mut StreamDemuxer, chunks: &[&[u8]]) -> Vec<Packet> {
        let mut out = Vec::new();
        for chunk in chunks {
            demux.push(chunk, |p| out.push(p)).unwrap();
        }
        out
    }

    #[test]
    fn test_split_inside_audio_payload() {
        let v1 = b"jpeg-one".to_vec();
        let a1 = vec![1u8, 0, 2, 0, 3, 0];
        let v2 = b"jpeg-two!".to_vec();
        let a2 = vec![9u8, 9];
        let stream = encode_all(&[(v1.clone(), a1.clone()), (v2.clone(), a2.clone())]);

        // Cut three bytes into the first packet's audio payload
        let cut = 8 + v1.len() + 3;
        let mut demux = StreamDemuxer::new(1024);
        let mut seen = Vec::new();

        let first = demux.push(&stream[..cut], |p| seen.push(p)).unwrap();
        assert_eq!(first, 0);
        assert_eq!(demux.pending_len(), cut);

        let second = demux.push(&stream[cut..], |p| seen.push(p)).unwrap();
        assert_eq!(second, 2);
        assert_eq!(seen.len(), 2);
        assert_eq!(&seen[0].video[..], &v1[..]);
        assert_eq!(&seen[0].audio[..], &a1[..]);
        assert_eq!(&seen[1].video[..], &v2[..]);
        assert_eq!(&seen[1].audio[..], &a2[..]);
        assert_eq!(demux.pending_len(), 0);
    }

    #[test]
    fn test_byte_at_a_time() {
        let packets = vec![(b"a".to_vec(), b"bc".to_vec()), (Vec::new(), b"zz".to_vec())];
        let stream = encode_all(&packets);
        let chunks: Vec<&[u8]> = stream.chunks(1).collect();

        let mut demux = StreamDemuxer::new(16);
        let out = collect(&mut demux, &chunks);
        assert_eq!(out.len(), 2);
        assert_eq!(&out[1].audio[..], b"zz");
        assert_eq!(demux.stats().units, 2);
    }

    #[test]
    fn test_invalid_header_poisons() {
        let mut stream = FrameCodec::encode(b"ok", b"ok").to_vec();
        stream.extend_from_slice(&[0x7f, 0xff, 0xff, 0xff, 0, 0, 0, 0]);

        let mut demux = StreamDemuxer::new(64);
        let mut seen = 0;
        let err = demux.push(&stream, |_| seen += 1).unwrap_err();
        assert!(matches!(err, ProtocolError::PayloadTooLarge { kind: "video", .. }));
        // Packets before the bad header were still delivered in order
        assert_eq!(seen, 1);
        assert_eq!(demux.pending_len(), 0);

        assert_eq!(
            demux.push(&FrameCodec::encode(b"", b""), |_| seen += 1),
            Err(ProtocolError::Rejected)
        );
        assert_eq!(seen, 1);
    }

    #[test]
    fn test_channel_with_preamble() {
        let mut stream = FrameCodec::encode_frame(b"44100").to_vec();
        stream.extend_from_slice(&FrameCodec::encode_frame(&[1, 2, 3, 4]));
        stream.extend_from_slice(&FrameCodec::encode_frame(&[5, 6])[..3]);

        let mut demux = ChannelDemuxer::new(MediaKind::Audio, 1024, true);
        let mut events = Vec::new();
        demux.push(&stream, |e| events.push(e)).unwrap();

        assert_eq!(
            events,
            vec![
                ChannelEvent::SampleRate(44_100),
                ChannelEvent::Payload(Bytes::from_static(&[1, 2, 3, 4])),
            ]
        );
        assert!(!demux.awaiting_preamble());
        assert_eq!(demux.into_pending().len(), 3);
    }

    #[test]
    fn test_preamble_only_leaves_payloads_pending() {
        let mut stream = FrameCodec::encode_frame(b"16000").to_vec();
        let payload = FrameCodec::encode_frame(&[7, 0, 8, 0]);
        stream.extend_from_slice(&payload);

        let mut demux = ChannelDemuxer::new(MediaKind::Audio, 1024, true);
        assert_eq!(demux.push_preamble(&stream[..6]), Ok(None));
        assert_eq!(demux.push_preamble(&stream[6..]), Ok(Some(16_000)));
        assert_eq!(&demux.into_pending()[..], &payload[..]);
    }

    #[test]
    fn test_channel_without_preamble() {
        let stream = FrameCodec::encode_frame(b"44100");
        let mut demux = ChannelDemuxer::new(MediaKind::Video, 1024, false);
        let mut events = Vec::new();
        demux.push(&stream, |e| events.push(e)).unwrap();
        assert_eq!(events, vec![ChannelEvent::Payload(Bytes::from_static(b"44100"))]);
    }

    #[test]
    fn test_bad_preamble_rejected() {
        let mut demux = ChannelDemuxer::new(MediaKind::Audio, 1024, true);
        let err = demux.push(&FrameCodec::encode_frame(b"fast"), |_| {}).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPreamble(_)));
    }

    #[test]
    fn test_parse_sample_rate() {
        assert_eq!(parse_sample_rate(b"16000"), Ok(16_000));
        assert_eq!(parse_sample_rate(b" 44100\n"), Ok(44_100));
        assert!(parse_sample_rate(b"0").is_err());
        assert!(parse_sample_rate(b"-16000").is_err());
        assert!(parse_sample_rate(b"99999999999").is_err());
    }

    fn packets_strategy() -> impl Strategy<Value = Vec<(Vec<u8>, Vec<u8>)>> {
        proptest::collection::vec(
            (
                proptest::collection::vec(any::<u8>(), 0..64),
                proptest::collection::vec(any::<u8>(), 0..64),
            ),
            1..8,
        )
    }

    proptest! {
        #[test]
        fn prop_chunking_invariance(
            packets in packets_strategy(),
            cuts in proptest::collection::vec(any::<usize>(), 0..16),
        ) {
            let stream = encode_all(&packets);
            let mut points: Vec<usize> = cuts.iter().map(|c| c % (stream.len() + 1)).collect();
            points.push(0);
            points.push(stream.len());
            points.sort_unstable();
            points.dedup();

            let mut demux = StreamDemuxer::new(64);
            let mut out = Vec::new();
            for window in points.windows(2) {
                demux.push(&stream[window[0]..window[1]], |p| out.push(p)).unwrap();
            }

            let expected: Vec<Packet> = packets
                .iter()
                .map(|(v, a)| Packet::new(v.clone(), a.clone()))
                .collect();
            prop_assert_eq!(out, expected);
            prop_assert_eq!(demux.pending_len(), 0);
        }
    }
}
