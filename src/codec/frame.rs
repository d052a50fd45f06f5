//! Length-prefixed media framing
//!
//! Multiplexed packet layout:
//!
//! ```text
//! ┌──────────────┬──────────────┬────────────────┬────────────────┐
//! │ videoSize u32│ audioSize u32│ video payload  │ audio payload  │
//! │  big-endian  │  big-endian  │ videoSize bytes│ audioSize bytes│
//! └──────────────┴──────────────┴────────────────┴────────────────┘
//! ```
//!
//! Split-channel frames carry a single payload behind a 4-byte size.
//! Sizes are validated against the configured limit before any payload
//! buffer is reserved.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::constants::{FRAME_HEADER_SIZE, PACKET_HEADER_SIZE};
use crate::error::ProtocolError;

/// One demultiplexed unit: a video payload and an audio payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// JPEG-encoded still frame, may be empty
    pub video: Bytes,
    /// 16-bit signed PCM, mono, may be empty
    pub audio: Bytes,
}

impl Packet {
    pub fn new(video: impl Into<Bytes>, audio: impl Into<Bytes>) -> Self {
        Self {
            video: video.into(),
            audio: audio.into(),
        }
    }

    /// Encoded length on the wire
    pub fn wire_len(&self) -> usize {
        PACKET_HEADER_SIZE + self.video.len() + self.audio.len()
    }
}

/// Decoded packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub video_size: u32,
    pub audio_size: u32,
}

impl PacketHeader {
    /// Bytes the full packet occupies, header included
    pub fn total_len(&self) -> usize {
        PACKET_HEADER_SIZE + self.video_size as usize + self.audio_size as usize
    }
}

/// Outcome of a decode attempt against buffered bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded<T> {
    /// A complete unit and the number of bytes it consumed
    Complete(T, usize),
    /// More bytes are needed; the buffer must be retained untouched
    Incomplete,
    /// The header is unacceptable; the stream cannot be resynchronized
    Invalid(ProtocolError),
}

/// Codec for the multiplexed packet format
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_payload: u32,
}

impl FrameCodec {
    /// Create a codec that rejects any payload declared larger than `max_payload`
    pub fn new(max_payload: u32) -> Self {
        Self { max_payload }
    }

    pub fn max_payload(&self) -> u32 {
        self.max_payload
    }

    /// Encode a packet: 8-byte header followed by both payloads
    pub fn encode(video: &[u8], audio: &[u8]) -> Bytes {
        let mut out = BytesMut::with_capacity(PACKET_HEADER_SIZE + video.len() + audio.len());
        Self::encode_into(video, audio, &mut out);
        out.freeze()
    }

    /// Append an encoded packet to `out`
    pub fn encode_into(video: &[u8], audio: &[u8], out: &mut BytesMut) {
        out.reserve(PACKET_HEADER_SIZE + video.len() + audio.len());
        out.put_u32(video.len() as u32);
        out.put_u32(audio.len() as u32);
        out.put_slice(video);
        out.put_slice(audio);
    }

    /// Parse and validate the header at the start of `buf`
    pub fn parse_header(&self, buf: &[u8]) -> Decoded<PacketHeader> {
        if buf.len() < PACKET_HEADER_SIZE {
            return Decoded::Incomplete;
        }
        let mut header = &buf[..PACKET_HEADER_SIZE];
        let video_size = header.get_u32();
        let audio_size = header.get_u32();

        if let Err(e) = self.check("video", video_size) {
            return Decoded::Invalid(e);
        }
        if let Err(e) = self.check("audio", audio_size) {
            return Decoded::Invalid(e);
        }

        Decoded::Complete(
            PacketHeader {
                video_size,
                audio_size,
            },
            PACKET_HEADER_SIZE,
        )
    }

    /// Try to decode one packet from the front of `buf` without consuming it.
    /// Payloads are copied out.
    pub fn try_decode(&self, buf: &[u8]) -> Decoded<Packet> {
        let header = match self.parse_header(buf) {
            Decoded::Complete(header, _) => header,
            Decoded::Incomplete => return Decoded::Incomplete,
            Decoded::Invalid(e) => return Decoded::Invalid(e),
        };

        let total = header.total_len();
        if buf.len() < total {
            return Decoded::Incomplete;
        }

        let video_end = PACKET_HEADER_SIZE + header.video_size as usize;
        let packet = Packet {
            video: Bytes::copy_from_slice(&buf[PACKET_HEADER_SIZE..video_end]),
            audio: Bytes::copy_from_slice(&buf[video_end..total]),
        };
        Decoded::Complete(packet, total)
    }

    /// Split one packet off the front of `buf` without copying payloads.
    ///
    /// Returns `Ok(None)` when incomplete; `buf` is then left as it was.
    pub fn decode_from(&self, buf: &mut BytesMut) -> Result<Option<Packet>, ProtocolError> {
        let header = match self.parse_header(&buf[..]) {
            Decoded::Complete(header, _) => header,
            Decoded::Incomplete => return Ok(None),
            Decoded::Invalid(e) => return Err(e),
        };

        let total = header.total_len();
        if buf.len() < total {
            // Header is trusted now, so reserving up to one packet is bounded
            buf.reserve(total - buf.len());
            return Ok(None);
        }

        let mut unit = buf.split_to(total);
        unit.advance(PACKET_HEADER_SIZE);
        let audio = unit.split_off(header.video_size as usize);
        Ok(Some(Packet {
            video: unit.freeze(),
            audio: audio.freeze(),
        }))
    }

    /// Encode a single-payload frame for the split-channel profile
    pub fn encode_frame(payload: &[u8]) -> Bytes {
        let mut out = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
        out.put_u32(payload.len() as u32);
        out.put_slice(payload);
        out.freeze()
    }

    /// Split one single-payload frame off the front of `buf`
    pub fn decode_frame_from(
        &self,
        kind: &'static str,
        buf: &mut BytesMut,
    ) -> Result<Option<Bytes>, ProtocolError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }
        let size = (&buf[..FRAME_HEADER_SIZE]).get_u32();
        self.check(kind, size)?;

        let total = FRAME_HEADER_SIZE + size as usize;
        if buf.len() < total {
            buf.reserve(total - buf.len());
            return Ok(None);
        }

        let mut unit = buf.split_to(total);
        unit.advance(FRAME_HEADER_SIZE);
        Ok(Some(unit.freeze()))
    }

    fn check(&self, kind: &'static str, declared: u32) -> Result<(), ProtocolError> {
        if declared > self.max_payload {
            return Err(ProtocolError::PayloadTooLarge {
                kind,
                declared,
                max: self.max_payload,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_header_layout() {
        let encoded = FrameCodec::encode(b"abc", b"\x01\x02");
        assert_eq!(&encoded[..8], &[0, 0, 0, 3, 0, 0, 0, 2]);
        assert_eq!(&encoded[8..], b"abc\x01\x02");
    }

    #[test]
    fn test_incomplete_header_and_body() {
        let codec = FrameCodec::new(1024);
        let encoded = FrameCodec::encode(b"video", b"audio");

        assert_eq!(codec.try_decode(&encoded[..7]), Decoded::Incomplete);
        assert_eq!(codec.try_decode(&encoded[..encoded.len() - 1]), Decoded::Incomplete);
        assert_eq!(codec.try_decode(&[]), Decoded::Incomplete);
    }

    #[test]
    fn test_empty_payloads() {
        let codec = FrameCodec::new(16);
        let encoded = FrameCodec::encode(&[], &[]);
        assert_eq!(
            codec.try_decode(&encoded),
            Decoded::Complete(Packet::new(Bytes::new(), Bytes::new()), 8)
        );
    }

    #[test]
    fn test_oversized_header_rejected_from_header_alone() {
        let codec = FrameCodec::new(1024);
        let mut header = BytesMut::new();
        header.put_u32(u32::MAX);
        header.put_u32(0);

        match codec.try_decode(&header) {
            Decoded::Invalid(ProtocolError::PayloadTooLarge { kind, declared, max }) => {
                assert_eq!(kind, "video");
                assert_eq!(declared, u32::MAX);
                assert_eq!(max, 1024);
            }
            other => panic!("expected Invalid, got {:?}", other),
        }

        let capacity_before = header.capacity();
        assert!(codec.decode_from(&mut header).is_err());
        assert_eq!(header.capacity(), capacity_before);
        assert_eq!(header.len(), 8);
    }

    #[test]
    fn test_oversized_audio_rejected() {
        let codec = FrameCodec::new(4);
        let encoded = FrameCodec::encode(b"ok", b"too long");
        assert!(matches!(
            codec.try_decode(&encoded),
            Decoded::Invalid(ProtocolError::PayloadTooLarge { kind: "audio", .. })
        ));
    }

    #[test]
    fn test_decode_from_leaves_tail() {
        let codec = FrameCodec::new(1024);
        let mut buf = BytesMut::new();
        FrameCodec::encode_into(b"v1", b"a1", &mut buf);
        FrameCodec::encode_into(b"v2", b"a2", &mut buf);
        buf.truncate(buf.len() - 1);

        let first = codec.decode_from(&mut buf).unwrap().unwrap();
        assert_eq!(first, Packet::new(&b"v1"[..], &b"a1"[..]));
        let remaining = buf.len();
        assert!(codec.decode_from(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), remaining);
    }

    #[test]
    fn test_single_payload_frame() {
        let codec = FrameCodec::new(64);
        let mut buf = BytesMut::from(&FrameCodec::encode_frame(b"44100")[..]);
        buf.extend_from_slice(&[0, 0]);

        let frame = codec.decode_frame_from("audio", &mut buf).unwrap().unwrap();
        assert_eq!(&frame[..], b"44100");
        assert!(codec.decode_frame_from("audio", &mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 2);
    }

    proptest! {
        #[test]
        fn prop_round_trip(
            video in proptest::collection::vec(any::<u8>(), 0..512),
            audio in proptest::collection::vec(any::<u8>(), 0..512),
        ) {
            let codec = FrameCodec::new(512);
            let encoded = FrameCodec::encode(&video, &audio);
            let expected = Packet::new(video.clone(), audio.clone());
            prop_assert_eq!(
                codec.try_decode(&encoded),
                Decoded::Complete(expected, 8 + video.len() + audio.len())
            );
        }
    }
}
