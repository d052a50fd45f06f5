//! 16-bit PCM conversion
//!
//! Wire samples are signed 16-bit, mono. Decoding maps `i16` to `[-1, 1)`
//! by dividing by 32768; encoding clamps and scales asymmetrically so that
//! both -1.0 and 1.0 land on the extreme codes.

use bytes::{BufMut, Bytes, BytesMut};

use crate::config::PcmEndian;
use crate::error::CodecError;

/// Convert one wire sample to float
#[inline]
pub fn sample_to_f32(sample: i16) -> f32 {
    sample as f32 / 32768.0
}

/// Convert one float sample to the wire range
#[inline]
pub fn sample_from_f32(sample: f32) -> i16 {
    let s = sample.clamp(-1.0, 1.0);
    if s < 0.0 {
        (s * 32768.0) as i16
    } else {
        (s * 32767.0) as i16
    }
}

/// Iterate decoded samples of a PCM payload.
///
/// Fails without yielding anything if the payload has a dangling byte.
pub fn decode_iter(
    bytes: &[u8],
    endian: PcmEndian,
) -> Result<impl Iterator<Item = f32> + '_, CodecError> {
    if bytes.len() % 2 != 0 {
        return Err(CodecError::OddPcmLength(bytes.len()));
    }
    Ok(bytes.chunks_exact(2).map(move |pair| {
        let raw = [pair[0], pair[1]];
        let sample = match endian {
            PcmEndian::Little => i16::from_le_bytes(raw),
            PcmEndian::Big => i16::from_be_bytes(raw),
        };
        sample_to_f32(sample)
    }))
}

/// Decode a PCM payload into a new vector
pub fn decode(bytes: &[u8], endian: PcmEndian) -> Result<Vec<f32>, CodecError> {
    Ok(decode_iter(bytes, endian)?.collect())
}

/// Encode float samples to a PCM payload
pub fn encode(samples: &[f32], endian: PcmEndian) -> Bytes {
    let mut out = BytesMut::with_capacity(samples.len() * 2);
    for &sample in samples {
        let code = sample_from_f32(sample);
        match endian {
            PcmEndian::Little => out.put_i16_le(code),
            PcmEndian::Big => out.put_i16(code),
        }
    }
    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_little_endian() {
        // 0x4000 = 16384, 0x8000 = -32768
        let samples = decode(&[0x00, 0x40, 0x00, 0x80, 0x00, 0x00], PcmEndian::Little).unwrap();
        assert_eq!(samples, vec![0.5, -1.0, 0.0]);
    }

    #[test]
    fn test_decode_big_endian() {
        let samples = decode(&[0x40, 0x00, 0x80, 0x00], PcmEndian::Big).unwrap();
        assert_eq!(samples, vec![0.5, -1.0]);
    }

    #[test]
    fn test_odd_length_rejected() {
        assert_eq!(
            decode(&[1, 2, 3], PcmEndian::Little),
            Err(CodecError::OddPcmLength(3))
        );
    }

    #[test]
    fn test_encode_clamps() {
        let bytes = encode(&[2.0, -2.0, 0.0], PcmEndian::Little);
        assert_eq!(&bytes[..], &[0xFF, 0x7F, 0x00, 0x80, 0x00, 0x00]);
    }

    #[test]
    fn test_decoded_range() {
        let bytes = encode(&[1.0, -1.0, 0.25], PcmEndian::Big);
        for sample in decode(&bytes, PcmEndian::Big).unwrap() {
            assert!((-1.0..=1.0).contains(&sample));
        }
    }
}
