//! Still-frame decoding
//!
//! Image decoding is delegated to the `image` crate; the trait exists so the
//! video sink can run against a platform decoder or a test double.

use ::image::{ImageFormat, RgbImage};

use crate::error::CodecError;

/// Turns an encoded still frame into RGB pixels
pub trait ImageDecoder: Send + 'static {
    fn decode(&mut self, payload: &[u8]) -> Result<RgbImage, CodecError>;
}

/// JPEG decoder backed by the `image` crate
#[derive(Debug, Default, Clone, Copy)]
pub struct JpegDecoder;

impl ImageDecoder for JpegDecoder {
    fn decode(&mut self, payload: &[u8]) -> Result<RgbImage, CodecError> {
        ::image::load_from_memory_with_format(payload, ImageFormat::Jpeg)
            .map(|img| img.to_rgb8())
            .map_err(|e| CodecError::ImageDecode(e.to_string()))
    }
}

/// Encode an RGB image as JPEG
pub fn encode_jpeg(image: &RgbImage) -> Result<Vec<u8>, CodecError> {
    let mut out = std::io::Cursor::new(Vec::new());
    image
        .write_to(&mut out, ImageFormat::Jpeg)
        .map_err(|e| CodecError::ImageDecode(e.to_string()))?;
    Ok(out.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_jpeg() {
        let source = RgbImage::from_pixel(32, 24, ::image::Rgb([200, 40, 40]));
        let encoded = encode_jpeg(&source).unwrap();

        let decoded = JpegDecoder.decode(&encoded).unwrap();
        assert_eq!(decoded.dimensions(), (32, 24));
        // Lossy, but a flat colour survives closely
        let px = decoded.get_pixel(16, 12);
        assert!(px[0] > 150 && px[1] < 90);
    }

    #[test]
    fn test_garbage_rejected() {
        let err = JpegDecoder.decode(b"definitely not a jpeg").unwrap_err();
        assert!(matches!(err, CodecError::ImageDecode(_)));
    }
}
