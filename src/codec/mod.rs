//! Wire codecs
//!
//! Packet framing plus the two payload formats carried inside packets:
//! JPEG stills and 16-bit PCM.

pub mod frame;
pub mod jpeg;
pub mod pcm;

pub use frame::{Decoded, FrameCodec, Packet, PacketHeader};
pub use jpeg::{ImageDecoder, JpegDecoder};
