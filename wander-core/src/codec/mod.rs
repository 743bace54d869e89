//! Wire audio codec.
//!
//! The live model speaks base64-encoded little-endian signed 16-bit PCM in
//! both directions. Everything inside the engine works on normalized `f32`
//! samples in [-1.0, 1.0]; this module is the only place the two meet.

pub mod pcm;

pub use pcm::{
    decode, encode, encode_chunk, parse_pcm_rate, pcm_mime_type, EncodedChunk, CAPTURE_MIME_TYPE,
};
