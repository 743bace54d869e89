//! Base64 LE i16 PCM ⇄ normalized f32.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use crate::error::DecodeError;
use crate::CAPTURE_SAMPLE_RATE;

/// Mime type attached to every outbound microphone chunk.
pub const CAPTURE_MIME_TYPE: &str = "audio/pcm;rate=16000";

/// i16 full scale. Decoding divides by this; encoding multiplies and relies on
/// the saturating float→int cast so `+1.0` lands on `i16::MAX`.
const I16_SCALE: f32 = 32_768.0;

/// A chunk of encoded audio in transit between the codec and the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodedChunk {
    /// Base64 of little-endian signed 16-bit PCM.
    pub data: String,
    /// e.g. `audio/pcm;rate=16000`.
    pub mime_type: String,
}

/// Decode a base64 LE i16 payload into samples in [-1.0, 1.0).
///
/// Byte order is read explicitly, independent of the host.
///
/// # Errors
/// `DecodeError::Base64` for invalid base64, `DecodeError::OddLength` when the
/// decoded byte count cannot hold whole 16-bit samples.
pub fn decode(payload: &str) -> Result<Vec<f32>, DecodeError> {
    let bytes = STANDARD.decode(payload)?;
    if bytes.len() % 2 != 0 {
        return Err(DecodeError::OddLength(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / I16_SCALE)
        .collect())
}

/// Encode samples as base64 LE i16, clamping each sample to [-1.0, 1.0] first.
pub fn encode(samples: &[f32]) -> String {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        bytes.extend_from_slice(&sample_to_i16(sample).to_le_bytes());
    }
    STANDARD.encode(bytes)
}

/// Encode samples into a wire chunk tagged with `sample_rate`.
pub fn encode_chunk(samples: &[f32], sample_rate: u32) -> EncodedChunk {
    EncodedChunk {
        data: encode(samples),
        mime_type: if sample_rate == CAPTURE_SAMPLE_RATE {
            CAPTURE_MIME_TYPE.to_string()
        } else {
            pcm_mime_type(sample_rate)
        },
    }
}

/// `audio/pcm;rate=<sample_rate>`.
pub fn pcm_mime_type(sample_rate: u32) -> String {
    format!("audio/pcm;rate={sample_rate}")
}

/// Extract the `rate` parameter from an `audio/pcm` mime type.
///
/// Returns `None` for other media types or when no parseable rate is present.
pub fn parse_pcm_rate(mime_type: &str) -> Option<u32> {
    let mut parts = mime_type.split(';');
    let base = parts.next()?.trim();
    if !base.eq_ignore_ascii_case("audio/pcm") {
        return None;
    }
    parts
        .filter_map(|param| param.split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("rate"))
        .and_then(|(_, value)| value.trim().parse::<u32>().ok())
}

fn sample_to_i16(sample: f32) -> i16 {
    // Unclamped values wrap around in the integer domain and click audibly.
    // NaN passes through clamp and casts to 0.
    (sample.clamp(-1.0, 1.0) * I16_SCALE) as i16
}
