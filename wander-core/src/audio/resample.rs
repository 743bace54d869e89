//! Audio sample-rate conversion using a rubato `FastFixedIn` resampler.
//!
//! ## Design
//!
//! The live model wants 16 kHz in and sends 24 kHz out, while devices often
//! run at 44.1 or 48 kHz. `RateConverter` bridges both directions on non-RT
//! threads (the audio host for capture, the session loop for playback),
//! where allocation is allowed.
//!
//! When the two rates match, `RateConverter` is a passthrough and no rubato
//! session is created at all.
//!
//! ## Usage
//!
//! ```ignore
//! let mut rc = RateConverter::new(48_000, 16_000, 960)?;
//! let out = rc.process(&raw_samples); // Vec<f32> at 16 kHz
//! let tail = rc.flush();              // remainder at end of stream
//! ```

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::error;

use crate::error::{Result, VoiceError};

/// Converts f32 mono audio from one fixed sample rate to another.
pub struct RateConverter {
    /// `None` when input rate == output rate (passthrough mode).
    resampler: Option<FastFixedIn<f32>>,
    /// Accumulation buffer; holds partial input chunks between calls.
    input_buf: Vec<f32>,
    /// How many input samples rubato expects per process call.
    chunk_size: usize,
    /// Pre-allocated output buffer: `[1][output_frames_max]`.
    output_buf: Vec<Vec<f32>>,
    input_rate: u32,
    output_rate: u32,
}

impl RateConverter {
    /// Create a new converter.
    ///
    /// # Parameters
    /// - `input_rate`: Sample rate of the incoming audio (Hz).
    /// - `output_rate`: Sample rate the consumer expects (Hz).
    /// - `chunk_size`: Input frame count per rubato call (e.g. `960`).
    ///
    /// # Errors
    /// Returns `VoiceError::AudioDevice` if rubato fails to initialise.
    pub fn new(input_rate: u32, output_rate: u32, chunk_size: usize) -> Result<Self> {
        if input_rate == output_rate {
            return Ok(Self {
                resampler: None,
                input_buf: Vec::new(),
                chunk_size,
                output_buf: Vec::new(),
                input_rate,
                output_rate,
            });
        }
        if input_rate == 0 || output_rate == 0 {
            return Err(VoiceError::AudioDevice(format!(
                "resampler init: invalid rates {input_rate} -> {output_rate}"
            )));
        }

        let ratio = output_rate as f64 / input_rate as f64;

        let resampler = FastFixedIn::<f32>::new(
            ratio,
            1.0, // fixed ratio, no dynamic adjustment
            PolynomialDegree::Cubic,
            chunk_size,
            1, // mono
        )
        .map_err(|e| VoiceError::AudioDevice(format!("resampler init: {e}")))?;

        let max_out = resampler.output_frames_max();
        let output_buf = vec![vec![0f32; max_out]; 1];

        tracing::info!(
            input_rate,
            output_rate,
            chunk_size,
            max_out,
            "resampling enabled"
        );

        Ok(Self {
            resampler: Some(resampler),
            input_buf: Vec::new(),
            chunk_size,
            output_buf,
            input_rate,
            output_rate,
        })
    }

    /// Process incoming samples, returning resampled output (may be empty).
    ///
    /// Samples are accumulated internally until a full `chunk_size` block is
    /// available for rubato. Any remainder is kept for the next call.
    ///
    /// In passthrough mode (same rates), input is returned directly.
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        let Some(ref mut resampler) = self.resampler else {
            return samples.to_vec();
        };

        self.input_buf.extend_from_slice(samples);

        let mut result = Vec::new();

        while self.input_buf.len() >= self.chunk_size {
            let input_slice = &self.input_buf[..self.chunk_size];

            match resampler.process_into_buffer(&[input_slice], &mut self.output_buf, None) {
                Ok((_consumed, produced)) => {
                    result.extend_from_slice(&self.output_buf[0][..produced]);
                }
                Err(e) => {
                    error!("resampler process error: {e}");
                }
            }

            self.input_buf.drain(..self.chunk_size);
        }

        result
    }

    /// Convert whatever partial chunk is still buffered, padding rubato's
    /// input with silence and trimming the padded part from the output.
    ///
    /// Call at the end of a stream (e.g. a completed model turn).
    pub fn flush(&mut self) -> Vec<f32> {
        let Some(ref mut resampler) = self.resampler else {
            return Vec::new();
        };
        if self.input_buf.is_empty() {
            return Vec::new();
        }

        let pending = std::mem::take(&mut self.input_buf);
        let expected = (pending.len() as f64 * self.output_rate as f64 / self.input_rate as f64)
            .round() as usize;

        let input: [&[f32]; 1] = [pending.as_slice()];
        match resampler.process_partial_into_buffer(Some(&input[..]), &mut self.output_buf, None) {
            Ok((_consumed, produced)) => self.output_buf[0][..produced.min(expected)].to_vec(),
            Err(e) => {
                error!("resampler flush error: {e}");
                Vec::new()
            }
        }
    }

    /// Drop buffered input and clear rubato's filter state.
    pub fn reset(&mut self) {
        self.input_buf.clear();
        if let Some(ref mut resampler) = self.resampler {
            resampler.reset();
        }
    }

    /// Returns `true` when input rate == output rate (no resampling occurs).
    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }

    pub fn input_rate(&self) -> u32 {
        self.input_rate
    }

    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }
}
