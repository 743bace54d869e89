//! Microphone capture and speaker output via the cpal backend.
//!
//! # Design constraints
//!
//! The cpal input callback runs on an OS audio thread at elevated priority.
//! It **must not** block on a mutex or perform I/O, and should not allocate
//! once the down-mix scratch buffer has reached the device block size.
//!
//! Captured samples are down-mixed to mono f32 and pushed into an SPSC ring
//! buffer producer whose `push_slice` is lock-free. Framing, resampling to
//! 16 kHz and encoding all happen on the audio host thread (see [`host`]).
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on macOS).
//! [`AudioCapture`] and [`output::AudioOutput`] therefore must be created and
//! dropped on the same thread. [`host::CpalBackend`] does this inside
//! `spawn_blocking`.

pub mod device;
pub mod host;
pub mod output;
pub mod resample;

#[cfg(feature = "audio-cpal")]
use cpal::{
    traits::{DeviceTrait, StreamTrait},
    FromSample, Sample, SampleFormat, SampleRate, SizedSample, Stream, StreamConfig,
};

use crate::{
    buffering::AudioProducer,
    error::{Result, VoiceError},
};
#[cfg(feature = "audio-cpal")]
use crate::buffering::Producer;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
#[cfg(feature = "audio-cpal")]
use tracing::{error, info, warn};

#[cfg(feature = "audio-cpal")]
use device::DeviceDirection;

/// Handle to an active microphone stream.
///
/// **Not `Send`**: `cpal::Stream` is bound to its creation thread on Windows/macOS.
/// Create and drop this type on the same OS thread.
pub struct AudioCapture {
    #[cfg(feature = "audio-cpal")]
    stream: Stream,
    /// Shared gate: while `false` the callback discards everything it hears.
    gate: Arc<AtomicBool>,
    /// Actual capture sample rate reported by the device (Hz).
    pub sample_rate: u32,
    pub channels: u16,
}

#[cfg(feature = "audio-cpal")]
impl AudioCapture {
    /// Open an input device by preferred name, otherwise fall back to the
    /// default input device and then the first available device.
    ///
    /// The stream starts playing immediately, but nothing reaches `producer`
    /// until `gate` is set.
    ///
    /// # Errors
    /// `VoiceError::PermissionDenied` when the OS refuses the device,
    /// `VoiceError::NoDefaultInputDevice` when there is no microphone at all.
    pub fn open_with_preference(
        producer: AudioProducer,
        gate: Arc<AtomicBool>,
        preferred_device_name: Option<&str>,
    ) -> Result<Self> {
        let host = cpal::default_host();
        let device = device::select_device(&host, DeviceDirection::Input, preferred_device_name)?;

        info!(
            device = device.name().unwrap_or_default().as_str(),
            "opening input device"
        );

        let supported = pick_stream_config(&device, DeviceDirection::Input)?;
        let sample_rate = supported.sample_rate().0;
        let channels = supported.channels();

        info!(sample_rate, channels, format = ?supported.sample_format(), "input config selected");

        let config = StreamConfig {
            channels,
            sample_rate: SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let stream = match supported.sample_format() {
            SampleFormat::F32 => build_input::<f32>(&device, &config, producer, &gate),
            SampleFormat::I16 => build_input::<i16>(&device, &config, producer, &gate),
            SampleFormat::U16 => build_input::<u16>(&device, &config, producer, &gate),
            SampleFormat::U8 => build_input::<u8>(&device, &config, producer, &gate),
            fmt => {
                return Err(VoiceError::AudioStream(format!(
                    "unsupported input sample format: {fmt:?}"
                )))
            }
        }?;

        stream.play().map_err(|e| match e {
            cpal::PlayStreamError::DeviceNotAvailable => {
                VoiceError::PermissionDenied("input device not available".into())
            }
            other => VoiceError::AudioStream(other.to_string()),
        })?;

        Ok(Self {
            stream,
            gate,
            sample_rate,
            channels,
        })
    }

    /// Stop the hardware stream. The gate is closed first so any callback
    /// already in flight discards its block.
    pub fn pause(&self) -> Result<()> {
        self.stop();
        self.stream
            .pause()
            .map_err(|e| VoiceError::AudioStream(e.to_string()))
    }
}

/// Stub when the `audio-cpal` feature is disabled.
#[cfg(not(feature = "audio-cpal"))]
impl AudioCapture {
    pub fn open_with_preference(
        _producer: AudioProducer,
        _gate: Arc<AtomicBool>,
        _preferred_device_name: Option<&str>,
    ) -> Result<Self> {
        Err(VoiceError::AudioStream(
            "compiled without audio-cpal feature".into(),
        ))
    }

    pub fn pause(&self) -> Result<()> {
        self.stop();
        Ok(())
    }
}

impl AudioCapture {
    /// Signal the callback to no-op on its next invocation.
    pub fn stop(&self) {
        self.gate.store(false, Ordering::Release);
    }
}

#[cfg(feature = "audio-cpal")]
fn build_input<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut producer: AudioProducer,
    gate: &Arc<AtomicBool>,
) -> Result<Stream>
where
    T: SizedSample + Send + 'static,
    f32: FromSample<T>,
{
    let ch = config.channels.max(1) as usize;
    let gate = Arc::clone(gate);
    let mut mono: Vec<f32> = Vec::new();

    device
        .build_input_stream(
            config,
            move |data: &[T], _info| {
                if !gate.load(Ordering::Relaxed) {
                    return;
                }
                let frames = data.len() / ch;
                mono.resize(frames, 0.0);
                for (slot, frame) in mono.iter_mut().zip(data.chunks_exact(ch)) {
                    let sum: f32 = frame.iter().map(|&s| s.to_sample::<f32>()).sum();
                    *slot = sum / ch as f32;
                }
                let written = producer.push_slice(&mono);
                if written < mono.len() {
                    warn!("ring buffer full: dropped {} frames", mono.len() - written);
                }
            },
            |err| error!("audio input stream error: {err}"),
            None,
        )
        .map_err(|e| match e {
            cpal::BuildStreamError::DeviceNotAvailable => {
                VoiceError::PermissionDenied("input device not available".into())
            }
            other => VoiceError::AudioStream(other.to_string()),
        })
}

/// Choose a stream config for `device`.
///
/// Prefers a range that covers the protocol rate for `direction` (16 kHz in,
/// 24 kHz out) so no resampling is needed, with f32 and the fewest channels
/// breaking ties. Otherwise the device default is used and callers resample.
#[cfg(feature = "audio-cpal")]
pub(crate) fn pick_stream_config(
    device: &cpal::Device,
    direction: DeviceDirection,
) -> Result<cpal::SupportedStreamConfig> {
    let (target, ranges) = match direction {
        DeviceDirection::Input => (
            crate::CAPTURE_SAMPLE_RATE,
            device
                .supported_input_configs()
                .map(|r| r.collect::<Vec<_>>()),
        ),
        DeviceDirection::Output => (
            crate::PLAYBACK_SAMPLE_RATE,
            device
                .supported_output_configs()
                .map(|r| r.collect::<Vec<_>>()),
        ),
    };

    match ranges {
        Ok(ranges) => {
            let best = ranges
                .into_iter()
                .filter(|r| r.min_sample_rate().0 <= target && target <= r.max_sample_rate().0)
                .min_by_key(|r| (r.sample_format() != SampleFormat::F32, r.channels()));
            if let Some(range) = best {
                return Ok(range.with_sample_rate(SampleRate(target)));
            }
        }
        Err(e) => warn!(?direction, "failed to query supported configs: {e}"),
    }

    let default = match direction {
        DeviceDirection::Input => device.default_input_config(),
        DeviceDirection::Output => device.default_output_config(),
    };
    default.map_err(|e| match (direction, e) {
        (DeviceDirection::Input, cpal::DefaultStreamConfigError::DeviceNotAvailable) => {
            VoiceError::PermissionDenied("input device not available".into())
        }
        (_, other) => VoiceError::AudioDevice(other.to_string()),
    })
}
