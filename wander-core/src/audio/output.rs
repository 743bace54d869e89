//! Speaker output via cpal, rendering the playback scheduler's mix.
//!
//! The output callback is the only thing that advances the [`OutputClock`]:
//! one tick per rendered frame. That makes the scheduler's timeline and the
//! audible position the same thing, independent of the capture clock.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

#[cfg(feature = "audio-cpal")]
use cpal::{
    traits::{DeviceTrait, StreamTrait},
    FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig,
};

use crate::error::{Result, VoiceError};
#[cfg(feature = "audio-cpal")]
use crate::playback::PlaybackScheduler;
use crate::playback::SharedScheduler;
#[cfg(feature = "audio-cpal")]
use tracing::{error, info};

/// Monotonic output-device clock, counted in rendered frames.
#[derive(Debug, Clone)]
pub struct OutputClock {
    frames: Arc<AtomicU64>,
    sample_rate: u32,
}

impl OutputClock {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            frames: Arc::new(AtomicU64::new(0)),
            sample_rate,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn now_frames(&self) -> u64 {
        self.frames.load(Ordering::Acquire)
    }

    /// Current output time in seconds.
    pub fn now_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.now_frames() as f64 / self.sample_rate as f64
    }

    pub fn advance(&self, frames: u64) {
        self.frames.fetch_add(frames, Ordering::AcqRel);
    }
}

/// Handle to an active output stream.
///
/// **Not `Send`**: `cpal::Stream` is bound to its creation thread on
/// Windows/macOS. Create and drop this type on the same OS thread.
pub struct AudioOutput {
    #[cfg(feature = "audio-cpal")]
    _stream: Stream,
    scheduler: SharedScheduler,
    clock: OutputClock,
    /// Actual device output rate (Hz); the scheduler runs at this rate.
    pub sample_rate: u32,
}

impl AudioOutput {
    pub fn scheduler(&self) -> SharedScheduler {
        Arc::clone(&self.scheduler)
    }

    pub fn clock(&self) -> OutputClock {
        self.clock.clone()
    }
}

#[cfg(feature = "audio-cpal")]
impl AudioOutput {
    /// Open an output device by preferred name (falling back to the default),
    /// preferring the model's 24 kHz rate when the device supports it.
    ///
    /// Must be called from the thread that will also drop this value.
    pub fn open_with_preference(preferred_device_name: Option<&str>) -> Result<Self> {
        use super::device::{select_device, DeviceDirection};

        let host = cpal::default_host();
        let device = select_device(&host, DeviceDirection::Output, preferred_device_name)?;

        info!(
            device = device.name().unwrap_or_default().as_str(),
            "opening output device"
        );

        let supported = super::pick_stream_config(&device, DeviceDirection::Output)?;
        let sample_rate = supported.sample_rate().0;
        let channels = supported.channels();
        info!(sample_rate, channels, format = ?supported.sample_format(), "output config selected");

        let config = StreamConfig {
            channels,
            sample_rate: supported.sample_rate(),
            buffer_size: cpal::BufferSize::Default,
        };

        let scheduler = PlaybackScheduler::shared(sample_rate);
        let clock = OutputClock::new(sample_rate);

        let stream = match supported.sample_format() {
            SampleFormat::F32 => build_stream::<f32>(&device, &config, &scheduler, &clock),
            SampleFormat::I16 => build_stream::<i16>(&device, &config, &scheduler, &clock),
            SampleFormat::U16 => build_stream::<u16>(&device, &config, &scheduler, &clock),
            fmt => {
                return Err(VoiceError::AudioStream(format!(
                    "unsupported output sample format: {fmt:?}"
                )))
            }
        }?;

        stream
            .play()
            .map_err(|e| VoiceError::AudioStream(e.to_string()))?;

        Ok(Self {
            _stream: stream,
            scheduler,
            clock,
            sample_rate,
        })
    }
}

/// Stub when the `audio-cpal` feature is disabled.
#[cfg(not(feature = "audio-cpal"))]
impl AudioOutput {
    pub fn open_with_preference(_preferred_device_name: Option<&str>) -> Result<Self> {
        Err(VoiceError::AudioStream(
            "compiled without audio-cpal feature".into(),
        ))
    }
}

#[cfg(feature = "audio-cpal")]
fn build_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    scheduler: &SharedScheduler,
    clock: &OutputClock,
) -> Result<Stream>
where
    T: SizedSample + FromSample<f32> + Send + 'static,
{
    let ch = config.channels as usize;
    let scheduler = Arc::clone(scheduler);
    let clock = clock.clone();
    let mut mono: Vec<f32> = Vec::new();

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _info| {
                let frames = data.len() / ch;
                // Grows once to the device block size, then stays put.
                mono.resize(frames, 0.0);

                let block_start = clock.now_frames();
                scheduler.lock().render(&mut mono, block_start);
                clock.advance(frames as u64);

                for (frame, sample) in data.chunks_exact_mut(ch).zip(&mono) {
                    let value = T::from_sample(*sample);
                    for slot in frame.iter_mut() {
                        *slot = value;
                    }
                }
            },
            |err| error!("audio output stream error: {err}"),
            None,
        )
        .map_err(|e| VoiceError::AudioStream(e.to_string()))
}
