//! Capture pipeline: ring buffer → 16 kHz mono → 4096-sample frames → wire chunks.
//!
//! The device callback (see [`crate::audio::AudioCapture`]) only down-mixes and
//! pushes into the SPSC ring. Everything here runs on the audio host thread:
//!
//! ```text
//! ring consumer → RateConverter(device → 16 kHz) → CaptureFramer(4096)
//!                                                     │
//!                                          meter + encode_chunk
//!                                                     │
//!                                  SessionEvent::Captured → session loop
//! ```
//!
//! Frames carry the session generation they were captured under. The gate is
//! checked again right before each send, so nothing captured after teardown
//! reaches the session, and the session rejects any frame whose generation is
//! no longer live.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, OnceLock,
};

use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::{
    audio::resample::RateConverter,
    buffering::{frame::AudioFrame, AudioConsumer, Consumer},
    codec::{encode_chunk, EncodedChunk},
    error::Result,
    meter::VolumeMeter,
    session::SessionEvent,
    CAPTURE_BLOCK_SIZE, CAPTURE_SAMPLE_RATE,
};

/// Read granularity when draining the ring.
const DRAIN_CHUNK: usize = 4_096;

/// How long the host thread sleeps when the ring is empty.
///
/// Overridable with `WANDER_CAPTURE_IDLE_SLEEP_MS` (1..=20).
pub fn idle_sleep_ms() -> u64 {
    static VALUE: OnceLock<u64> = OnceLock::new();
    *VALUE.get_or_init(|| {
        std::env::var("WANDER_CAPTURE_IDLE_SLEEP_MS")
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(|v| v.clamp(1, 20))
            .unwrap_or(5)
    })
}

/// One encoded capture frame on its way to the session.
#[derive(Debug, Clone)]
pub struct CapturedChunk {
    /// Session generation the frame was captured under.
    pub generation: u64,
    pub chunk: EncodedChunk,
    /// Display volume of the frame (see [`VolumeMeter`]).
    pub level: f32,
    pub samples: usize,
}

/// Resamples device audio to the capture rate and cuts it into fixed blocks.
pub struct CaptureFramer {
    converter: RateConverter,
    pending: Vec<f32>,
    block_size: usize,
}

impl CaptureFramer {
    /// Framer producing [`CAPTURE_BLOCK_SIZE`]-sample frames at
    /// [`CAPTURE_SAMPLE_RATE`] from audio at `device_rate`.
    pub fn new(device_rate: u32) -> Result<Self> {
        Self::with_block_size(device_rate, CAPTURE_BLOCK_SIZE)
    }

    pub fn with_block_size(device_rate: u32, block_size: usize) -> Result<Self> {
        // 10 ms of device audio per rubato call
        let chunk = (device_rate / 100).max(1) as usize;
        Ok(Self {
            converter: RateConverter::new(device_rate, CAPTURE_SAMPLE_RATE, chunk)?,
            pending: Vec::with_capacity(block_size * 2),
            block_size: block_size.max(1),
        })
    }

    /// Feed device-rate mono samples; returns every complete frame.
    pub fn push(&mut self, samples: &[f32]) -> Vec<AudioFrame> {
        let converted = self.converter.process(samples);
        self.pending.extend_from_slice(&converted);

        let mut frames = Vec::new();
        while self.pending.len() >= self.block_size {
            let block: Vec<f32> = self.pending.drain(..self.block_size).collect();
            frames.push(AudioFrame::new(block, CAPTURE_SAMPLE_RATE));
        }
        frames
    }

    /// Samples at the capture rate waiting for a full block.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Discard partial blocks and converter state.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.converter.reset();
    }
}

/// Drains the capture ring on the host thread and forwards encoded frames.
pub struct CapturePump {
    consumer: AudioConsumer,
    framer: CaptureFramer,
    gate: Arc<AtomicBool>,
    generation: u64,
    events: mpsc::UnboundedSender<SessionEvent>,
    meter: VolumeMeter,
    scratch: Vec<f32>,
}

impl CapturePump {
    pub fn new(
        consumer: AudioConsumer,
        framer: CaptureFramer,
        gate: Arc<AtomicBool>,
        generation: u64,
        events: mpsc::UnboundedSender<SessionEvent>,
        meter: VolumeMeter,
    ) -> Self {
        Self {
            consumer,
            framer,
            gate,
            generation,
            events,
            meter,
            scratch: vec![0.0; DRAIN_CHUNK],
        }
    }

    pub fn is_open(&self) -> bool {
        self.gate.load(Ordering::Acquire)
    }

    /// Drain whatever the callback has pushed and forward complete frames.
    ///
    /// Returns the number of frames sent. While the gate is closed, samples
    /// are discarded along with any partial frame.
    pub fn pump(&mut self) -> usize {
        let mut sent = 0;
        loop {
            let n = self.consumer.pop_slice(&mut self.scratch);
            if n == 0 {
                break;
            }
            if !self.is_open() {
                self.framer.reset();
                continue;
            }

            for frame in self.framer.push(&self.scratch[..n]) {
                // Liveness is checked at send time, not only when capture began.
                if !self.is_open() {
                    trace!(generation = self.generation, "gate closed, dropping frame");
                    self.framer.reset();
                    break;
                }
                let captured = CapturedChunk {
                    generation: self.generation,
                    level: self.meter.level(&frame),
                    samples: frame.len(),
                    chunk: encode_chunk(&frame.samples, frame.sample_rate),
                };
                if self.events.send(SessionEvent::Captured(captured)).is_err() {
                    debug!("session loop gone, closing capture gate");
                    self.gate.store(false, Ordering::Release);
                    return sent;
                }
                sent += 1;
            }
        }
        sent
    }

    /// Throw away everything buffered so far (ring contents and partial frame).
    pub fn discard_pending(&mut self) {
        while self.consumer.pop_slice(&mut self.scratch) > 0 {}
        self.framer.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffering::{create_audio_ring, AudioProducer, Producer};
    use crate::codec;

    type Harness = (
        CapturePump,
        AudioProducer,
        mpsc::UnboundedReceiver<SessionEvent>,
        Arc<AtomicBool>,
    );

    fn pump_with_gate(open: bool) -> Harness {
        let (producer, consumer) = create_audio_ring();
        let gate = Arc::new(AtomicBool::new(open));
        let (tx, rx) = mpsc::unbounded_channel();
        let framer = CaptureFramer::new(CAPTURE_SAMPLE_RATE).unwrap();
        let pump = CapturePump::new(
            consumer,
            framer,
            Arc::clone(&gate),
            7,
            tx,
            VolumeMeter::default(),
        );
        (pump, producer, rx, gate)
    }

    #[test]
    fn framer_cuts_fixed_blocks_at_capture_rate() {
        let mut framer = CaptureFramer::new(CAPTURE_SAMPLE_RATE).unwrap();
        assert!(framer.push(&vec![0.1; 3_000]).is_empty());
        let frames = framer.push(&vec![0.1; 6_000]);
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.len() == CAPTURE_BLOCK_SIZE));
        assert!(frames.iter().all(|f| f.sample_rate == CAPTURE_SAMPLE_RATE));
        assert_eq!(framer.pending_len(), 9_000 - 2 * CAPTURE_BLOCK_SIZE);
        framer.reset();
        assert_eq!(framer.pending_len(), 0);
    }

    #[test]
    fn framer_resamples_48k_input() {
        let mut framer = CaptureFramer::new(48_000).unwrap();
        // 1 s at 48 kHz ≈ 16 000 samples at 16 kHz ≈ 3 full blocks
        let frames = framer.push(&vec![0.0; 48_000]);
        assert_eq!(frames.len(), 3);
        assert!(frames.iter().all(|f| f.len() == CAPTURE_BLOCK_SIZE));
    }

    #[test]
    fn pump_forwards_encoded_frames_with_generation() {
        let (mut pump, mut producer, mut rx, _gate) = pump_with_gate(true);
        producer.push_slice(&vec![0.5; CAPTURE_BLOCK_SIZE]);
        assert_eq!(pump.pump(), 1);

        let Ok(SessionEvent::Captured(captured)) = rx.try_recv() else {
            panic!("expected a captured chunk");
        };
        assert_eq!(captured.generation, 7);
        assert_eq!(captured.samples, CAPTURE_BLOCK_SIZE);
        assert_eq!(captured.chunk.mime_type, codec::CAPTURE_MIME_TYPE);
        assert!((captured.level - 50.0).abs() < 1e-3);
        let decoded = codec::decode(&captured.chunk.data).unwrap();
        assert_eq!(decoded.len(), CAPTURE_BLOCK_SIZE);
    }

    #[test]
    fn closed_gate_drops_everything() {
        let (mut pump, mut producer, mut rx, gate) = pump_with_gate(false);
        producer.push_slice(&vec![0.5; CAPTURE_BLOCK_SIZE * 2]);
        assert_eq!(pump.pump(), 0);
        assert!(rx.try_recv().is_err());

        // Reopening starts from a clean frame boundary.
        gate.store(true, Ordering::Release);
        producer.push_slice(&vec![0.5; CAPTURE_BLOCK_SIZE - 1]);
        assert_eq!(pump.pump(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn dropped_session_closes_gate() {
        let (mut pump, mut producer, rx, gate) = pump_with_gate(true);
        drop(rx);
        producer.push_slice(&vec![0.1; CAPTURE_BLOCK_SIZE]);
        assert_eq!(pump.pump(), 0);
        assert!(!gate.load(Ordering::Acquire));
    }

    #[test]
    fn idle_sleep_is_clamped() {
        let ms = idle_sleep_ms();
        assert!((1..=20).contains(&ms));
    }
}
