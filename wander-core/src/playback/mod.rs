//! Gapless playback scheduling on the output clock.
//!
//! ## Timeline
//!
//! ```text
//! output clock ──────────────────────────────────────────────►
//!               │ chunk 1 │ chunk 2 │ chunk 3 │
//!               ^ start = max(now, next_start)
//!                         ^ next_start = start + duration
//! ```
//!
//! The cursor is kept as an integer frame index at the output rate so that
//! back-to-back buffers are sample-exact; seconds are derived from it.
//! When the scheduler falls behind real time a chunk starts "now" and output
//! simply starves until the next chunk arrives. No silence is inserted.
//!
//! "Now" is never earlier than the end of the last rendered block. A clock
//! reading taken before the lock may already be stale by one device block,
//! and anything placed there would lose its head.
//!
//! The scheduler is shared between the session loop (enqueue / flush) and the
//! output device callback (render) as a [`SharedScheduler`]. Every mutation of
//! the active set happens under that one lock, so a flush empties the set
//! atomically with respect to new scheduling.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, trace};

use crate::buffering::frame::AudioFrame;
use crate::error::{Result, VoiceError};

/// Handle identifying one scheduled buffer.
pub type BufferId = u64;

/// Scheduler shared between the session loop and the output callback.
pub type SharedScheduler = Arc<Mutex<PlaybackScheduler>>;

/// Where an enqueued frame landed on the output timeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledPlayback {
    pub id: BufferId,
    /// Start on the output clock (seconds).
    pub start_time: f64,
    /// End on the output clock (seconds); the next contiguous start.
    pub end_time: f64,
}

/// Raised when stopping a buffer whose audio already played out.
///
/// Expected during a flush that races natural completion; callers swallow it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StopError {
    #[error("playback buffer {0} already finished")]
    AlreadyFinished(BufferId),
}

/// A decoded frame pinned to a start position on the output clock.
#[derive(Debug)]
pub struct PlaybackBuffer {
    id: BufferId,
    samples: Vec<f32>,
    start_frame: u64,
}

impl PlaybackBuffer {
    pub fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }

    /// Stop the buffer at output frame `now`.
    ///
    /// # Errors
    /// `StopError::AlreadyFinished` when the buffer has already played out.
    pub fn stop(&self, now: u64) -> std::result::Result<(), StopError> {
        if self.end_frame() <= now {
            return Err(StopError::AlreadyFinished(self.id));
        }
        Ok(())
    }
}

/// Owns the clock cursor and the set of in-flight buffers.
#[derive(Debug)]
pub struct PlaybackScheduler {
    sample_rate: u32,
    /// Clock cursor: where the next enqueued frame begins (output frames).
    next_start_frame: u64,
    /// End of the last block handed to the device (output frames).
    rendered_until: u64,
    next_id: BufferId,
    active: HashMap<BufferId, PlaybackBuffer>,
}

impl PlaybackScheduler {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            next_start_frame: 0,
            rendered_until: 0,
            next_id: 0,
            active: HashMap::new(),
        }
    }

    /// Wrap a new scheduler for sharing with an output callback.
    pub fn shared(sample_rate: u32) -> SharedScheduler {
        Arc::new(Mutex::new(Self::new(sample_rate)))
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Clock cursor in seconds.
    pub fn next_start_time(&self) -> f64 {
        self.frames_to_secs(self.next_start_frame)
    }

    /// Number of scheduled-but-unfinished buffers.
    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn is_idle(&self) -> bool {
        self.active.is_empty()
    }

    /// Schedule `frame` right after the previous one, or at `now` if the
    /// cursor has fallen behind the output clock.
    ///
    /// # Errors
    /// `VoiceError::SampleRateMismatch` if the frame is not at the
    /// scheduler's output rate; convert before enqueueing.
    pub fn enqueue(&mut self, frame: AudioFrame, now: f64) -> Result<ScheduledPlayback> {
        let now_frame = self.secs_to_frames(now);
        self.enqueue_at_frame(frame, now_frame)
    }

    /// [`enqueue`](Self::enqueue) with the clock reading in output frames.
    pub fn enqueue_at_frame(&mut self, frame: AudioFrame, now: u64) -> Result<ScheduledPlayback> {
        if frame.sample_rate != self.sample_rate {
            return Err(VoiceError::SampleRateMismatch {
                expected: self.sample_rate,
                actual: frame.sample_rate,
            });
        }

        let now = now.max(self.rendered_until);
        let start_frame = now.max(self.next_start_frame);
        let end_frame = start_frame + frame.samples.len() as u64;
        self.next_start_frame = end_frame;

        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);

        if !frame.samples.is_empty() {
            self.active.insert(
                id,
                PlaybackBuffer {
                    id,
                    samples: frame.samples,
                    start_frame,
                },
            );
        }

        trace!(
            buffer = id,
            start_frame,
            end_frame,
            lag_frames = start_frame - now,
            "playback buffer scheduled"
        );

        Ok(ScheduledPlayback {
            id,
            start_time: self.frames_to_secs(start_frame),
            end_time: self.frames_to_secs(end_frame),
        })
    }

    /// Stop every active buffer, clear the set and pull the cursor to `now`
    /// (or to the end of the last rendered block, if that is later).
    ///
    /// Safe to call repeatedly and on an empty set. Returns how many buffers
    /// were actually cut short.
    pub fn flush(&mut self, now: f64) -> usize {
        let now_frame = self.secs_to_frames(now).max(self.rendered_until);
        let mut stopped = 0usize;
        for (_, buffer) in self.active.drain() {
            match buffer.stop(now_frame) {
                Ok(()) => stopped += 1,
                Err(e) => trace!("ignoring stop on finished buffer: {e}"),
            }
        }
        self.next_start_frame = now_frame;
        debug!(stopped, now, "playback flushed");
        stopped
    }

    /// Forget all buffers and rewind the cursor to the clock origin.
    pub fn reset(&mut self) {
        self.active.clear();
        self.next_start_frame = 0;
        self.rendered_until = 0;
    }

    /// Remove buffers that have fully played out by output frame `now`.
    pub fn reap_finished(&mut self, now: u64) -> usize {
        let before = self.active.len();
        self.active.retain(|_, buffer| buffer.end_frame() > now);
        before - self.active.len()
    }

    /// Mix the active buffers into a mono block starting at output frame
    /// `block_start`, then drop buffers that completed within the block.
    ///
    /// Called from the output callback; does not allocate.
    pub fn render(&mut self, out: &mut [f32], block_start: u64) {
        out.fill(0.0);
        let block_end = block_start + out.len() as u64;

        for buffer in self.active.values() {
            let start = buffer.start_frame.max(block_start);
            let end = buffer.end_frame().min(block_end);
            if start >= end {
                continue;
            }
            let src = (start - buffer.start_frame) as usize;
            let dst = (start - block_start) as usize;
            let n = (end - start) as usize;
            for (o, s) in out[dst..dst + n]
                .iter_mut()
                .zip(&buffer.samples[src..src + n])
            {
                *o += *s;
            }
        }

        for sample in out.iter_mut() {
            *sample = sample.clamp(-1.0, 1.0);
        }

        self.rendered_until = self.rendered_until.max(block_end);
        self.reap_finished(block_end);
    }

    fn secs_to_frames(&self, secs: f64) -> u64 {
        if secs <= 0.0 || !secs.is_finite() {
            return 0;
        }
        (secs * self.sample_rate as f64).round() as u64
    }

    fn frames_to_secs(&self, frames: u64) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        frames as f64 / self.sample_rate as f64
    }
}
