//! Volume meter for UI feedback.
//!
//! Root-mean-square of a captured frame, scaled to roughly [0, 100] for
//! display. Purely derived; carries no correctness requirement.

use crate::buffering::frame::AudioFrame;

/// Default display scale: RMS of a full-scale square wave reads 100.
pub const DEFAULT_DISPLAY_SCALE: f32 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolumeMeter {
    scale: f32,
}

impl VolumeMeter {
    pub fn new(scale: f32) -> Self {
        Self { scale }
    }

    /// Display level for one captured frame.
    pub fn level(&self, frame: &AudioFrame) -> f32 {
        self.level_of(&frame.samples)
    }

    pub fn level_of(&self, samples: &[f32]) -> f32 {
        rms(samples) * self.scale
    }
}

impl Default for VolumeMeter {
    fn default() -> Self {
        Self::new(DEFAULT_DISPLAY_SCALE)
    }
}

/// Root-mean-square of a sample slice. Empty input reads as silence.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}
