//! # wander-core
//!
//! Real-time voice pipeline for the WanderAI travel assistant.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → AudioCapture → SPSC RingBuffer → CapturePump (audio host thread)
//!                                                   │ 4096-sample frames @ 16 kHz
//!                                                   ▼
//!                                      SessionController (tokio task)
//!                                         │                    ▲
//!                                 realtime input          server content
//!                                         ▼                    │
//!                                       Gemini Live WebSocket ─┘
//!                                                   │ 24 kHz PCM
//!                                                   ▼
//!                        PlaybackScheduler → AudioOutput → Speaker
//! ```
//!
//! The capture callback is lock-free. Everything stateful about a session is
//! owned by the controller's event loop.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod capture;
pub mod codec;
pub mod engine;
pub mod error;
pub mod ipc;
pub mod meter;
pub mod playback;
pub mod session;
pub mod transport;

/// Sample rate of captured audio sent to the model (Hz).
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;
/// Sample rate of model audio responses (Hz).
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;
/// Samples per captured frame.
pub const CAPTURE_BLOCK_SIZE: usize = 4_096;

// Convenience re-exports for downstream crates
pub use codec::CAPTURE_MIME_TYPE;
pub use engine::{VoiceConfig, VoiceEngine};
pub use error::{DecodeError, VoiceError};
pub use ipc::events::{PlaybackEvent, SessionState, SessionStatusEvent, VolumeEvent};
pub use meter::VolumeMeter;
pub use playback::PlaybackScheduler;
pub use session::{SessionController, SessionEvent};
pub use transport::{GeminiLiveConfig, GeminiLiveConnector};
