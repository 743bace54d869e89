//! Events published by the voice engine.
//!
//! ## Channels
//!
//! | Event | Subscription |
//! |-------|--------------|
//! | `SessionStatusEvent` | `VoiceEngine::subscribe_status` |
//! | `VolumeEvent` | `VoiceEngine::subscribe_volume` |
//! | `PlaybackEvent` | `VoiceEngine::subscribe_playback` |

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Session status
// ---------------------------------------------------------------------------

/// Connection state shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// No session; devices released.
    #[default]
    Disconnected,
    /// Devices open, waiting for the model session to come up.
    Connecting,
    /// Model session open and microphone streaming.
    Connected,
    /// The last attempt failed. Always followed by `Disconnected`.
    Error,
}

impl SessionState {
    /// Whether a session is holding devices (or acquiring them).
    pub fn is_live(self) -> bool {
        matches!(self, SessionState::Connecting | SessionState::Connected)
    }
}

/// Emitted whenever the session state changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusEvent {
    pub status: SessionState,
    /// Optional human-readable detail (e.g. error message).
    pub detail: Option<String>,
}

// ---------------------------------------------------------------------------
// Volume
// ---------------------------------------------------------------------------

/// Microphone level for one captured frame, on the display scale (~0..100).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    pub level: f32,
}

// ---------------------------------------------------------------------------
// Playback
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PlaybackEventKind {
    /// A model audio chunk was placed on the output timeline.
    Scheduled,
    /// The user barged in and queued audio was dropped.
    Interrupted,
    /// The model finished its turn.
    TurnComplete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackEvent {
    pub seq: u64,
    pub kind: PlaybackEventKind,
    /// Buffers still scheduled after this event.
    pub active_buffers: usize,
    /// Output-clock time the scheduled chunk starts at, if any.
    pub start_time: Option<f64>,
}
