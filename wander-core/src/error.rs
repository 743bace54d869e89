use thiserror::Error;

/// All errors produced by wander-core.
#[derive(Debug, Error)]
pub enum VoiceError {
    #[error("microphone access denied or unavailable: {0}")]
    PermissionDenied(String),

    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("no default input device found")]
    NoDefaultInputDevice,

    #[error("no default output device found")]
    NoDefaultOutputDevice,

    #[error("malformed audio payload: {0}")]
    Decode(#[from] DecodeError),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("sample rate mismatch: scheduler runs at {expected} Hz, frame is {actual} Hz")]
    SampleRateMismatch { expected: u32, actual: u32 },

    #[error("voice engine event loop has shut down")]
    EngineClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl VoiceError {
    /// Whether this error means the microphone could not be acquired.
    pub fn is_permission(&self) -> bool {
        matches!(
            self,
            VoiceError::PermissionDenied(_) | VoiceError::NoDefaultInputDevice
        )
    }
}

/// Failure to turn an inbound base64 payload into PCM samples.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("odd PCM byte length {0}; 16-bit samples need an even count")]
    OddLength(usize),
}

pub type Result<T> = std::result::Result<T, VoiceError>;
