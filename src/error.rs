//! Error types for the voice client

use thiserror::Error;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Recording error: {0}")]
    Recording(#[from] RecordingError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Audio device and render-loop errors
#[derive(Error, Debug)]
pub enum AudioError {
    /// The microphone could not be opened (permission denied, busy, missing)
    #[error("Capture unavailable: {0}")]
    CaptureUnavailable(String),

    #[error("Playback unavailable: {0}")]
    PlaybackUnavailable(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    /// A running stream's device went away (unplugged, revoked)
    #[error("Device lost: {0}")]
    DeviceLost(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// The renderer did not answer a rendezvous request in time
    #[error("Renderer did not answer request {0}")]
    RendererUnresponsive(uuid::Uuid),
}

/// Frame codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),
}

/// Transport errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Transport closed")]
    TransportClosed,

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Timeout")]
    Timeout,
}

/// Session lifecycle errors
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Invalid session state: expected {expected}, found {actual}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Session driver is gone")]
    DriverGone,
}

/// Recording subsystem errors
#[derive(Error, Debug)]
pub enum RecordingError {
    #[error("Failed to start recorder: {0}")]
    Start(String),

    #[error("WAV encoding failed: {0}")]
    Encode(String),
}

impl From<hound::Error> for RecordingError {
    fn from(err: hound::Error) -> Self {
        RecordingError::Encode(err.to_string())
    }
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;
