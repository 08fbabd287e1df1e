//! # Voice Duplex
//!
//! Client-side streaming engine for real-time voice conversations with a
//! remote agent: microphone capture, agent playback with per-track offset
//! tracking, barge-in, and three-way session recording.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                                 CLIENT                                    │
//! │                                                                           │
//! │  ┌────────────┐   ┌──────────────────┐   ┌─────────────────────────────┐ │
//! │  │ Microphone │──▶│ Capture Pipeline │──▶│  Session driver (tokio)     │ │
//! │  └────────────┘   │ 4096-sample      │   │  media ─▶ WebSocket ─▶ agent│ │
//! │        │          │ blocks, mute gate│   │  agent ─▶ dispatch          │ │
//! │        │          └──────────────────┘   └──────────────┬──────────────┘ │
//! │        │ mic tap                                        │ audio chunks   │
//! │        ▼                                                ▼                │
//! │  ┌──────────────┐                         ┌─────────────────────────────┐ │
//! │  │  Recording   │◀──── agent tap ─────────│ FrameAssembler ─▶ Playback  │ │
//! │  │ mixed/mic/ai │                         │ Queue (lock-free, FIFO)     │ │
//! │  └──────────────┘                         └──────────────┬──────────────┘ │
//! │                                                          ▼                │
//! │  offset / interrupt ── request id ──▶ ┌─────────────────────────────────┐ │
//! │  (PlaybackHandle)   ◀── oneshot ───── │ Renderer (real-time callback)   │ │
//! │                                       │ per-track sample offsets        │ │
//! │                                       └──────────────┬──────────────────┘ │
//! │                                                      ▼                    │
//! │                                               ┌────────────┐              │
//! │                                               │  Speakers  │              │
//! │                                               └────────────┘              │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod codec;
pub mod config;
pub mod error;
pub mod network;
pub mod protocol;
pub mod recording;
pub mod session;

pub use error::{Error, Result};
pub use session::{Session, SessionEvent, SessionState};

/// Application-wide constants
pub mod constants {
    /// Nominal session sample rate
    pub const DEFAULT_SAMPLE_RATE: u32 = 44100;

    /// Samples per capture block sent to the agent
    pub const DEFAULT_CAPTURE_BLOCK: usize = 4096;

    /// Samples per playback frame
    pub const DEFAULT_RENDER_BLOCK: usize = 128;

    /// Largest accepted playback frame
    pub const MAX_RENDER_BLOCK: usize = 8192;

    /// Queued agent audio ceiling in seconds
    pub const DEFAULT_MAX_BUFFERED_SECS: f32 = 120.0;

    /// Idle delay before signalling `ai_speak_stop`
    pub const DEFAULT_SPEAK_STOP_MS: u64 = 500;

    /// Capture blocks buffered between the device and the network task
    pub const CAPTURE_CHANNEL_CAPACITY: usize = 64;

    /// Pending offset/interrupt requests the renderer will hold
    pub const RENDER_REQUEST_CAPACITY: usize = 64;

    /// How often the session checks the devices for stream errors
    pub const DEVICE_POLL_INTERVAL_MS: u64 = 100;

    pub const DEFAULT_AGENT_URL: &str = "wss://voicebot-api.langcore.org";

    pub const DEFAULT_CLIENT_ID: &str = "callcenter";

    /// Track id used when a chunk carries none
    pub const DEFAULT_TRACK_ID: &str = "default";

    /// Track id that an interrupt never discards
    pub const NO_INTERRUPT_TRACK_ID: &str = "no-interrupt";
}
