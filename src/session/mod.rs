//! Session controller: one duplex conversation from start to close

mod controller;
pub mod state;

pub use controller::Session;
pub use state::SessionState;

use chrono::{DateTime, Utc};

use crate::audio::OffsetRecord;

/// Who said a transcript line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    User,
    Agent,
}

/// One timestamped transcript line
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptEntry {
    pub speaker: Speaker,
    pub text: String,
    pub at: DateTime<Utc>,
}

/// Notifications from a running session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Transcript(TranscriptEntry),
    /// Remote voice-activity report for the user
    UserSpeaking(bool),
    ConversationStarted(String),
    PlaybackStarted,
    PlaybackStopped,
    /// Playback was cut off; `None` when nothing had played yet
    Interrupted(Option<OffsetRecord>),
    /// A device stream reported an error; a lost device also closes the session
    DeviceError(String),
    Closed { reason: Option<String> },
}
