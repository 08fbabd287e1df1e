//! Wire messages exchanged with the remote agent
//!
//! Outbound frames are tagged by `event` with a `payload`; inbound frames
//! are tagged by `type` with a `content`. Both are closed enums so the
//! dispatch sites match exhaustively.

use serde::{Deserialize, Serialize};

use crate::error::NetworkError;

/// Client to agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum OutboundMessage {
    /// One base64 PCM capture block
    Media(String),
    Mark { mark: Mark },
    /// Typed user input
    Text { text: String },
}

/// Playback progress markers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mark {
    /// Local playback has gone idle
    AiSpeakStop,
}

impl OutboundMessage {
    pub fn ai_speak_stop() -> Self {
        OutboundMessage::Mark {
            mark: Mark::AiSpeakStop,
        }
    }

    pub fn to_json(&self) -> Result<String, NetworkError> {
        serde_json::to_string(self).map_err(|e| NetworkError::InvalidMessage(e.to_string()))
    }
}

/// Agent to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content", rename_all = "snake_case")]
pub enum InboundMessage {
    Audio(AudioChunk),
    /// Transcript of what the user said
    User(TextContent),
    /// Transcript of what the agent said
    Ai(TextContent),
    UserSpeaking(SpeakingStatus),
    ConversationStart(ConversationStart),
    /// Agent asks the client to stop talking over the user
    ///
    /// Any content is accepted and ignored.
    Pause(Option<serde_json::Value>),
}

impl InboundMessage {
    pub fn from_json(text: &str) -> Result<Self, NetworkError> {
        serde_json::from_str(text).map_err(|e| NetworkError::InvalidMessage(e.to_string()))
    }

    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            InboundMessage::Audio(_) => "audio",
            InboundMessage::User(_) => "user",
            InboundMessage::Ai(_) => "ai",
            InboundMessage::UserSpeaking(_) => "user_speaking",
            InboundMessage::ConversationStart(_) => "conversation_start",
            InboundMessage::Pause(_) => "pause",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioChunk {
    /// Base64 PCM
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextContent {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpeakingStatus {
    pub status: String,
}

impl SpeakingStatus {
    pub const SPEAKING: &'static str = "SPEAKING";

    pub fn is_speaking(&self) -> bool {
        self.status == Self::SPEAKING
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationStart {
    pub conversation_id: String,
}
