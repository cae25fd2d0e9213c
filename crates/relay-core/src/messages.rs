use chrono::{DateTime, TimeZone};
use serde::{Deserialize, Serialize};

/// Format used for the server-assigned broadcast timestamp.
pub const BROADCAST_TIME_FORMAT: &str = "%H:%M";

/// Inbound chat frame (client → server).
///
/// Missing fields decode as empty strings; rejecting them is the hub's job.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub content: String,
}

impl ChatMessage {
    pub fn new(username: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            content: content.into(),
        }
    }

    /// Decode a single wire frame.
    pub fn decode(frame: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(frame)
    }
}

/// Outbound chat frame (server → client), built after the message was persisted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastMessage {
    pub username: String,
    pub content: String,
    pub created_at: String,
}

impl BroadcastMessage {
    pub fn stamped<Tz>(message: ChatMessage, now: DateTime<Tz>) -> Self
    where
        Tz: TimeZone,
        Tz::Offset: std::fmt::Display,
    {
        Self {
            username: message.username,
            content: message.content,
            created_at: now.format(BROADCAST_TIME_FORMAT).to_string(),
        }
    }
}

/// A persisted message as returned by history queries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub username: String,
    pub content: String,
    pub created_at: String,
}
