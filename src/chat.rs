//! Chat messages and the room-to-topic convention.
//!
//! Every room is a gossip topic. The default room is the bare
//! [`CHAT_TOPIC`]; any other room `r` lives on `universal-connectivity/r`.
//!
//! Payloads are JSON objects `{ "sender", "text", "timestamp" }` with the
//! timestamp in milliseconds. Older peers publish bare UTF-8 text; those
//! messages decode with the publishing peer as sender and the receipt time
//! as timestamp.

use serde::{Deserialize, Serialize};

use crate::identity::{PeerId, now_ms};

pub const CHAT_TOPIC: &str = "universal-connectivity";

pub const DEFAULT_ROOM: &str = "default";

/// Longest chat text accepted for sending.
pub const MAX_CHAT_TEXT: usize = 4096;

/// Gossip topic carrying `room`. Empty names and [`DEFAULT_ROOM`] both map
/// to the default topic.
pub fn topic_for_room(room: &str) -> String {
    let room = room.trim();
    if room.is_empty() || room == DEFAULT_ROOM {
        CHAT_TOPIC.to_string()
    } else {
        format!("{CHAT_TOPIC}/{room}")
    }
}

/// Inverse of [`topic_for_room`]. Returns `None` for non-chat topics.
pub fn room_for_topic(topic: &str) -> Option<&str> {
    if topic == CHAT_TOPIC {
        return Some(DEFAULT_ROOM);
    }
    topic
        .strip_prefix(CHAT_TOPIC)
        .and_then(|rest| rest.strip_prefix('/'))
        .filter(|room| !room.is_empty())
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub sender: String,
    pub text: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

impl ChatMessage {
    pub fn new(sender: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            text: text.into(),
            timestamp: now_ms(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode a payload published by `source`. Returns `None` when the
    /// payload is neither a JSON chat message nor UTF-8 text.
    pub fn decode(data: &[u8], source: &PeerId) -> Option<Self> {
        if let Ok(message) = serde_json::from_slice::<ChatMessage>(data) {
            return Some(message);
        }
        let text = std::str::from_utf8(data).ok()?;
        Some(Self {
            sender: source.short(),
            text: text.to_string(),
            timestamp: now_ms(),
        })
    }
}
