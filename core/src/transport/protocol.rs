/// Topic naming and frame shapes of the push channel
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which event stream of a conversation a topic carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Messages,
    Typing,
    Send,
}

impl StreamKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            StreamKind::Messages => "messages",
            StreamKind::Typing => "typing",
            StreamKind::Send => "send",
        }
    }
}

/// Push channel topic: `<kind>:<conversation_id>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    pub fn new(kind: StreamKind, conversation_id: &str) -> Self {
        Topic(format!("{}:{}", kind.prefix(), conversation_id))
    }

    pub fn messages(conversation_id: &str) -> Self {
        Self::new(StreamKind::Messages, conversation_id)
    }

    pub fn typing(conversation_id: &str) -> Self {
        Self::new(StreamKind::Typing, conversation_id)
    }

    pub fn send(conversation_id: &str) -> Self {
        Self::new(StreamKind::Send, conversation_id)
    }

    /// Split into stream kind and conversation id
    pub fn parse(&self) -> Option<(StreamKind, &str)> {
        let (prefix, conversation_id) = self.0.split_once(':')?;
        if conversation_id.is_empty() {
            return None;
        }
        let kind = match prefix {
            "messages" => StreamKind::Messages,
            "typing" => StreamKind::Typing,
            "send" => StreamKind::Send,
            _ => return None,
        };
        Some((kind, conversation_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Topic {
    fn from(s: &str) -> Self {
        Topic(s.to_string())
    }
}

/// One inbound event on the multiplexed connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushFrame {
    pub topic: Topic,
    pub payload: serde_json::Value,
}

impl PushFrame {
    pub fn new(topic: Topic, payload: serde_json::Value) -> Self {
        Self { topic, payload }
    }

    /// Serialize frame to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize frame from JSON bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

/// Payload published on `send:<conversation_id>`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub body: String,
}
