/// Canonical conversation and message types shared by every component
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Prefix of locally issued message ids; never produced by the backend
pub const TEMP_ID_MARKER: &str = "tmp:";

pub type TempId = String;

/// True when `id` was issued locally for an optimistic message
pub fn is_temporary_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_MARKER)
}

/// Issue a fresh temporary id
pub fn new_temp_id() -> TempId {
    format!("{}{}", TEMP_ID_MARKER, uuid::Uuid::new_v4())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConversationKind {
    Direct,
    Group,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub display_name: String,
    pub avatar: Option<String>,
}

/// Preview of the newest message (for list view)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastMessage {
    pub sender_id: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    /// Server-issued, stable
    pub id: String,
    pub kind: ConversationKind,
    pub display_name: String,
    pub avatar: Option<String>,
    pub participants: Vec<Participant>,
    pub last_message: Option<LastMessage>,
    pub last_activity: Option<DateTime<Utc>>,
    pub unread_count: u32,
}

impl Conversation {
    pub fn participant(&self, user_id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.id == user_id)
    }
}

/// Where a message stands in the delivery lifecycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Origin {
    /// Created locally, waiting for the backend (spinner shown)
    Pending,
    /// Created locally, confirmation window elapsed; may still be confirmed later
    Unconfirmed,
    /// Accepted by the backend; id is permanent
    Confirmed,
    /// Fallback delivery rejected; user must resend
    Failed { reason: String },
}

impl Origin {
    /// Local entry still waiting for its confirmed counterpart
    pub fn is_local(&self) -> bool {
        matches!(self, Origin::Pending | Origin::Unconfirmed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub sender_name: Option<String>,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub mine: bool,
    pub origin: Origin,
}

impl Message {
    /// Build an optimistic message for a send that has not been confirmed yet
    pub fn optimistic(
        conversation_id: &str,
        sender_id: &str,
        body: &str,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: new_temp_id(),
            conversation_id: conversation_id.to_string(),
            sender_id: sender_id.to_string(),
            sender_name: None,
            body: body.to_string(),
            created_at,
            mine: true,
            origin: Origin::Pending,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.origin == Origin::Pending
    }

    pub fn is_confirmed(&self) -> bool {
        self.origin == Origin::Confirmed
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.origin, Origin::Failed { .. })
    }

    pub fn summary(&self) -> LastMessage {
        LastMessage {
            sender_id: self.sender_id.clone(),
            body: self.body.clone(),
            created_at: self.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temp_ids_are_marked_and_unique() {
        let a = new_temp_id();
        let b = new_temp_id();
        assert!(is_temporary_id(&a));
        assert_ne!(a, b);
        assert!(!is_temporary_id("m-42"));
    }

    #[test]
    fn test_origin_serialization() {
        let json = serde_json::to_value(Origin::Failed {
            reason: "rejected".into(),
        })
        .unwrap();
        assert_eq!(json["state"], "failed");
        assert_eq!(json["reason"], "rejected");
        assert!(Origin::Unconfirmed.is_local());
        assert!(!Origin::Confirmed.is_local());
    }
}
