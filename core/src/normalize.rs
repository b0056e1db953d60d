/// Normalization of raw wire payloads into canonical `Message`/`Conversation` values
///
/// Push events and fetched records arrive as loosely-typed JSON. Every field is optional at the
/// decode layer; this module decides what is required and rejects anything else with
/// `SyncError::NormalizationFailed` instead of guessing.
use crate::error::{Result, SyncError};
use crate::model::{
    is_temporary_id, Conversation, ConversationKind, LastMessage, Message, Origin, Participant,
};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// `{id, conversationId, senderId, body, createdAt}` as pushed or fetched
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMessageEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// RFC 3339 string or epoch milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<serde_json::Value>,
}

/// `{userId, isTyping}`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTypingEvent {
    pub user_id: Option<String>,
    pub is_typing: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawParticipant {
    pub id: Option<String>,
    pub display_name: Option<String>,
    pub avatar: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawConversation {
    pub id: Option<String>,
    pub kind: Option<String>,
    pub name: Option<String>,
    pub avatar: Option<String>,
    #[serde(default)]
    pub participants: Vec<RawParticipant>,
    pub last_message: Option<RawMessageEvent>,
    pub last_activity: Option<serde_json::Value>,
    pub unread_count: Option<u32>,
}

/// Turns raw payloads into canonical values from the signed-in user's viewpoint
#[derive(Debug, Clone, Copy)]
pub struct Normalizer<'a> {
    self_id: &'a str,
}

impl<'a> Normalizer<'a> {
    pub fn new(self_id: &'a str) -> Self {
        Self { self_id }
    }

    /// Normalize a message record.
    ///
    /// `topic_conversation` is the conversation the payload was routed under; a payload that names
    /// a different conversation is rejected. `conversation` resolves the sender's display name.
    pub fn message(
        &self,
        raw: &RawMessageEvent,
        topic_conversation: Option<&str>,
        conversation: Option<&Conversation>,
    ) -> Result<Message> {
        let id = required(&raw.id, "id")?;
        if is_temporary_id(&id) {
            return Err(SyncError::NormalizationFailed(format!(
                "server id {} uses the temporary-id marker",
                id
            )));
        }

        let named = raw
            .conversation_id
            .as_deref()
            .filter(|c| !c.trim().is_empty());
        let conversation_id = match (named, topic_conversation) {
            (Some(c), Some(t)) if c != t => {
                return Err(SyncError::NormalizationFailed(format!(
                    "message {} names conversation {} but arrived on {}",
                    id, c, t
                )))
            }
            (Some(c), _) => c.to_string(),
            (None, Some(t)) => t.to_string(),
            (None, None) => return Err(missing("conversationId")),
        };

        let sender_id = required(&raw.sender_id, "senderId")?;
        let body = raw.body.clone().ok_or_else(|| missing("body"))?;
        let created_at = parse_timestamp(raw.created_at.as_ref().ok_or_else(|| missing("createdAt"))?)?;

        let sender_name = conversation
            .and_then(|c| c.participant(&sender_id))
            .map(|p| p.display_name.clone());

        Ok(Message {
            id,
            conversation_id,
            mine: sender_id == self.self_id,
            sender_id,
            sender_name,
            body,
            created_at,
            origin: Origin::Confirmed,
        })
    }

    /// Normalize a typing event into `(user_id, is_typing)`
    pub fn typing(&self, raw: &RawTypingEvent) -> Result<(String, bool)> {
        let user_id = required(&raw.user_id, "userId")?;
        let is_typing = raw.is_typing.ok_or_else(|| missing("isTyping"))?;
        Ok((user_id, is_typing))
    }

    /// Normalize a conversation record
    pub fn conversation(&self, raw: &RawConversation) -> Result<Conversation> {
        let id = required(&raw.id, "id")?;

        let mut participants = Vec::with_capacity(raw.participants.len());
        for p in &raw.participants {
            let pid = required(&p.id, "participants[].id")?;
            participants.push(Participant {
                display_name: p
                    .display_name
                    .clone()
                    .filter(|n| !n.trim().is_empty())
                    .unwrap_or_else(|| pid.clone()),
                id: pid,
                avatar: p.avatar.clone(),
            });
        }

        let kind = match raw.kind.as_deref().map(str::to_ascii_uppercase).as_deref() {
            Some("DIRECT") => ConversationKind::Direct,
            Some("GROUP") => ConversationKind::Group,
            Some(other) => {
                return Err(SyncError::NormalizationFailed(format!(
                    "conversation {} has unknown kind {}",
                    id, other
                )))
            }
            None if participants.len() > 2 => ConversationKind::Group,
            None => ConversationKind::Direct,
        };

        let display_name = raw
            .name
            .clone()
            .filter(|n| !n.trim().is_empty())
            .or_else(|| {
                // Direct threads are named after the other party
                participants
                    .iter()
                    .find(|p| p.id != self.self_id)
                    .map(|p| p.display_name.clone())
            })
            .unwrap_or_else(|| id.clone());

        let last_message = raw
            .last_message
            .as_ref()
            .and_then(|m| match self.message(m, Some(&id), None) {
                Ok(m) => Some(m.summary()),
                Err(e) => {
                    tracing::warn!(conversation_id = %id, "dropping last-message preview: {}", e);
                    None
                }
            });

        let last_activity = match raw.last_activity.as_ref() {
            Some(v) => Some(parse_timestamp(v)?),
            None => last_message.as_ref().map(|m: &LastMessage| m.created_at),
        };

        Ok(Conversation {
            id,
            kind,
            display_name,
            avatar: raw.avatar.clone(),
            participants,
            last_message,
            last_activity,
            unread_count: raw.unread_count.unwrap_or(0),
        })
    }
}

/// Parse an RFC 3339 string or an epoch-milliseconds number
pub fn parse_timestamp(value: &serde_json::Value) -> Result<DateTime<Utc>> {
    match value {
        serde_json::Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| SyncError::NormalizationFailed(format!("bad timestamp {:?}: {}", s, e))),
        serde_json::Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .ok_or_else(|| SyncError::NormalizationFailed(format!("bad timestamp {}", n))),
        other => Err(SyncError::NormalizationFailed(format!(
            "bad timestamp {}",
            other
        ))),
    }
}

fn required(field: &Option<String>, name: &str) -> Result<String> {
    match field.as_deref() {
        Some(v) if !v.trim().is_empty() => Ok(v.to_string()),
        _ => Err(missing(name)),
    }
}

fn missing(name: &str) -> SyncError {
    SyncError::NormalizationFailed(format!("missing field {}", name))
}
