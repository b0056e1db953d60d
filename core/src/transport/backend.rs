/// Request/response operations consumed by the engine
use crate::error::BackendError;
use crate::model::ConversationKind;
use crate::normalize::{RawConversation, RawMessageEvent};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One page of history; page 1 is the newest. Messages are oldest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePage {
    pub messages: Vec<RawMessageEvent>,
    pub page: u32,
    pub total_pages: u32,
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn list_conversations(&self) -> BackendResult<Vec<RawConversation>>;

    async fn get_messages(
        &self,
        conversation_id: &str,
        page: u32,
        page_size: u32,
    ) -> BackendResult<MessagePage>;

    /// Fallback send path used when the live channel is unavailable
    async fn send_message(&self, conversation_id: &str, body: &str) -> BackendResult<RawMessageEvent>;

    async fn mark_read(&self, message_id: &str) -> BackendResult<()>;

    async fn get_unread_count(&self, conversation_id: &str) -> BackendResult<u32>;

    async fn create_conversation(
        &self,
        kind: ConversationKind,
        participant_ids: &[String],
    ) -> BackendResult<RawConversation>;

    async fn leave_conversation(&self, conversation_id: &str) -> BackendResult<()>;
}
