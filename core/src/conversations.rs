/// Conversation list with last-message summaries
use crate::model::{Conversation, Message};
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct ConversationDirectory {
    conversations: HashMap<String, Conversation>,
}

impl ConversationDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the list with a fresh backend listing.
    ///
    /// Summaries newer than the listing (pushed while the request was in flight) are kept.
    pub fn replace_all(&mut self, conversations: Vec<Conversation>) {
        let mut previous = std::mem::take(&mut self.conversations);
        for mut conv in conversations {
            if let Some(old) = previous.remove(&conv.id) {
                if old.last_activity > conv.last_activity {
                    conv.last_activity = old.last_activity;
                    conv.last_message = old.last_message;
                }
            }
            self.conversations.insert(conv.id.clone(), conv);
        }
    }

    pub fn upsert(&mut self, conversation: Conversation) {
        self.conversations
            .insert(conversation.id.clone(), conversation);
    }

    pub fn remove(&mut self, conversation_id: &str) -> Option<Conversation> {
        self.conversations.remove(conversation_id)
    }

    pub fn get(&self, conversation_id: &str) -> Option<&Conversation> {
        self.conversations.get(conversation_id)
    }

    pub fn contains(&self, conversation_id: &str) -> bool {
        self.conversations.contains_key(conversation_id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.conversations.keys().cloned().collect()
    }

    pub fn participant_name(&self, conversation_id: &str, user_id: &str) -> Option<String> {
        self.get(conversation_id)?
            .participant(user_id)
            .map(|p| p.display_name.clone())
    }

    /// Update summary and activity if `message` is the newest seen
    pub fn record_activity(&mut self, message: &Message) -> bool {
        let Some(conv) = self.conversations.get_mut(&message.conversation_id) else {
            return false;
        };
        if conv
            .last_activity
            .map(|t| t > message.created_at)
            .unwrap_or(false)
        {
            return false;
        }
        conv.last_activity = Some(message.created_at);
        conv.last_message = Some(message.summary());
        true
    }

    /// Newest activity first; conversations without activity last, then by id
    pub fn sorted(&self) -> Vec<Conversation> {
        let mut list: Vec<Conversation> = self.conversations.values().cloned().collect();
        list.sort_by(|a, b| {
            b.last_activity
                .cmp(&a.last_activity)
                .then_with(|| a.id.cmp(&b.id))
        });
        list
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }
}
