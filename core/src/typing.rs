/// Ephemeral typing indicators with expiry deadlines
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

/// What `on_typing_event` did, so the caller can (re)arm or cancel its timer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypingChange {
    /// Entry added or refreshed; expires at the deadline
    Started { deadline: Instant },
    /// Entry removed
    Stopped,
    /// Self event or stop for a user who was not typing
    Unchanged,
}

#[derive(Debug)]
pub struct TypingTracker {
    self_id: String,
    timeout: Duration,
    /// conversation -> user -> deadline
    typing: HashMap<String, BTreeMap<String, Instant>>,
}

impl TypingTracker {
    pub fn new(self_id: impl Into<String>, timeout: Duration) -> Self {
        Self {
            self_id: self_id.into(),
            timeout,
            typing: HashMap::new(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn on_typing_event(
        &mut self,
        conversation_id: &str,
        user_id: &str,
        is_typing: bool,
        now: Instant,
    ) -> TypingChange {
        if user_id == self.self_id {
            return TypingChange::Unchanged;
        }

        if is_typing {
            let deadline = now + self.timeout;
            self.typing
                .entry(conversation_id.to_string())
                .or_default()
                .insert(user_id.to_string(), deadline);
            trace!(conversation_id, user_id, "typing refreshed");
            return TypingChange::Started { deadline };
        }

        let removed = self.remove(conversation_id, user_id);
        if removed {
            TypingChange::Stopped
        } else {
            TypingChange::Unchanged
        }
    }

    /// Remove the entry only if its deadline has passed; a refreshed entry survives stale timers
    pub fn expire(&mut self, conversation_id: &str, user_id: &str, now: Instant) -> bool {
        let due = self
            .typing
            .get(conversation_id)
            .and_then(|users| users.get(user_id))
            .map(|deadline| *deadline <= now)
            .unwrap_or(false);
        if due {
            self.remove(conversation_id, user_id);
        }
        due
    }

    /// Users typing in `conversation_id`, ordered by id
    pub fn typing_users(&self, conversation_id: &str) -> Vec<String> {
        self.typing
            .get(conversation_id)
            .map(|users| users.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_typing(&self, conversation_id: &str, user_id: &str) -> bool {
        self.typing
            .get(conversation_id)
            .map(|users| users.contains_key(user_id))
            .unwrap_or(false)
    }

    /// Drop everything for a conversation; returns the users that were typing
    pub fn clear(&mut self, conversation_id: &str) -> Vec<String> {
        self.typing
            .remove(conversation_id)
            .map(|users| users.into_keys().collect())
            .unwrap_or_default()
    }

    pub fn conversations(&self) -> impl Iterator<Item = &String> {
        self.typing.keys()
    }

    fn remove(&mut self, conversation_id: &str, user_id: &str) -> bool {
        let Some(users) = self.typing.get_mut(conversation_id) else {
            return false;
        };
        let removed = users.remove(user_id).is_some();
        if users.is_empty() {
            self.typing.remove(conversation_id);
        }
        removed
    }
}
