/// Per-conversation subscriptions on the shared push connection
use crate::error::SyncError;
use crate::normalize::{RawMessageEvent, RawTypingEvent};
use crate::transport::{PushChannel, PushFrame, StreamKind, Topic};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub type MessageHandler = Arc<dyn Fn(RawMessageEvent) + Send + Sync>;
pub type TypingHandler = Arc<dyn Fn(RawTypingEvent) + Send + Sync>;

/// Returned by the subscribe calls; releasing a superseded handle is a no-op
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    pub conversation_id: String,
    pub kind: StreamKind,
    generation: u64,
}

struct Slot<H> {
    handler: H,
    generation: u64,
}

#[derive(Default)]
struct ConversationSubs {
    messages: Option<Slot<MessageHandler>>,
    typing: Option<Slot<TypingHandler>>,
}

impl ConversationSubs {
    fn is_empty(&self) -> bool {
        self.messages.is_none() && self.typing.is_none()
    }
}

pub struct SubscriptionRegistry {
    channel: Arc<dyn PushChannel>,
    entries: BTreeMap<String, ConversationSubs>,
    /// Topics issued on the current connection
    live: HashSet<Topic>,
    connected: bool,
    next_generation: u64,
}

impl SubscriptionRegistry {
    pub fn new(channel: Arc<dyn PushChannel>) -> Self {
        Self {
            channel,
            entries: BTreeMap::new(),
            live: HashSet::new(),
            connected: false,
            next_generation: 1,
        }
    }

    /// Route `messages:<id>` events to `handler`, replacing any previous handler
    pub async fn subscribe_messages(
        &mut self,
        conversation_id: &str,
        handler: MessageHandler,
    ) -> SubscriptionHandle {
        let generation = self.bump();
        self.entries
            .entry(conversation_id.to_string())
            .or_default()
            .messages = Some(Slot { handler, generation });
        self.ensure_live(Topic::messages(conversation_id)).await;
        SubscriptionHandle {
            conversation_id: conversation_id.to_string(),
            kind: StreamKind::Messages,
            generation,
        }
    }

    /// Route `typing:<id>` events to `handler`, replacing any previous handler
    pub async fn subscribe_typing(
        &mut self,
        conversation_id: &str,
        handler: TypingHandler,
    ) -> SubscriptionHandle {
        let generation = self.bump();
        self.entries
            .entry(conversation_id.to_string())
            .or_default()
            .typing = Some(Slot { handler, generation });
        self.ensure_live(Topic::typing(conversation_id)).await;
        SubscriptionHandle {
            conversation_id: conversation_id.to_string(),
            kind: StreamKind::Typing,
            generation,
        }
    }

    /// Drop both streams of a conversation
    pub async fn unsubscribe(&mut self, conversation_id: &str) {
        if self.entries.remove(conversation_id).is_none() {
            return;
        }
        self.retire(Topic::messages(conversation_id)).await;
        self.retire(Topic::typing(conversation_id)).await;
        debug!(conversation_id, "unsubscribed");
    }

    /// Drop the stream behind `handle` if it has not been replaced since
    pub async fn release(&mut self, handle: &SubscriptionHandle) -> bool {
        let Some(entry) = self.entries.get_mut(&handle.conversation_id) else {
            return false;
        };
        let released = match handle.kind {
            StreamKind::Messages => take_if_current(&mut entry.messages, handle.generation),
            StreamKind::Typing => take_if_current(&mut entry.typing, handle.generation),
            StreamKind::Send => false,
        };
        if !released {
            return false;
        }
        if entry.is_empty() {
            self.entries.remove(&handle.conversation_id);
        }
        self.retire(Topic::new(handle.kind, &handle.conversation_id))
            .await;
        true
    }

    /// Re-issue every registered topic on a fresh connection
    pub async fn resubscribe_all(&mut self) -> usize {
        self.connected = true;
        self.live.clear();

        let mut topics = Vec::new();
        for (conversation_id, entry) in &self.entries {
            if entry.messages.is_some() {
                topics.push(Topic::messages(conversation_id));
            }
            if entry.typing.is_some() {
                topics.push(Topic::typing(conversation_id));
            }
        }

        info!(
            "Re-subscribing {} topic(s) for {} conversation(s)",
            topics.len(),
            self.entries.len()
        );
        let mut issued = 0;
        for topic in topics {
            if self.ensure_live(topic).await {
                issued += 1;
            }
        }
        issued
    }

    /// Connection went away; nothing is live any more
    pub fn on_disconnected(&mut self) {
        self.connected = false;
        self.live.clear();
    }

    /// Hand a frame to the handler registered for its topic
    pub fn dispatch(&self, frame: PushFrame) -> bool {
        let Some((kind, conversation_id)) = frame.topic.parse() else {
            debug!(topic = %frame.topic, "frame on unknown topic ignored");
            return false;
        };
        let Some(entry) = self.entries.get(conversation_id) else {
            debug!(topic = %frame.topic, "frame for unsubscribed conversation ignored");
            return false;
        };

        match kind {
            StreamKind::Messages => {
                let Some(slot) = &entry.messages else {
                    return false;
                };
                match serde_json::from_value::<RawMessageEvent>(frame.payload) {
                    Ok(raw) => {
                        (slot.handler)(raw);
                        true
                    }
                    Err(e) => {
                        let err = SyncError::NormalizationFailed(e.to_string());
                        warn!(topic = %frame.topic, "dropping message frame: {}", err);
                        false
                    }
                }
            }
            StreamKind::Typing => {
                let Some(slot) = &entry.typing else {
                    return false;
                };
                match serde_json::from_value::<RawTypingEvent>(frame.payload) {
                    Ok(raw) => {
                        (slot.handler)(raw);
                        true
                    }
                    Err(e) => {
                        let err = SyncError::NormalizationFailed(e.to_string());
                        warn!(topic = %frame.topic, "dropping typing frame: {}", err);
                        false
                    }
                }
            }
            StreamKind::Send => false,
        }
    }

    pub fn conversations(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn is_subscribed(&self, conversation_id: &str, kind: StreamKind) -> bool {
        self.entries
            .get(conversation_id)
            .map(|e| match kind {
                StreamKind::Messages => e.messages.is_some(),
                StreamKind::Typing => e.typing.is_some(),
                StreamKind::Send => false,
            })
            .unwrap_or(false)
    }

    pub fn is_live(&self, topic: &Topic) -> bool {
        self.live.contains(topic)
    }

    fn bump(&mut self) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        generation
    }

    async fn ensure_live(&mut self, topic: Topic) -> bool {
        if !self.connected {
            return false;
        }
        if self.live.contains(&topic) {
            return true;
        }
        match self.channel.subscribe(&topic).await {
            Ok(()) => {
                debug!(%topic, "subscribed");
                self.live.insert(topic);
                true
            }
            Err(e) => {
                // Picked up again by the next resubscribe_all
                warn!(%topic, "subscribe failed: {}", e);
                false
            }
        }
    }

    async fn retire(&mut self, topic: Topic) {
        if !self.live.remove(&topic) {
            return;
        }
        if let Err(e) = self.channel.unsubscribe(&topic).await {
            warn!(%topic, "unsubscribe failed: {}", e);
        }
    }
}

fn take_if_current<H>(slot: &mut Option<Slot<H>>, generation: u64) -> bool {
    match slot {
        Some(s) if s.generation == generation => {
            *slot = None;
            true
        }
        _ => false,
    }
}
