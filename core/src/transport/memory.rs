/// In-memory backend and push channel
///
/// Both doubles share one message store so that a message published on the live channel also
/// shows up in later history fetches, the way a real server behaves. Used by the integration tests
/// and by the demo binary.
use crate::error::{BackendError, Result, SyncError};
use crate::model::ConversationKind;
use crate::normalize::{RawConversation, RawMessageEvent, RawParticipant, RawTypingEvent};
use crate::transport::backend::{BackendResult, ChatBackend, MessagePage};
use crate::transport::channel::PushChannel;
use crate::transport::protocol::{OutboundMessage, PushFrame, StreamKind, Topic};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::debug;

/// Backend operations that can be made to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendOp {
    ListConversations,
    GetMessages,
    SendMessage,
    MarkRead,
    GetUnreadCount,
    CreateConversation,
    LeaveConversation,
}

struct BackendState {
    self_id: String,
    conversations: Vec<RawConversation>,
    messages: HashMap<String, Vec<RawMessageEvent>>,
    unread: HashMap<String, u32>,
    next_id: u64,
    clock: DateTime<Utc>,
    failures: HashMap<BackendOp, BackendError>,
    marked_read: Vec<String>,
    fallback_sends: Vec<(String, String)>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Clone)]
pub struct InMemoryBackend {
    inner: Arc<Mutex<BackendState>>,
}

impl InMemoryBackend {
    pub fn new(self_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BackendState {
                self_id: self_id.into(),
                conversations: Vec::new(),
                messages: HashMap::new(),
                unread: HashMap::new(),
                next_id: 1,
                clock: Utc::now() - ChronoDuration::days(1),
                failures: HashMap::new(),
                marked_read: Vec::new(),
                fallback_sends: Vec::new(),
            })),
        }
    }

    pub fn self_id(&self) -> String {
        lock(&self.inner).self_id.clone()
    }

    /// Register a conversation; `participants` are `(id, display name)` pairs
    pub fn add_conversation(&self, id: &str, kind: ConversationKind, participants: &[(&str, &str)]) {
        let raw = RawConversation {
            id: Some(id.to_string()),
            kind: Some(kind_label(kind).to_string()),
            participants: participants
                .iter()
                .map(|(pid, name)| RawParticipant {
                    id: Some(pid.to_string()),
                    display_name: Some(name.to_string()),
                    avatar: None,
                })
                .collect(),
            ..Default::default()
        };
        let mut state = lock(&self.inner);
        state.conversations.retain(|c| c.id.as_deref() != Some(id));
        state.conversations.push(raw);
        state.messages.entry(id.to_string()).or_default();
    }

    /// Append a message to a conversation's history and return its record
    pub fn store_message(&self, conversation_id: &str, sender_id: &str, body: &str) -> RawMessageEvent {
        let mut state = lock(&self.inner);
        state.clock += ChronoDuration::seconds(1);
        let record = RawMessageEvent {
            id: Some(format!("m{}", state.next_id)),
            conversation_id: Some(conversation_id.to_string()),
            sender_id: Some(sender_id.to_string()),
            body: Some(body.to_string()),
            created_at: Some(serde_json::Value::String(state.clock.to_rfc3339())),
        };
        state.next_id += 1;
        state
            .messages
            .entry(conversation_id.to_string())
            .or_default()
            .push(record.clone());
        if sender_id != state.self_id {
            *state.unread.entry(conversation_id.to_string()).or_insert(0) += 1;
        }
        record
    }

    /// The next call of `op` fails with `err`
    pub fn fail_next(&self, op: BackendOp, err: BackendError) {
        lock(&self.inner).failures.insert(op, err);
    }

    pub fn set_unread(&self, conversation_id: &str, count: u32) {
        lock(&self.inner).unread.insert(conversation_id.to_string(), count);
    }

    pub fn marked_read(&self) -> Vec<String> {
        lock(&self.inner).marked_read.clone()
    }

    /// `(conversation, body)` pairs received through `send_message`
    pub fn fallback_sends(&self) -> Vec<(String, String)> {
        lock(&self.inner).fallback_sends.clone()
    }

    pub fn message_count(&self, conversation_id: &str) -> usize {
        lock(&self.inner)
            .messages
            .get(conversation_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    fn take_failure(&self, op: BackendOp) -> BackendResult<()> {
        match lock(&self.inner).failures.remove(&op) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn kind_label(kind: ConversationKind) -> &'static str {
    match kind {
        ConversationKind::Direct => "DIRECT",
        ConversationKind::Group => "GROUP",
    }
}

#[async_trait]
impl ChatBackend for InMemoryBackend {
    async fn list_conversations(&self) -> BackendResult<Vec<RawConversation>> {
        self.take_failure(BackendOp::ListConversations)?;
        let state = lock(&self.inner);
        Ok(state
            .conversations
            .iter()
            .map(|c| {
                let id = c.id.clone().unwrap_or_default();
                let mut c = c.clone();
                c.last_message = state.messages.get(&id).and_then(|m| m.last().cloned());
                c.unread_count = state.unread.get(&id).copied();
                c
            })
            .collect())
    }

    async fn get_messages(
        &self,
        conversation_id: &str,
        page: u32,
        page_size: u32,
    ) -> BackendResult<MessagePage> {
        self.take_failure(BackendOp::GetMessages)?;
        let state = lock(&self.inner);
        let all = state
            .messages
            .get(conversation_id)
            .ok_or_else(|| BackendError::status(404, "conversation not found"))?;

        let page_size = page_size.max(1) as usize;
        let total_pages = all.len().div_ceil(page_size).max(1) as u32;
        let skip_newest = (page.max(1) as usize - 1) * page_size;
        let end = all.len().saturating_sub(skip_newest);
        let start = end.saturating_sub(page_size);

        Ok(MessagePage {
            messages: all[start..end].to_vec(),
            page,
            total_pages,
        })
    }

    async fn send_message(&self, conversation_id: &str, body: &str) -> BackendResult<RawMessageEvent> {
        self.take_failure(BackendOp::SendMessage)?;
        let self_id = {
            let mut state = lock(&self.inner);
            if !state.messages.contains_key(conversation_id) {
                return Err(BackendError::status(404, "conversation not found"));
            }
            state
                .fallback_sends
                .push((conversation_id.to_string(), body.to_string()));
            state.self_id.clone()
        };
        Ok(self.store_message(conversation_id, &self_id, body))
    }

    async fn mark_read(&self, message_id: &str) -> BackendResult<()> {
        self.take_failure(BackendOp::MarkRead)?;
        let mut state = lock(&self.inner);
        let conversation = state
            .messages
            .iter()
            .find(|(_, msgs)| msgs.iter().any(|m| m.id.as_deref() == Some(message_id)))
            .map(|(c, _)| c.clone());
        if let Some(c) = conversation {
            state.unread.insert(c, 0);
        }
        state.marked_read.push(message_id.to_string());
        Ok(())
    }

    async fn get_unread_count(&self, conversation_id: &str) -> BackendResult<u32> {
        self.take_failure(BackendOp::GetUnreadCount)?;
        Ok(lock(&self.inner)
            .unread
            .get(conversation_id)
            .copied()
            .unwrap_or(0))
    }

    async fn create_conversation(
        &self,
        kind: ConversationKind,
        participant_ids: &[String],
    ) -> BackendResult<RawConversation> {
        self.take_failure(BackendOp::CreateConversation)?;
        let (id, self_id) = {
            let mut state = lock(&self.inner);
            let id = format!("c{}", state.next_id);
            state.next_id += 1;
            (id, state.self_id.clone())
        };
        let mut members: Vec<(&str, &str)> = vec![(self_id.as_str(), self_id.as_str())];
        for pid in participant_ids {
            if pid != &self_id {
                members.push((pid.as_str(), pid.as_str()));
            }
        }
        self.add_conversation(&id, kind, &members);
        let state = lock(&self.inner);
        state
            .conversations
            .iter()
            .find(|c| c.id.as_deref() == Some(id.as_str()))
            .cloned()
            .ok_or_else(|| BackendError::status(500, "conversation vanished"))
    }

    async fn leave_conversation(&self, conversation_id: &str) -> BackendResult<()> {
        self.take_failure(BackendOp::LeaveConversation)?;
        let mut state = lock(&self.inner);
        let before = state.conversations.len();
        state
            .conversations
            .retain(|c| c.id.as_deref() != Some(conversation_id));
        if state.conversations.len() == before {
            return Err(BackendError::status(404, "conversation not found"));
        }
        state.messages.remove(conversation_id);
        Ok(())
    }
}

struct ChannelState {
    reachable: bool,
    echo: bool,
    fail_publish: bool,
    outbound: Option<mpsc::UnboundedSender<PushFrame>>,
    subscriptions: HashSet<Topic>,
    subscribe_calls: Vec<Topic>,
    published: Vec<(Topic, serde_json::Value)>,
    opens: u32,
}

/// Push channel double backed by an `InMemoryBackend`.
///
/// Publishing on `send:<id>` stores the message and, when echo is on, pushes it back on
/// `messages:<id>` the way the real server confirms a live send.
#[derive(Clone)]
pub struct InMemoryChannel {
    backend: InMemoryBackend,
    inner: Arc<Mutex<ChannelState>>,
}

impl InMemoryChannel {
    pub fn new(backend: InMemoryBackend) -> Self {
        Self {
            backend,
            inner: Arc::new(Mutex::new(ChannelState {
                reachable: true,
                echo: true,
                fail_publish: false,
                outbound: None,
                subscriptions: HashSet::new(),
                subscribe_calls: Vec::new(),
                published: Vec::new(),
                opens: 0,
            })),
        }
    }

    /// While unreachable, `open` fails
    pub fn set_reachable(&self, reachable: bool) {
        lock(&self.inner).reachable = reachable;
    }

    pub fn set_echo(&self, echo: bool) {
        lock(&self.inner).echo = echo;
    }

    pub fn set_fail_publish(&self, fail: bool) {
        lock(&self.inner).fail_publish = fail;
    }

    pub fn is_open(&self) -> bool {
        lock(&self.inner).outbound.is_some()
    }

    pub fn is_subscribed(&self, topic: &Topic) -> bool {
        lock(&self.inner).subscriptions.contains(topic)
    }

    pub fn subscribe_calls(&self) -> Vec<Topic> {
        lock(&self.inner).subscribe_calls.clone()
    }

    pub fn published(&self) -> Vec<(Topic, serde_json::Value)> {
        lock(&self.inner).published.clone()
    }

    pub fn open_count(&self) -> u32 {
        lock(&self.inner).opens
    }

    /// Simulate the server side dropping the connection
    pub fn drop_connection(&self) {
        let mut state = lock(&self.inner);
        state.outbound = None;
        state.subscriptions.clear();
    }

    /// Deliver a frame if the topic is subscribed on the live connection
    pub fn deliver(&self, topic: &Topic, payload: serde_json::Value) -> bool {
        let state = lock(&self.inner);
        if !state.subscriptions.contains(topic) {
            return false;
        }
        match &state.outbound {
            Some(tx) => tx.send(PushFrame::new(topic.clone(), payload)).is_ok(),
            None => false,
        }
    }

    /// Store a message from `sender_id` and push it to subscribers
    pub fn inject_message(&self, conversation_id: &str, sender_id: &str, body: &str) -> RawMessageEvent {
        let record = self.backend.store_message(conversation_id, sender_id, body);
        let payload = serde_json::to_value(&record).unwrap_or(serde_json::Value::Null);
        self.deliver(&Topic::messages(conversation_id), payload);
        record
    }

    pub fn push_typing(&self, conversation_id: &str, user_id: &str, is_typing: bool) -> bool {
        let event = RawTypingEvent {
            user_id: Some(user_id.to_string()),
            is_typing: Some(is_typing),
        };
        let payload = serde_json::to_value(&event).unwrap_or(serde_json::Value::Null);
        self.deliver(&Topic::typing(conversation_id), payload)
    }
}

#[async_trait]
impl PushChannel for InMemoryChannel {
    async fn open(&self) -> Result<mpsc::UnboundedReceiver<PushFrame>> {
        let mut state = lock(&self.inner);
        if !state.reachable {
            return Err(SyncError::TransportUnavailable(
                "push server unreachable".to_string(),
            ));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.outbound = Some(tx);
        state.subscriptions.clear();
        state.opens += 1;
        Ok(rx)
    }

    async fn close(&self) {
        self.drop_connection();
    }

    async fn subscribe(&self, topic: &Topic) -> Result<()> {
        let mut state = lock(&self.inner);
        if state.outbound.is_none() {
            return Err(SyncError::TransportUnavailable("not connected".to_string()));
        }
        state.subscribe_calls.push(topic.clone());
        state.subscriptions.insert(topic.clone());
        Ok(())
    }

    async fn unsubscribe(&self, topic: &Topic) -> Result<()> {
        lock(&self.inner).subscriptions.remove(topic);
        Ok(())
    }

    async fn publish(&self, topic: &Topic, payload: serde_json::Value) -> Result<()> {
        let echo = {
            let mut state = lock(&self.inner);
            if state.outbound.is_none() {
                return Err(SyncError::TransportUnavailable("not connected".to_string()));
            }
            if state.fail_publish {
                return Err(SyncError::TransportUnavailable("publish rejected".to_string()));
            }
            state.published.push((topic.clone(), payload.clone()));
            state.echo
        };

        if let Some((StreamKind::Send, conversation_id)) = topic.parse() {
            let outbound: OutboundMessage = serde_json::from_value(payload)?;
            let self_id = self.backend.self_id();
            let record = self
                .backend
                .store_message(conversation_id, &self_id, &outbound.body);
            debug!(conversation_id, message_id = ?record.id, "in-memory channel stored live send");
            if echo {
                let value = serde_json::to_value(&record)?;
                self.deliver(&Topic::messages(conversation_id), value);
            }
        }
        Ok(())
    }
}
