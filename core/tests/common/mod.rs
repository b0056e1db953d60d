#![allow(dead_code)]
//! Shared harness for the engine integration tests

use async_trait::async_trait;
use chatsync_core::model::ConversationKind;
use chatsync_core::normalize::{RawConversation, RawMessageEvent};
use chatsync_core::transport::backend::BackendResult;
use chatsync_core::transport::{ChatBackend, MessagePage, Topic};
use chatsync_core::{InMemoryBackend, InMemoryChannel, SyncConfig, SyncEngine, SyncEvent, SyncHandle, SyncSnapshot};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

pub const ME: &str = "me";

pub struct Harness {
    pub backend: InMemoryBackend,
    pub channel: InMemoryChannel,
    pub handle: SyncHandle,
}

pub fn config() -> SyncConfig {
    SyncConfig {
        reconnect_jitter: Duration::ZERO,
        ..SyncConfig::for_user(ME)
    }
}

/// Backend with a direct conversation `c1` (me, Bob) and a group `c2` (me, Bob, Ann)
pub fn seeded_backend() -> InMemoryBackend {
    let backend = InMemoryBackend::new(ME);
    backend.add_conversation("c1", ConversationKind::Direct, &[(ME, "Me"), ("bob", "Bob")]);
    backend.add_conversation(
        "c2",
        ConversationKind::Group,
        &[(ME, "Me"), ("bob", "Bob"), ("ann", "Ann")],
    );
    backend
}

pub async fn start(backend: InMemoryBackend, config: SyncConfig) -> Harness {
    let channel = InMemoryChannel::new(backend.clone());
    let (handle, _task) = SyncEngine::spawn(config, Arc::new(backend.clone()), Arc::new(channel.clone()))
        .expect("engine should start");
    Harness {
        backend,
        channel,
        handle,
    }
}

/// Same as `start` but the engine talks to a `SlowBackend` wrapping `backend`
pub async fn start_slow(backend: InMemoryBackend) -> (Harness, SlowBackend) {
    let channel = InMemoryChannel::new(backend.clone());
    let slow = SlowBackend::new(backend.clone(), channel.clone());
    let (handle, _task) = SyncEngine::spawn(config(), Arc::new(slow.clone()), Arc::new(channel.clone()))
        .expect("engine should start");
    (
        Harness {
            backend,
            channel,
            handle,
        },
        slow,
    )
}

#[derive(Debug, Clone, Copy, Default)]
struct Delays {
    history: Duration,
    send: Duration,
    /// Push the stored message on `messages:<id>` this long after a fallback send arrives
    send_echo: Option<Duration>,
}

/// Backend whose history and fallback-send responses arrive late.
///
/// The answer is computed when the call arrives, so a response can be older than pushes that
/// overtake it.
#[derive(Clone)]
pub struct SlowBackend {
    inner: InMemoryBackend,
    channel: InMemoryChannel,
    delays: Arc<Mutex<Delays>>,
}

impl SlowBackend {
    pub fn new(inner: InMemoryBackend, channel: InMemoryChannel) -> Self {
        Self {
            inner,
            channel,
            delays: Arc::new(Mutex::new(Delays::default())),
        }
    }

    pub fn set_history_delay(&self, delay: Duration) {
        self.delays.lock().unwrap().history = delay;
    }

    pub fn set_send_delay(&self, delay: Duration) {
        self.delays.lock().unwrap().send = delay;
    }

    pub fn set_send_echo(&self, after: Option<Duration>) {
        self.delays.lock().unwrap().send_echo = after;
    }

    fn delays(&self) -> Delays {
        *self.delays.lock().unwrap()
    }
}

#[async_trait]
impl ChatBackend for SlowBackend {
    async fn list_conversations(&self) -> BackendResult<Vec<RawConversation>> {
        self.inner.list_conversations().await
    }

    async fn get_messages(&self, conversation_id: &str, page: u32, page_size: u32) -> BackendResult<MessagePage> {
        let result = self.inner.get_messages(conversation_id, page, page_size).await;
        tokio::time::sleep(self.delays().history).await;
        result
    }

    async fn send_message(&self, conversation_id: &str, body: &str) -> BackendResult<RawMessageEvent> {
        let delays = self.delays();
        let result = self.inner.send_message(conversation_id, body).await;
        if let (Ok(record), Some(after)) = (&result, delays.send_echo) {
            let channel = self.channel.clone();
            let topic = Topic::messages(conversation_id);
            let payload = serde_json::to_value(record).unwrap();
            tokio::spawn(async move {
                tokio::time::sleep(after).await;
                channel.deliver(&topic, payload);
            });
        }
        tokio::time::sleep(delays.send).await;
        result
    }

    async fn mark_read(&self, message_id: &str) -> BackendResult<()> {
        self.inner.mark_read(message_id).await
    }

    async fn get_unread_count(&self, conversation_id: &str) -> BackendResult<u32> {
        self.inner.get_unread_count(conversation_id).await
    }

    async fn create_conversation(
        &self,
        kind: ConversationKind,
        participant_ids: &[String],
    ) -> BackendResult<RawConversation> {
        self.inner.create_conversation(kind, participant_ids).await
    }

    async fn leave_conversation(&self, conversation_id: &str) -> BackendResult<()> {
        self.inner.leave_conversation(conversation_id).await
    }
}

/// Events already queued on `events`, without waiting
pub fn drain_events(events: &mut broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut drained = Vec::new();
    loop {
        match events.try_recv() {
            Ok(event) => drained.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => return drained,
        }
    }
}

/// Connect, list conversations and open `conversation_id`, waiting for its first page
pub async fn start_open(backend: InMemoryBackend, conversation_id: &str) -> Harness {
    let h = start(backend, config()).await;
    h.handle.connect().await.expect("connect");
    h.handle.refresh_conversations().await.expect("list");
    h.handle.open_conversation(conversation_id).await.expect("open");
    let id = conversation_id.to_string();
    wait_for(&h.handle, move |s| s.page(&id).map(|p| p.current_page == 1).unwrap_or(false)).await;
    h
}

pub async fn wait_for<F>(handle: &SyncHandle, predicate: F) -> SyncSnapshot
where
    F: Fn(&SyncSnapshot) -> bool,
{
    tokio::time::timeout(Duration::from_secs(60), handle.wait_for(predicate))
        .await
        .expect("timed out waiting for snapshot")
        .expect("engine stopped")
}

pub async fn wait_for_event<F>(events: &mut broadcast::Receiver<SyncEvent>, predicate: F) -> SyncEvent
where
    F: Fn(&SyncEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

pub fn bodies(snapshot: &SyncSnapshot, conversation_id: &str) -> Vec<String> {
    snapshot
        .messages(conversation_id)
        .iter()
        .map(|m| m.body.clone())
        .collect()
}
