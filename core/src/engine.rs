/// Sync engine: one task owning every component
///
/// Commands from `SyncHandle`, push frames and internal events (timers, finished backend calls)
/// are processed one at a time. After each step a fresh `SyncSnapshot` is published on a watch
/// channel; discrete `SyncEvent`s go out on a broadcast channel.
use crate::config::SyncConfig;
use crate::connection::{BackoffPolicy, ConnectionManager};
use crate::conversations::ConversationDirectory;
use crate::error::{BackendError, FetchFailure, Result, SyncError};
use crate::model::{Conversation, ConversationKind, Message, TempId};
use crate::normalize::{Normalizer, RawConversation, RawMessageEvent, RawTypingEvent};
use crate::optimistic::{DeliveryPath, OptimisticWriteCoordinator, SendState};
use crate::pagination::{PageRequest, PageState, PaginationCursor};
use crate::subscription::{MessageHandler, SubscriptionRegistry, TypingHandler};
use crate::timeline::{HistoryMerge, MessageTimeline, PushOutcome};
use crate::transport::{ChatBackend, MessagePage, OutboundMessage, PushChannel, StreamKind, Topic};
use crate::typing::{TypingChange, TypingTracker};
use crate::unread::UnreadCounter;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

type Reply<T> = oneshot::Sender<T>;

/// Everything a UI needs to render, published after every engine step
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSnapshot {
    /// Increases with every published snapshot
    pub rev: u64,
    pub connected: bool,
    pub open_conversation: Option<String>,
    /// Newest activity first, `unread_count` filled from the unread counter
    pub conversations: Vec<Conversation>,
    /// Shared with the engine until the timeline changes again
    pub timelines: HashMap<String, Arc<[Message]>>,
    /// Display names of users typing, per conversation
    pub typing: HashMap<String, Vec<String>>,
    pub unread: HashMap<String, u32>,
    pub pages: HashMap<String, PageState>,
    /// User-facing error per conversation
    pub errors: HashMap<String, String>,
}

impl SyncSnapshot {
    pub fn messages(&self, conversation_id: &str) -> &[Message] {
        self.timelines
            .get(conversation_id)
            .map(|messages| &messages[..])
            .unwrap_or(&[])
    }

    pub fn typing_in(&self, conversation_id: &str) -> &[String] {
        self.typing
            .get(conversation_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn unread(&self, conversation_id: &str) -> u32 {
        self.unread.get(conversation_id).copied().unwrap_or(0)
    }

    pub fn page(&self, conversation_id: &str) -> Option<PageState> {
        self.pages.get(conversation_id).copied()
    }

    pub fn conversation(&self, conversation_id: &str) -> Option<&Conversation> {
        self.conversations.iter().find(|c| c.id == conversation_id)
    }
}

/// Discrete notifications (streamed alongside the snapshots)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    Connected,
    Disconnected,
    /// Reconnect budget spent without success
    ReconnectFailed { attempts: u32 },
    /// Message from someone else (or from another device)
    MessageReceived { message: Message },
    MessageConfirmed {
        conversation_id: String,
        temp_id: TempId,
        message_id: String,
    },
    /// Confirmation window elapsed; spinner cleared
    MessageUnconfirmed {
        conversation_id: String,
        temp_id: TempId,
    },
    MessageFailed {
        conversation_id: String,
        temp_id: TempId,
        reason: String,
    },
    /// Newest page applied
    HistoryLoaded { conversation_id: String },
    /// Older page applied in front; emitted in the same step as the snapshot carrying it
    HistoryPrepended { conversation_id: String, count: usize },
    TypingChanged {
        conversation_id: String,
        users: Vec<String>,
    },
    UnreadChanged { conversation_id: String, count: u32 },
    ConversationsUpdated,
    ConversationLeft { conversation_id: String },
    Error {
        conversation_id: Option<String>,
        message: String,
    },
}

/// Requests accepted by the engine task
pub enum EngineCommand {
    Connect { reply: Reply<Result<()>> },
    Disconnect { reply: Reply<()> },
    Reconnect { reply: Reply<()> },
    OpenConversation {
        conversation_id: String,
        reply: Reply<Result<()>>,
    },
    CloseConversation { reply: Reply<()> },
    SetVisible {
        conversation_ids: Vec<String>,
        reply: Reply<()>,
    },
    Send {
        conversation_id: String,
        body: String,
        reply: Reply<Result<TempId>>,
    },
    Resend {
        conversation_id: String,
        temp_id: TempId,
        reply: Reply<Result<TempId>>,
    },
    LoadInitial {
        conversation_id: String,
        reply: Reply<bool>,
    },
    LoadOlder {
        conversation_id: String,
        reply: Reply<bool>,
    },
    MarkRead {
        conversation_id: String,
        reply: Reply<()>,
    },
    RefreshUnread {
        conversation_id: String,
        reply: Reply<()>,
    },
    RefreshConversations { reply: Reply<Result<usize>> },
    CreateConversation {
        kind: ConversationKind,
        participant_ids: Vec<String>,
        reply: Reply<Result<Conversation>>,
    },
    LeaveConversation {
        conversation_id: String,
        reply: Reply<Result<()>>,
    },
    Shutdown { reply: Reply<()> },
}

enum InternalEvent {
    ConnectionChanged(bool),
    MessagePushed {
        conversation_id: String,
        raw: RawMessageEvent,
    },
    TypingPushed {
        conversation_id: String,
        raw: RawTypingEvent,
    },
    TypingExpired {
        conversation_id: String,
        user_id: String,
    },
    PendingTimedOut {
        conversation_id: String,
        temp_id: TempId,
    },
    ReconnectAttempt,
    HistoryLoaded {
        conversation_id: String,
        page: u32,
        result: std::result::Result<MessagePage, BackendError>,
        gap_fill: bool,
    },
    FallbackSent {
        conversation_id: String,
        temp_id: TempId,
        result: std::result::Result<RawMessageEvent, BackendError>,
    },
    UnreadFetched {
        conversation_id: String,
        result: std::result::Result<u32, BackendError>,
    },
    ConversationsListed {
        result: std::result::Result<Vec<RawConversation>, BackendError>,
        reply: Reply<Result<usize>>,
    },
    ConversationCreated {
        result: std::result::Result<RawConversation, BackendError>,
        reply: Reply<Result<Conversation>>,
    },
    Left {
        conversation_id: String,
        result: std::result::Result<(), BackendError>,
        reply: Reply<Result<()>>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum TimerKey {
    Typing(String, String),
    Pending(String, TempId),
    Reconnect,
}

pub struct SyncEngine {
    config: SyncConfig,
    backend: Arc<dyn ChatBackend>,
    connection: ConnectionManager,
    registry: SubscriptionRegistry,
    directory: ConversationDirectory,
    timelines: HashMap<String, MessageTimeline>,
    /// Timeline revision and slice last handed to the snapshot
    published: HashMap<String, (u64, Arc<[Message]>)>,
    cursor: PaginationCursor,
    typing: TypingTracker,
    unread: UnreadCounter,
    writer: OptimisticWriteCoordinator,
    open_conversation: Option<String>,
    visible: BTreeSet<String>,
    errors: HashMap<String, String>,
    timers: HashMap<TimerKey, JoinHandle<()>>,
    reconnecting: bool,
    reconnect_attempt: u32,
    has_connected: bool,
    internal_tx: mpsc::UnboundedSender<InternalEvent>,
    internal_rx: mpsc::UnboundedReceiver<InternalEvent>,
    commands: mpsc::UnboundedReceiver<EngineCommand>,
    snapshot_tx: watch::Sender<SyncSnapshot>,
    events_tx: broadcast::Sender<SyncEvent>,
    rev: u64,
}

impl SyncEngine {
    pub fn new(
        config: SyncConfig,
        backend: Arc<dyn ChatBackend>,
        channel: Arc<dyn PushChannel>,
    ) -> Result<(Self, SyncHandle)> {
        config.validate()?;

        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(SyncSnapshot::default());
        let (events_tx, _) = broadcast::channel(config.event_buffer);

        let mut connection = ConnectionManager::new(channel.clone(), BackoffPolicy::from_config(&config));
        let tx = internal_tx.clone();
        connection.on_connection_change(Box::new(move |up: bool| {
            let _ = tx.send(InternalEvent::ConnectionChanged(up));
        }));

        let engine = Self {
            typing: TypingTracker::new(config.self_user_id.clone(), config.typing_timeout),
            config,
            backend,
            connection,
            registry: SubscriptionRegistry::new(channel),
            directory: ConversationDirectory::new(),
            timelines: HashMap::new(),
            published: HashMap::new(),
            cursor: PaginationCursor::new(),
            unread: UnreadCounter::new(),
            writer: OptimisticWriteCoordinator::new(),
            open_conversation: None,
            visible: BTreeSet::new(),
            errors: HashMap::new(),
            timers: HashMap::new(),
            reconnecting: false,
            reconnect_attempt: 0,
            has_connected: false,
            internal_tx,
            internal_rx,
            commands,
            snapshot_tx,
            events_tx: events_tx.clone(),
            rev: 0,
        };
        let handle = SyncHandle {
            commands: command_tx,
            snapshot: snapshot_rx,
            events: events_tx,
        };
        Ok((engine, handle))
    }

    /// Build the engine and run it on a new task
    pub fn spawn(
        config: SyncConfig,
        backend: Arc<dyn ChatBackend>,
        channel: Arc<dyn PushChannel>,
    ) -> Result<(SyncHandle, JoinHandle<()>)> {
        let (engine, handle) = Self::new(config, backend, channel)?;
        let task = tokio::spawn(engine.run());
        Ok((handle, task))
    }

    pub async fn run(mut self) {
        info!(user = %self.config.self_user_id, "Sync engine started");
        self.publish_snapshot();

        loop {
            tokio::select! {
                Some(event) = self.internal_rx.recv() => {
                    self.handle_internal(event).await;
                }
                command = self.commands.recv() => match command {
                    Some(EngineCommand::Shutdown { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                frame = self.connection.next_frame(), if self.connection.is_connected() => match frame {
                    Some(frame) => {
                        self.registry.dispatch(frame);
                    }
                    None => self.connection.mark_dropped(),
                },
            }
            self.publish_snapshot();
        }

        self.publish_snapshot();
        info!("Sync engine stopped");
    }

    async fn handle_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::Connect { reply } => {
                let result = self.connect_once().await;
                if let Err(e) = &result {
                    self.emit(SyncEvent::Error {
                        conversation_id: None,
                        message: e.to_string(),
                    });
                }
                let _ = reply.send(result);
            }
            EngineCommand::Disconnect { reply } => {
                self.reconnecting = false;
                self.cancel_timer(&TimerKey::Reconnect);
                self.connection.disconnect().await;
                let _ = reply.send(());
            }
            EngineCommand::Reconnect { reply } => {
                self.start_reconnect().await;
                let _ = reply.send(());
            }
            EngineCommand::OpenConversation {
                conversation_id,
                reply,
            } => {
                let result = self.open_conversation(conversation_id).await;
                let _ = reply.send(result);
            }
            EngineCommand::CloseConversation { reply } => {
                if let Some(previous) = self.open_conversation.take() {
                    debug!(conversation_id = %previous, "conversation closed");
                }
                self.sync_subscriptions().await;
                let _ = reply.send(());
            }
            EngineCommand::SetVisible {
                conversation_ids,
                reply,
            } => {
                self.visible = conversation_ids.into_iter().collect();
                self.sync_subscriptions().await;
                let _ = reply.send(());
            }
            EngineCommand::Send {
                conversation_id,
                body,
                reply,
            } => {
                let result = self.send(&conversation_id, &body).await;
                let _ = reply.send(result);
            }
            EngineCommand::Resend {
                conversation_id,
                temp_id,
                reply,
            } => {
                let result = self.resend(&conversation_id, &temp_id).await;
                let _ = reply.send(result);
            }
            EngineCommand::LoadInitial {
                conversation_id,
                reply,
            } => {
                let started = match self.cursor.load_initial(&conversation_id) {
                    Some(request) => {
                        self.timelines
                            .entry(conversation_id.clone())
                            .or_insert_with(|| MessageTimeline::new(conversation_id.clone()));
                        self.spawn_history_fetch(request, false);
                        true
                    }
                    None => false,
                };
                let _ = reply.send(started);
            }
            EngineCommand::LoadOlder {
                conversation_id,
                reply,
            } => {
                let started = match self.cursor.load_older(&conversation_id) {
                    Some(request) => {
                        self.spawn_history_fetch(request, false);
                        true
                    }
                    None => false,
                };
                let _ = reply.send(started);
            }
            EngineCommand::MarkRead {
                conversation_id,
                reply,
            } => {
                self.mark_read(&conversation_id);
                let _ = reply.send(());
            }
            EngineCommand::RefreshUnread {
                conversation_id,
                reply,
            } => {
                let backend = self.backend.clone();
                let tx = self.internal_tx.clone();
                tokio::spawn(async move {
                    let result = backend.get_unread_count(&conversation_id).await;
                    let _ = tx.send(InternalEvent::UnreadFetched {
                        conversation_id,
                        result,
                    });
                });
                let _ = reply.send(());
            }
            EngineCommand::RefreshConversations { reply } => {
                let backend = self.backend.clone();
                let tx = self.internal_tx.clone();
                tokio::spawn(async move {
                    let result = backend.list_conversations().await;
                    let _ = tx.send(InternalEvent::ConversationsListed { result, reply });
                });
            }
            EngineCommand::CreateConversation {
                kind,
                participant_ids,
                reply,
            } => {
                let backend = self.backend.clone();
                let tx = self.internal_tx.clone();
                tokio::spawn(async move {
                    let result = backend.create_conversation(kind, &participant_ids).await;
                    let _ = tx.send(InternalEvent::ConversationCreated { result, reply });
                });
            }
            EngineCommand::LeaveConversation {
                conversation_id,
                reply,
            } => {
                let backend = self.backend.clone();
                let tx = self.internal_tx.clone();
                tokio::spawn(async move {
                    let result = backend.leave_conversation(&conversation_id).await;
                    let _ = tx.send(InternalEvent::Left {
                        conversation_id,
                        result,
                        reply,
                    });
                });
            }
            EngineCommand::Shutdown { reply } => {
                // Handled by the run loop
                let _ = reply.send(());
            }
        }
    }

    async fn handle_internal(&mut self, event: InternalEvent) {
        match event {
            InternalEvent::ConnectionChanged(up) => self.on_connection_changed(up).await,
            InternalEvent::MessagePushed {
                conversation_id,
                raw,
            } => self.on_message_pushed(&conversation_id, raw),
            InternalEvent::TypingPushed {
                conversation_id,
                raw,
            } => self.on_typing_pushed(&conversation_id, raw),
            InternalEvent::TypingExpired {
                conversation_id,
                user_id,
            } => {
                if self.typing.expire(&conversation_id, &user_id, Instant::now()) {
                    debug!(conversation_id = %conversation_id, user_id = %user_id, "typing expired");
                    self.emit_typing(&conversation_id);
                }
            }
            InternalEvent::PendingTimedOut {
                conversation_id,
                temp_id,
            } => {
                let Some(timeline) = self.timelines.get_mut(&conversation_id) else {
                    return;
                };
                if self.writer.on_timeout(timeline, &temp_id) {
                    self.emit(SyncEvent::MessageUnconfirmed {
                        conversation_id,
                        temp_id,
                    });
                }
            }
            InternalEvent::ReconnectAttempt => self.attempt_reconnect().await,
            InternalEvent::HistoryLoaded {
                conversation_id,
                page,
                result,
                gap_fill,
            } => self.on_history_loaded(conversation_id, page, result, gap_fill),
            InternalEvent::FallbackSent {
                conversation_id,
                temp_id,
                result,
            } => self.on_fallback_sent(conversation_id, temp_id, result),
            InternalEvent::UnreadFetched {
                conversation_id,
                result,
            } => match result {
                Ok(count) => {
                    if self.open_conversation.as_deref() == Some(conversation_id.as_str()) {
                        return;
                    }
                    self.unread.set_authoritative(&conversation_id, count);
                    self.emit(SyncEvent::UnreadChanged {
                        conversation_id,
                        count,
                    });
                }
                Err(e) => {
                    warn!(conversation_id = %conversation_id, "unread count fetch failed: {}", e);
                }
            },
            InternalEvent::ConversationsListed { result, reply } => {
                let _ = reply.send(self.on_conversations_listed(result));
            }
            InternalEvent::ConversationCreated { result, reply } => {
                let outcome = result
                    .map_err(|e| SyncError::FetchFailed(FetchFailure::from(&e)))
                    .and_then(|raw| self.normalizer().conversation(&raw));
                if let Ok(conversation) = &outcome {
                    info!(conversation_id = %conversation.id, "conversation created");
                    self.directory.upsert(conversation.clone());
                    self.emit(SyncEvent::ConversationsUpdated);
                }
                let _ = reply.send(outcome);
            }
            InternalEvent::Left {
                conversation_id,
                result,
                reply,
            } => {
                let outcome = match result {
                    Ok(()) => {
                        self.forget_conversation(&conversation_id).await;
                        self.emit(SyncEvent::ConversationLeft { conversation_id });
                        Ok(())
                    }
                    Err(e) => Err(SyncError::FetchFailed(FetchFailure::from(&e))),
                };
                let _ = reply.send(outcome);
            }
        }
    }

    // ----- connection -----

    async fn connect_once(&mut self) -> Result<()> {
        let mut failure = None;
        self.connection
            .connect(
                || {},
                |e| {
                    failure = Some(match e {
                        SyncError::TransportUnavailable(reason) => reason.clone(),
                        other => other.to_string(),
                    })
                },
            )
            .await;
        match failure {
            Some(reason) => Err(SyncError::TransportUnavailable(reason)),
            None => Ok(()),
        }
    }

    async fn start_reconnect(&mut self) {
        if self.connection.is_connected() {
            debug!("reconnect requested while connected");
            return;
        }
        info!("Reconnect requested");
        self.reconnecting = true;
        self.reconnect_attempt = 0;
        self.cancel_timer(&TimerKey::Reconnect);
        self.attempt_reconnect().await;
    }

    async fn attempt_reconnect(&mut self) {
        if !self.reconnecting || self.connection.is_connected() {
            self.reconnecting = false;
            return;
        }
        if self.connect_once().await.is_ok() {
            self.reconnecting = false;
            self.reconnect_attempt = 0;
            return;
        }

        match self.connection.backoff_delay(self.reconnect_attempt) {
            Some(delay) => {
                self.reconnect_attempt += 1;
                info!(
                    attempt = self.reconnect_attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Reconnect attempt failed, retrying"
                );
                self.arm_timer(
                    TimerKey::Reconnect,
                    Instant::now() + delay,
                    InternalEvent::ReconnectAttempt,
                );
            }
            None => {
                warn!(attempts = self.reconnect_attempt, "Giving up on reconnect");
                self.reconnecting = false;
                self.emit(SyncEvent::ReconnectFailed {
                    attempts: self.reconnect_attempt,
                });
            }
        }
    }

    async fn on_connection_changed(&mut self, up: bool) {
        if up != self.connection.is_connected() {
            // Superseded by a later transition still queued
            return;
        }
        if !up {
            self.registry.on_disconnected();
            self.emit(SyncEvent::Disconnected);
            return;
        }

        let issued = self.registry.resubscribe_all().await;
        let reconnect = self.has_connected;
        self.has_connected = true;
        info!(topics = issued, reconnect, "Connected");

        if reconnect && self.config.gap_fill_on_reconnect {
            let mut conversations: BTreeSet<String> = self.timelines.keys().cloned().collect();
            conversations.extend(self.open_conversation.clone());
            for conversation_id in conversations {
                self.spawn_history_fetch(
                    PageRequest {
                        conversation_id,
                        page: 1,
                    },
                    true,
                );
            }
        }
        self.emit(SyncEvent::Connected);
    }

    /// Subscribe the open conversation plus the visible list, drop everything else
    async fn sync_subscriptions(&mut self) {
        let mut desired = self.visible.clone();
        desired.extend(self.open_conversation.clone());

        for conversation_id in self.registry.conversations() {
            if !desired.contains(&conversation_id) {
                self.registry.unsubscribe(&conversation_id).await;
            }
        }

        for conversation_id in desired {
            if self.registry.is_subscribed(&conversation_id, StreamKind::Messages) {
                continue;
            }
            let tx = self.internal_tx.clone();
            let conv = conversation_id.clone();
            let on_message: MessageHandler = Arc::new(move |raw: RawMessageEvent| {
                let _ = tx.send(InternalEvent::MessagePushed {
                    conversation_id: conv.clone(),
                    raw,
                });
            });
            let tx = self.internal_tx.clone();
            let conv = conversation_id.clone();
            let on_typing: TypingHandler = Arc::new(move |raw: RawTypingEvent| {
                let _ = tx.send(InternalEvent::TypingPushed {
                    conversation_id: conv.clone(),
                    raw,
                });
            });
            self.registry
                .subscribe_messages(&conversation_id, on_message)
                .await;
            self.registry
                .subscribe_typing(&conversation_id, on_typing)
                .await;
        }
    }

    // ----- conversations -----

    async fn open_conversation(&mut self, conversation_id: String) -> Result<()> {
        if !self.directory.contains(&conversation_id) && !self.timelines.contains_key(&conversation_id) {
            return Err(SyncError::UnknownConversation(conversation_id));
        }
        info!(conversation_id = %conversation_id, "Opening conversation");

        self.open_conversation = Some(conversation_id.clone());
        self.timelines
            .entry(conversation_id.clone())
            .or_insert_with(|| MessageTimeline::new(conversation_id.clone()));
        self.errors.remove(&conversation_id);
        self.unread.mark_read(&conversation_id);
        self.emit(SyncEvent::UnreadChanged {
            conversation_id: conversation_id.clone(),
            count: 0,
        });

        self.sync_subscriptions().await;
        if let Some(request) = self.cursor.load_initial(&conversation_id) {
            self.spawn_history_fetch(request, false);
        }
        Ok(())
    }

    fn on_conversations_listed(
        &mut self,
        result: std::result::Result<Vec<RawConversation>, BackendError>,
    ) -> Result<usize> {
        let raws = result.map_err(|e| SyncError::FetchFailed(FetchFailure::from(&e)))?;
        let normalizer = Normalizer::new(&self.config.self_user_id);
        let mut conversations = Vec::with_capacity(raws.len());
        for raw in &raws {
            match normalizer.conversation(raw) {
                Ok(conversation) => conversations.push(conversation),
                Err(e) => warn!("dropping conversation record: {}", e),
            }
        }

        for conversation in &conversations {
            if self.open_conversation.as_deref() != Some(conversation.id.as_str()) {
                self.unread
                    .set_authoritative(&conversation.id, conversation.unread_count);
            }
        }
        let count = conversations.len();
        self.directory.replace_all(conversations);
        info!(count, "Conversation list refreshed");
        self.emit(SyncEvent::ConversationsUpdated);
        Ok(count)
    }

    async fn forget_conversation(&mut self, conversation_id: &str) {
        self.directory.remove(conversation_id);
        self.timelines.remove(conversation_id);
        self.published.remove(conversation_id);
        self.cursor.forget(conversation_id);
        self.unread.forget(conversation_id);
        self.writer.forget_conversation(conversation_id);
        self.errors.remove(conversation_id);
        self.visible.remove(conversation_id);
        for user_id in self.typing.clear(conversation_id) {
            self.cancel_timer(&TimerKey::Typing(conversation_id.to_string(), user_id));
        }
        self.timers.retain(|key, handle| match key {
            TimerKey::Pending(conv, _) if conv == conversation_id => {
                handle.abort();
                false
            }
            _ => true,
        });
        if self.open_conversation.as_deref() == Some(conversation_id) {
            self.open_conversation = None;
        }
        self.sync_subscriptions().await;
        info!(conversation_id, "Left conversation");
    }

    fn mark_read(&mut self, conversation_id: &str) {
        self.unread.mark_read(conversation_id);
        self.emit(SyncEvent::UnreadChanged {
            conversation_id: conversation_id.to_string(),
            count: 0,
        });
        let last = self
            .timelines
            .get(conversation_id)
            .and_then(|t| t.last_confirmed())
            .map(|m| m.id.clone());
        if let Some(message_id) = last {
            self.spawn_mark_read(message_id);
        }
    }

    // ----- sending -----

    async fn send(&mut self, conversation_id: &str, body: &str) -> Result<TempId> {
        if body.trim().is_empty() {
            return Err(SyncError::SendFailed("message body is empty".to_string()));
        }
        if !self.directory.contains(conversation_id) && !self.timelines.contains_key(conversation_id) {
            return Err(SyncError::UnknownConversation(conversation_id.to_string()));
        }

        let path = if self.connection.is_connected() {
            DeliveryPath::Live
        } else {
            DeliveryPath::Fallback
        };
        let timeline = self
            .timelines
            .entry(conversation_id.to_string())
            .or_insert_with(|| MessageTimeline::new(conversation_id));
        let temp_id = self
            .writer
            .begin(timeline, &self.config.self_user_id, body, path, Utc::now());
        if let Some(local) = timeline.get(&temp_id) {
            self.directory.record_activity(local);
        }

        if path == DeliveryPath::Fallback {
            debug!(conversation_id, temp_id = %temp_id, "not connected, sending via fallback");
            self.spawn_fallback_send(conversation_id, &temp_id, body);
            return Ok(temp_id);
        }

        let payload = serde_json::to_value(OutboundMessage {
            body: body.to_string(),
        })?;
        let channel = self.connection.channel();
        match channel.publish(&Topic::send(conversation_id), payload).await {
            Ok(()) => {
                self.arm_timer(
                    TimerKey::Pending(conversation_id.to_string(), temp_id.clone()),
                    Instant::now() + self.config.pending_timeout,
                    InternalEvent::PendingTimedOut {
                        conversation_id: conversation_id.to_string(),
                        temp_id: temp_id.clone(),
                    },
                );
            }
            Err(e) => {
                warn!(conversation_id, temp_id = %temp_id, "live publish failed, using fallback: {}", e);
                self.writer.switch_to_fallback(&temp_id);
                self.spawn_fallback_send(conversation_id, &temp_id, body);
            }
        }
        Ok(temp_id)
    }

    async fn resend(&mut self, conversation_id: &str, temp_id: &str) -> Result<TempId> {
        let timeline = self
            .timelines
            .get_mut(conversation_id)
            .ok_or_else(|| SyncError::UnknownConversation(conversation_id.to_string()))?;
        let body = self
            .writer
            .take_for_resend(timeline, temp_id)
            .ok_or_else(|| SyncError::SendFailed(format!("{} is not a failed message", temp_id)))?;
        info!(conversation_id, temp_id, "Resending failed message");
        self.send(conversation_id, &body).await
    }

    fn on_fallback_sent(
        &mut self,
        conversation_id: String,
        temp_id: TempId,
        result: std::result::Result<RawMessageEvent, BackendError>,
    ) {
        let outcome = match result {
            Ok(raw) => self
                .normalizer()
                .message(&raw, Some(conversation_id.as_str()), self.directory.get(&conversation_id))
                .map_err(|e| e.to_string()),
            Err(e) => Err(SyncError::SendFailed(e.to_string()).to_string()),
        };
        let Some(timeline) = self.timelines.get_mut(&conversation_id) else {
            debug!(conversation_id = %conversation_id, "fallback result for dropped timeline");
            return;
        };

        // An echo may have confirmed the entry before the response came back
        let already_settled = self.writer.get(&temp_id).is_none();
        let confirmed = outcome.as_ref().ok().cloned();
        match self.writer.on_fallback_result(timeline, &temp_id, outcome.clone()) {
            SendState::Failed => {
                let reason = outcome.err().unwrap_or_default();
                self.emit(SyncEvent::MessageFailed {
                    conversation_id,
                    temp_id,
                    reason,
                });
            }
            _ => {
                if let Some(message) = confirmed {
                    self.directory.record_activity(&message);
                    if already_settled {
                        debug!(conversation_id = %conversation_id, temp_id = %temp_id, "fallback response after echo");
                        return;
                    }
                    self.emit(SyncEvent::MessageConfirmed {
                        conversation_id,
                        temp_id,
                        message_id: message.id,
                    });
                }
            }
        }
    }

    // ----- push events -----

    fn on_message_pushed(&mut self, conversation_id: &str, raw: RawMessageEvent) {
        let message = match self.normalizer().message(
            &raw,
            Some(conversation_id),
            self.directory.get(conversation_id),
        ) {
            Ok(message) => message,
            Err(e) => {
                warn!(conversation_id, "dropping pushed message: {}", e);
                return;
            }
        };

        let outcome = self
            .timelines
            .get_mut(conversation_id)
            .map(|timeline| timeline.ingest_pushed(message.clone()));
        if matches!(outcome, Some(PushOutcome::Updated | PushOutcome::Ignored)) {
            debug!(conversation_id, message_id = %message.id, "redelivered message, nothing to count");
            return;
        }

        self.directory.record_activity(&message);
        let is_open = self.open_conversation.as_deref() == Some(conversation_id);
        if self.unread.record_incoming(
            conversation_id,
            &message.id,
            message.mine,
            self.open_conversation.as_deref(),
        ) {
            self.emit(SyncEvent::UnreadChanged {
                conversation_id: conversation_id.to_string(),
                count: self.unread.get(conversation_id),
            });
        }

        match outcome {
            Some(PushOutcome::Appended {
                confirmed_temp: Some(temp_id),
            }) => {
                self.writer.on_echo(&temp_id);
                self.cancel_timer(&TimerKey::Pending(conversation_id.to_string(), temp_id.clone()));
                self.emit(SyncEvent::MessageConfirmed {
                    conversation_id: conversation_id.to_string(),
                    temp_id,
                    message_id: message.id,
                });
            }
            Some(PushOutcome::Appended {
                confirmed_temp: None,
            }) => {
                if is_open && !message.mine {
                    self.spawn_mark_read(message.id.clone());
                }
                self.emit(SyncEvent::MessageReceived { message });
            }
            _ => {
                debug!(conversation_id, "no timeline loaded, message only updates the summary");
            }
        }
    }

    fn on_typing_pushed(&mut self, conversation_id: &str, raw: RawTypingEvent) {
        let (user_id, is_typing) = match self.normalizer().typing(&raw) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(conversation_id, "dropping typing event: {}", e);
                return;
            }
        };

        let key = TimerKey::Typing(conversation_id.to_string(), user_id.clone());
        match self
            .typing
            .on_typing_event(conversation_id, &user_id, is_typing, Instant::now())
        {
            TypingChange::Started { deadline } => {
                self.arm_timer(
                    key,
                    deadline,
                    InternalEvent::TypingExpired {
                        conversation_id: conversation_id.to_string(),
                        user_id,
                    },
                );
                self.emit_typing(conversation_id);
            }
            TypingChange::Stopped => {
                self.cancel_timer(&key);
                self.emit_typing(conversation_id);
            }
            TypingChange::Unchanged => {}
        }
    }

    // ----- history -----

    fn spawn_history_fetch(&self, request: PageRequest, gap_fill: bool) {
        let backend = self.backend.clone();
        let tx = self.internal_tx.clone();
        let page_size = self.config.page_size;
        debug!(
            conversation_id = %request.conversation_id,
            page = request.page,
            gap_fill,
            "fetching history"
        );
        tokio::spawn(async move {
            let result = backend
                .get_messages(&request.conversation_id, request.page, page_size)
                .await;
            let _ = tx.send(InternalEvent::HistoryLoaded {
                conversation_id: request.conversation_id,
                page: request.page,
                result,
                gap_fill,
            });
        });
    }

    fn on_history_loaded(
        &mut self,
        conversation_id: String,
        page: u32,
        result: std::result::Result<MessagePage, BackendError>,
        gap_fill: bool,
    ) {
        let page_result = match result {
            Ok(page) => Ok(page),
            Err(e) => {
                let failure = FetchFailure::from(&e);
                if failure.is_not_found() {
                    Ok(MessagePage {
                        messages: Vec::new(),
                        page,
                        total_pages: 1,
                    })
                } else {
                    Err(failure)
                }
            }
        };

        let fetched = match page_result {
            Ok(fetched) => fetched,
            Err(failure) => {
                warn!(conversation_id = %conversation_id, page, gap_fill, "history fetch failed: {}", failure);
                if gap_fill {
                    return;
                }
                self.cursor.fail(&conversation_id, page);
                self.errors
                    .insert(conversation_id.clone(), failure.user_message().to_string());
                self.emit(SyncEvent::Error {
                    conversation_id: Some(conversation_id),
                    message: failure.user_message().to_string(),
                });
                return;
            }
        };

        if !gap_fill && !self.cursor.complete(&conversation_id, page, fetched.total_pages) {
            return;
        }

        let messages = self.normalize_page(&conversation_id, &fetched.messages);
        let Some(timeline) = self.timelines.get_mut(&conversation_id) else {
            debug!(conversation_id = %conversation_id, "history for dropped timeline ignored");
            return;
        };
        let merge = if gap_fill {
            timeline.merge_latest(messages)
        } else {
            timeline.ingest_history(page, messages)
        };
        let newest = timeline.messages().last().cloned();
        let last_confirmed = timeline.last_confirmed().map(|m| m.id.clone());
        self.settle_confirmed(&conversation_id, &merge);
        if let Some(newest) = &newest {
            self.directory.record_activity(newest);
        }

        if gap_fill {
            if merge.added > 0 {
                info!(conversation_id = %conversation_id, added = merge.added, "Gap filled after reconnect");
            }
            return;
        }

        self.errors.remove(&conversation_id);
        if page > 1 {
            self.emit(SyncEvent::HistoryPrepended {
                conversation_id,
                count: merge.added,
            });
            return;
        }

        if self.open_conversation.as_deref() == Some(conversation_id.as_str()) {
            if let Some(message_id) = last_confirmed {
                self.spawn_mark_read(message_id);
            }
        }
        self.emit(SyncEvent::HistoryLoaded { conversation_id });
    }

    fn normalize_page(&self, conversation_id: &str, raws: &[RawMessageEvent]) -> Vec<Message> {
        let normalizer = self.normalizer();
        let conversation = self.directory.get(conversation_id);
        raws.iter()
            .filter_map(|raw| match normalizer.message(raw, Some(conversation_id), conversation) {
                Ok(message) => Some(message),
                Err(e) => {
                    warn!(conversation_id, "dropping history record: {}", e);
                    None
                }
            })
            .collect()
    }

    /// Local entries replaced by history records count as confirmed sends
    fn settle_confirmed(&mut self, conversation_id: &str, merge: &HistoryMerge) {
        for temp_id in &merge.confirmed_temps {
            self.writer.on_echo(temp_id);
            self.cancel_timer(&TimerKey::Pending(conversation_id.to_string(), temp_id.clone()));
        }
    }

    // ----- helpers -----

    fn normalizer(&self) -> Normalizer<'_> {
        Normalizer::new(&self.config.self_user_id)
    }

    fn spawn_fallback_send(&self, conversation_id: &str, temp_id: &str, body: &str) {
        let backend = self.backend.clone();
        let tx = self.internal_tx.clone();
        let conversation_id = conversation_id.to_string();
        let temp_id = temp_id.to_string();
        let body = body.to_string();
        tokio::spawn(async move {
            let result = backend.send_message(&conversation_id, &body).await;
            let _ = tx.send(InternalEvent::FallbackSent {
                conversation_id,
                temp_id,
                result,
            });
        });
    }

    fn spawn_mark_read(&self, message_id: String) {
        let backend = self.backend.clone();
        tokio::spawn(async move {
            if let Err(e) = backend.mark_read(&message_id).await {
                warn!(message_id = %message_id, "mark read failed: {}", e);
            }
        });
    }

    fn arm_timer(&mut self, key: TimerKey, at: Instant, event: InternalEvent) {
        self.timers.retain(|_, handle| !handle.is_finished());
        let tx = self.internal_tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(at).await;
            let _ = tx.send(event);
        });
        if let Some(previous) = self.timers.insert(key, handle) {
            previous.abort();
        }
    }

    fn cancel_timer(&mut self, key: &TimerKey) {
        if let Some(handle) = self.timers.remove(key) {
            handle.abort();
        }
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine
        let _ = self.events_tx.send(event);
    }

    fn emit_typing(&self, conversation_id: &str) {
        self.emit(SyncEvent::TypingChanged {
            conversation_id: conversation_id.to_string(),
            users: self.typing_names(conversation_id),
        });
    }

    fn typing_names(&self, conversation_id: &str) -> Vec<String> {
        self.typing
            .typing_users(conversation_id)
            .into_iter()
            .map(|user_id| {
                self.directory
                    .participant_name(conversation_id, &user_id)
                    .unwrap_or(user_id)
            })
            .collect()
    }

    fn publish_snapshot(&mut self) {
        self.rev += 1;
        let conversations = self
            .directory
            .sorted()
            .into_iter()
            .map(|mut c| {
                c.unread_count = self.unread.get(&c.id);
                c
            })
            .collect();
        let typing = self
            .typing
            .conversations()
            .map(|c| (c.clone(), self.typing_names(c)))
            .collect();
        let snapshot = SyncSnapshot {
            rev: self.rev,
            connected: self.connection.is_connected(),
            open_conversation: self.open_conversation.clone(),
            conversations,
            timelines: self.published_timelines(),
            typing,
            unread: self.unread.snapshot(),
            pages: self.cursor.snapshot(),
            errors: self.errors.clone(),
        };
        self.snapshot_tx.send_replace(snapshot);
    }

    /// Reuse the previous snapshot's slice for every timeline whose revision is unchanged
    fn published_timelines(&mut self) -> HashMap<String, Arc<[Message]>> {
        self.timelines
            .iter()
            .map(|(id, timeline)| {
                let entry = self
                    .published
                    .entry(id.clone())
                    .or_insert_with(|| (timeline.revision(), Arc::from(timeline.messages())));
                if entry.0 != timeline.revision() {
                    *entry = (timeline.revision(), Arc::from(timeline.messages()));
                }
                (id.clone(), entry.1.clone())
            })
            .collect()
    }

    async fn shutdown(&mut self) {
        for (_, handle) in self.timers.drain() {
            handle.abort();
        }
        self.reconnecting = false;
        self.connection.disconnect().await;
        self.registry.on_disconnected();
    }
}

/// Cloneable front end of a running `SyncEngine`
#[derive(Clone)]
pub struct SyncHandle {
    commands: mpsc::UnboundedSender<EngineCommand>,
    snapshot: watch::Receiver<SyncSnapshot>,
    events: broadcast::Sender<SyncEvent>,
}

impl SyncHandle {
    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> EngineCommand) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .map_err(|_| SyncError::EngineStopped)?;
        rx.await.map_err(|_| SyncError::EngineStopped)
    }

    /// Open the push connection once; failures are also reported as `SyncEvent::Error`
    pub async fn connect(&self) -> Result<()> {
        self.request(|reply| EngineCommand::Connect { reply }).await?
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.request(|reply| EngineCommand::Disconnect { reply }).await
    }

    /// Start reconnecting with backoff; returns after the first attempt
    pub async fn reconnect(&self) -> Result<()> {
        self.request(|reply| EngineCommand::Reconnect { reply }).await
    }

    pub async fn open_conversation(&self, conversation_id: &str) -> Result<()> {
        let conversation_id = conversation_id.to_string();
        self.request(|reply| EngineCommand::OpenConversation {
            conversation_id,
            reply,
        })
        .await?
    }

    pub async fn close_conversation(&self) -> Result<()> {
        self.request(|reply| EngineCommand::CloseConversation { reply })
            .await
    }

    /// Conversations currently shown in the list; they stay subscribed
    pub async fn set_visible_conversations(&self, conversation_ids: Vec<String>) -> Result<()> {
        self.request(|reply| EngineCommand::SetVisible {
            conversation_ids,
            reply,
        })
        .await
    }

    /// Send a message; returns the temporary id of the optimistic entry
    pub async fn send(&self, conversation_id: &str, body: &str) -> Result<TempId> {
        let conversation_id = conversation_id.to_string();
        let body = body.to_string();
        self.request(|reply| EngineCommand::Send {
            conversation_id,
            body,
            reply,
        })
        .await?
    }

    /// Send a failed message again; returns the new temporary id
    pub async fn resend(&self, conversation_id: &str, temp_id: &str) -> Result<TempId> {
        let conversation_id = conversation_id.to_string();
        let temp_id = temp_id.to_string();
        self.request(|reply| EngineCommand::Resend {
            conversation_id,
            temp_id,
            reply,
        })
        .await?
    }

    pub async fn load_initial(&self, conversation_id: &str) -> Result<bool> {
        let conversation_id = conversation_id.to_string();
        self.request(|reply| EngineCommand::LoadInitial {
            conversation_id,
            reply,
        })
        .await
    }

    /// False when already at the oldest page or a load is running
    pub async fn load_older(&self, conversation_id: &str) -> Result<bool> {
        let conversation_id = conversation_id.to_string();
        self.request(|reply| EngineCommand::LoadOlder {
            conversation_id,
            reply,
        })
        .await
    }

    pub async fn mark_read(&self, conversation_id: &str) -> Result<()> {
        let conversation_id = conversation_id.to_string();
        self.request(|reply| EngineCommand::MarkRead {
            conversation_id,
            reply,
        })
        .await
    }

    pub async fn refresh_unread(&self, conversation_id: &str) -> Result<()> {
        let conversation_id = conversation_id.to_string();
        self.request(|reply| EngineCommand::RefreshUnread {
            conversation_id,
            reply,
        })
        .await
    }

    /// Re-list conversations; returns how many were listed
    pub async fn refresh_conversations(&self) -> Result<usize> {
        self.request(|reply| EngineCommand::RefreshConversations { reply })
            .await?
    }

    pub async fn create_conversation(
        &self,
        kind: ConversationKind,
        participant_ids: Vec<String>,
    ) -> Result<Conversation> {
        self.request(|reply| EngineCommand::CreateConversation {
            kind,
            participant_ids,
            reply,
        })
        .await?
    }

    pub async fn leave_conversation(&self, conversation_id: &str) -> Result<()> {
        let conversation_id = conversation_id.to_string();
        self.request(|reply| EngineCommand::LeaveConversation {
            conversation_id,
            reply,
        })
        .await?
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| EngineCommand::Shutdown { reply }).await
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> SyncSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SyncSnapshot> {
        self.snapshot.clone()
    }

    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Wait until a published snapshot satisfies `predicate`
    pub async fn wait_for<F>(&self, predicate: F) -> Result<SyncSnapshot>
    where
        F: Fn(&SyncSnapshot) -> bool,
    {
        let mut rx = self.snapshot.clone();
        loop {
            {
                let snapshot = rx.borrow_and_update();
                if predicate(&*snapshot) {
                    return Ok((*snapshot).clone());
                }
            }
            rx.changed().await.map_err(|_| SyncError::EngineStopped)?;
        }
    }
}
