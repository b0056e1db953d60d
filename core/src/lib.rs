/// chatsync - real-time conversation synchronization engine
///
/// Reconciles paginated history, a multiplexed push channel and optimistic local sends into
/// ordered, duplicate-free conversation timelines, with typing indicators, unread counters and
/// reconnect/resubscribe handling.

pub mod error;
pub mod config;
pub mod model;
pub mod normalize;
pub mod transport;
pub mod connection;
pub mod subscription;
pub mod timeline;
pub mod optimistic;
pub mod pagination;
pub mod typing;
pub mod unread;
pub mod conversations;
pub mod engine;

pub use config::SyncConfig;
pub use engine::{SyncEngine, SyncEvent, SyncHandle, SyncSnapshot};
pub use error::{BackendError, FetchFailure, Result, SyncError};
pub use model::{Conversation, ConversationKind, Message, Origin, TempId};
pub use transport::{ChatBackend, InMemoryBackend, InMemoryChannel, PushChannel};
