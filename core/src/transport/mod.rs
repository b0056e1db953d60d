/// Transport contracts (request/response backend and push channel) plus in-memory doubles
pub mod backend;
pub mod channel;
pub mod memory;
pub mod protocol;

pub use backend::{ChatBackend, MessagePage};
pub use channel::PushChannel;
pub use memory::{InMemoryBackend, InMemoryChannel};
pub use protocol::{OutboundMessage, PushFrame, StreamKind, Topic};
