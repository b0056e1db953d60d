/// Persistent push channel contract
use crate::error::Result;
use crate::transport::protocol::{PushFrame, Topic};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// One multiplexed connection carrying every subscribed topic.
///
/// `open` hands back the inbound frame stream of the new connection; the stream ending is how the
/// transport reports a dropped connection. Subscriptions belong to a connection and are gone after
/// it closes.
#[async_trait]
pub trait PushChannel: Send + Sync {
    async fn open(&self) -> Result<mpsc::UnboundedReceiver<PushFrame>>;

    async fn close(&self);

    /// Idempotent per topic
    async fn subscribe(&self, topic: &Topic) -> Result<()>;

    async fn unsubscribe(&self, topic: &Topic) -> Result<()>;

    /// Fire-and-forget
    async fn publish(&self, topic: &Topic, payload: serde_json::Value) -> Result<()>;
}
