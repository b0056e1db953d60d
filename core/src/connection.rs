/// Connection lifecycle of the single multiplexed push connection
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::transport::{PushChannel, PushFrame};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Connection state of the push channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected
    Disconnected,
    /// Attempting to connect
    Connecting,
    /// Fully connected and ready
    Connected,
}

/// Token returned by `on_connection_change`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

pub type ConnectionListener = Box<dyn Fn(bool) + Send + Sync>;

/// Exponential reconnect schedule
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub jitter: Duration,
    pub max_attempts: u32,
}

impl BackoffPolicy {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            base: config.reconnect_base_delay,
            max: config.reconnect_max_delay,
            jitter: config.reconnect_jitter,
            max_attempts: config.max_reconnect_attempts,
        }
    }

    /// Delay before attempt number `attempt` (0-based), `None` once attempts are exhausted
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let factor = 2u32.saturating_pow(attempt.min(16));
        let delay = self.base.saturating_mul(factor).min(self.max);
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        Some(delay + jitter)
    }
}

/// Owns the push connection and notifies listeners on every state transition
pub struct ConnectionManager {
    channel: Arc<dyn PushChannel>,
    inbound: Option<mpsc::UnboundedReceiver<PushFrame>>,
    state: ConnectionState,
    listeners: Vec<(ListenerId, ConnectionListener)>,
    next_listener: u64,
    backoff: BackoffPolicy,
}

impl ConnectionManager {
    pub fn new(channel: Arc<dyn PushChannel>, backoff: BackoffPolicy) -> Self {
        Self {
            channel,
            inbound: None,
            state: ConnectionState::Disconnected,
            listeners: Vec::new(),
            next_listener: 0,
            backoff,
        }
    }

    pub fn channel(&self) -> Arc<dyn PushChannel> {
        self.channel.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Open the connection. A no-op while already connected.
    ///
    /// Failures are handed to `on_error` and leave the manager disconnected.
    pub async fn connect<S, E>(&mut self, on_connected: S, on_error: E)
    where
        S: FnOnce(),
        E: FnOnce(&SyncError),
    {
        if self.state != ConnectionState::Disconnected {
            debug!("connect ignored, state is {:?}", self.state);
            return;
        }

        self.state = ConnectionState::Connecting;
        match self.channel.open().await {
            Ok(rx) => {
                self.inbound = Some(rx);
                info!("Push connection established");
                self.transition(ConnectionState::Connected);
                on_connected();
            }
            Err(e) => {
                warn!("Push connection failed: {}", e);
                self.state = ConnectionState::Disconnected;
                on_error(&e);
            }
        }
    }

    /// Close the connection deliberately
    pub async fn disconnect(&mut self) {
        if self.state == ConnectionState::Disconnected {
            return;
        }
        self.channel.close().await;
        self.inbound = None;
        info!("Push connection closed");
        self.transition(ConnectionState::Disconnected);
    }

    /// Record that the transport dropped the connection underneath us
    pub fn mark_dropped(&mut self) {
        if self.state != ConnectionState::Connected {
            return;
        }
        self.inbound = None;
        warn!("Push connection dropped");
        self.transition(ConnectionState::Disconnected);
    }

    /// Next inbound frame; `None` means the connection is gone (or was never open)
    pub async fn next_frame(&mut self) -> Option<PushFrame> {
        match self.inbound.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    pub fn on_connection_change(&mut self, listener: ConnectionListener) -> ListenerId {
        let id = ListenerId(self.next_listener);
        self.next_listener += 1;
        self.listeners.push((id, listener));
        id
    }

    pub fn off_connection_change(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(lid, _)| *lid != id);
        self.listeners.len() != before
    }

    /// Delay before reconnect attempt `attempt`, `None` when the budget is spent
    pub fn backoff_delay(&self, attempt: u32) -> Option<Duration> {
        self.backoff.delay(attempt)
    }

    fn transition(&mut self, next: ConnectionState) {
        let was_connected = self.is_connected();
        self.state = next;
        let now_connected = self.is_connected();
        if was_connected != now_connected {
            for (_, listener) in &self.listeners {
                listener(now_connected);
            }
        }
    }
}
