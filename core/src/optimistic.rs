/// Per-send state machine for optimistic messages
///
/// Every send owns exactly one local timeline entry. The coordinator tracks which path delivered
/// it and settles it exactly once: confirmed by an echo or fallback response, timed out (spinner
/// cleared, entry kept), or failed.
use crate::model::{Message, TempId};
use crate::timeline::MessageTimeline;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    Pending,
    TimedOut,
    Confirmed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPath {
    /// Published on `send:<conversation>`, confirmed by echo
    Live,
    /// Request/response `send_message`
    Fallback,
}

#[derive(Debug, Clone)]
pub struct OutstandingSend {
    pub conversation_id: String,
    pub body: String,
    pub path: DeliveryPath,
    pub state: SendState,
}

#[derive(Debug, Default)]
pub struct OptimisticWriteCoordinator {
    sends: HashMap<TempId, OutstandingSend>,
}

impl OptimisticWriteCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert the pending entry and start tracking it on `path`
    pub fn begin(
        &mut self,
        timeline: &mut MessageTimeline,
        sender_id: &str,
        body: &str,
        path: DeliveryPath,
        now: DateTime<Utc>,
    ) -> TempId {
        let temp_id = timeline.insert_optimistic(sender_id, body, now);
        debug!(
            conversation_id = %timeline.conversation_id(),
            temp_id = %temp_id,
            ?path,
            "optimistic send started"
        );
        self.sends.insert(
            temp_id.clone(),
            OutstandingSend {
                conversation_id: timeline.conversation_id().to_string(),
                body: body.to_string(),
                path,
                state: SendState::Pending,
            },
        );
        temp_id
    }

    /// Live publish failed; the send continues on the fallback path
    pub fn switch_to_fallback(&mut self, temp_id: &str) {
        if let Some(send) = self.sends.get_mut(temp_id) {
            send.path = DeliveryPath::Fallback;
        }
    }

    /// Confirmation window elapsed without an echo: clear the pending flag only
    pub fn on_timeout(&mut self, timeline: &mut MessageTimeline, temp_id: &str) -> bool {
        let Some(send) = self.sends.get_mut(temp_id) else {
            return false;
        };
        if send.state != SendState::Pending || send.path != DeliveryPath::Live {
            return false;
        }
        if !timeline.clear_pending(temp_id) {
            return false;
        }
        send.state = SendState::TimedOut;
        info!(temp_id, "send unconfirmed after timeout");
        true
    }

    /// The timeline matched an echo to `temp_id`
    pub fn on_echo(&mut self, temp_id: &str) -> bool {
        match self.sends.remove(temp_id) {
            Some(send) => {
                debug!(temp_id, state = ?send.state, "send confirmed by echo");
                true
            }
            None => false,
        }
    }

    /// Apply the fallback response
    pub fn on_fallback_result(
        &mut self,
        timeline: &mut MessageTimeline,
        temp_id: &str,
        result: Result<Message, String>,
    ) -> SendState {
        match result {
            Ok(confirmed) => {
                timeline.reconcile(temp_id, Ok(confirmed));
                self.sends.remove(temp_id);
                SendState::Confirmed
            }
            Err(reason) => {
                if !timeline.reconcile(temp_id, Err(reason.clone())) {
                    // Already settled by an echo
                    self.sends.remove(temp_id);
                    return SendState::Confirmed;
                }
                warn!(temp_id, "fallback send failed: {}", reason);
                if let Some(send) = self.sends.get_mut(temp_id) {
                    send.state = SendState::Failed;
                }
                SendState::Failed
            }
        }
    }

    /// Remove a failed entry and hand back its body for a fresh send
    pub fn take_for_resend(&mut self, timeline: &mut MessageTimeline, temp_id: &str) -> Option<String> {
        let failed_here = timeline.get(temp_id).map(Message::is_failed).unwrap_or(false);
        if !failed_here {
            return None;
        }
        let removed = timeline.remove(temp_id)?;
        self.sends.remove(temp_id);
        Some(removed.body)
    }

    pub fn get(&self, temp_id: &str) -> Option<&OutstandingSend> {
        self.sends.get(temp_id)
    }

    pub fn state(&self, temp_id: &str) -> Option<SendState> {
        self.sends.get(temp_id).map(|s| s.state)
    }

    /// Sends still waiting for a confirmation in `conversation_id`
    pub fn outstanding(&self, conversation_id: &str) -> usize {
        self.sends
            .values()
            .filter(|s| s.conversation_id == conversation_id)
            .filter(|s| matches!(s.state, SendState::Pending | SendState::TimedOut))
            .count()
    }

    /// Forget every send of a conversation whose timeline was dropped
    pub fn forget_conversation(&mut self, conversation_id: &str) {
        self.sends.retain(|_, s| s.conversation_id != conversation_id);
    }
}
