/// Per-conversation unread counts
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, trace};

/// Message ids remembered per conversation for duplicate detection
const RECENT_IDS: usize = 256;

#[derive(Debug, Default)]
struct RecentIds {
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl RecentIds {
    /// False when `id` was already seen
    fn insert(&mut self, id: &str) -> bool {
        if !self.ids.insert(id.to_string()) {
            return false;
        }
        self.order.push_back(id.to_string());
        if self.order.len() > RECENT_IDS {
            if let Some(evicted) = self.order.pop_front() {
                self.ids.remove(&evicted);
            }
        }
        true
    }
}

#[derive(Debug, Default)]
pub struct UnreadCounter {
    counts: HashMap<String, u32>,
    seen: HashMap<String, RecentIds>,
}

impl UnreadCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a new message unless it is ours, its conversation is open, or it was already counted
    pub fn record_incoming(
        &mut self,
        conversation_id: &str,
        message_id: &str,
        mine: bool,
        open_conversation: Option<&str>,
    ) -> bool {
        let first_delivery = self
            .seen
            .entry(conversation_id.to_string())
            .or_default()
            .insert(message_id);
        if !first_delivery {
            trace!(conversation_id, message_id, "already counted");
            return false;
        }
        if mine || open_conversation == Some(conversation_id) {
            return false;
        }
        let count = self.counts.entry(conversation_id.to_string()).or_insert(0);
        *count = count.saturating_add(1);
        true
    }

    pub fn mark_read(&mut self, conversation_id: &str) {
        if self.counts.remove(conversation_id).is_some() {
            debug!(conversation_id, "unread reset");
        }
    }

    /// Backend count replaces the local approximation
    pub fn set_authoritative(&mut self, conversation_id: &str, count: u32) {
        if count == 0 {
            self.counts.remove(conversation_id);
        } else {
            self.counts.insert(conversation_id.to_string(), count);
        }
    }

    pub fn forget(&mut self, conversation_id: &str) {
        self.counts.remove(conversation_id);
        self.seen.remove(conversation_id);
    }

    pub fn get(&self, conversation_id: &str) -> u32 {
        self.counts.get(conversation_id).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u32 {
        self.counts.values().fold(0u32, |acc, c| acc.saturating_add(*c))
    }

    pub fn snapshot(&self) -> HashMap<String, u32> {
        self.counts.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_only_foreign_background_messages() {
        let mut u = UnreadCounter::new();
        assert!(u.record_incoming("c1", "m1", false, Some("c2")));
        assert!(u.record_incoming("c1", "m2", false, None));
        assert!(!u.record_incoming("c1", "m3", true, None));
        assert!(!u.record_incoming("c2", "m4", false, Some("c2")));
        assert_eq!(u.get("c1"), 2);
        assert_eq!(u.get("c2"), 0);
        assert_eq!(u.total(), 2);
    }

    #[test]
    fn test_redelivery_is_counted_once() {
        let mut u = UnreadCounter::new();
        assert!(u.record_incoming("c1", "m1", false, None));
        assert!(!u.record_incoming("c1", "m1", false, None));
        u.mark_read("c1");
        assert!(!u.record_incoming("c1", "m1", false, None));
        assert_eq!(u.get("c1"), 0);

        // Same id in another conversation is a different message
        assert!(u.record_incoming("c2", "m1", false, None));
    }

    #[test]
    fn test_recent_ids_are_bounded() {
        let mut u = UnreadCounter::new();
        for i in 0..=RECENT_IDS {
            u.record_incoming("c1", &format!("m{}", i), false, None);
        }
        assert_eq!(u.seen["c1"].order.len(), RECENT_IDS);
        // Oldest id fell out of the window
        assert!(u.record_incoming("c1", "m0", false, None));
        assert!(!u.record_incoming("c1", &format!("m{}", RECENT_IDS), false, None));
    }

    #[test]
    fn test_reset_and_authoritative() {
        let mut u = UnreadCounter::new();
        u.record_incoming("c1", "m1", false, None);
        u.mark_read("c1");
        assert_eq!(u.get("c1"), 0);

        u.record_incoming("c1", "m2", false, None);
        u.set_authoritative("c1", 9);
        assert_eq!(u.get("c1"), 9);
        u.set_authoritative("c1", 0);
        assert!(u.snapshot().is_empty());

        u.record_incoming("c1", "m3", false, None);
        u.forget("c1");
        assert_eq!(u.get("c1"), 0);
        assert!(u.record_incoming("c1", "m3", false, None));
    }
}
