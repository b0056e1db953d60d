/// Ordered, deduplicated message timeline of one conversation
///
/// Merges three sources: history pages, optimistic local entries and pushed events. After every
/// operation the entries are sorted by `created_at` (stable, so equal timestamps keep arrival
/// order) and no permanent id appears twice.
use crate::model::{is_temporary_id, Message, Origin, TempId};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashSet;
use tracing::{debug, trace};

/// How far a confirmed history record may predate the local entry it confirms
const HISTORY_MATCH_WINDOW_SECS: i64 = 60;

/// Result of `ingest_pushed`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    /// Same permanent id already present; updated in place
    Updated,
    /// Appended; `confirmed_temp` is the local entry it replaced, if any
    Appended { confirmed_temp: Option<TempId> },
    /// Event belongs to another conversation
    Ignored,
}

/// Result of a history merge
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryMerge {
    /// Messages not previously present
    pub added: usize,
    /// Local entries replaced by their confirmed records
    pub confirmed_temps: Vec<TempId>,
}

#[derive(Debug, Clone)]
pub struct MessageTimeline {
    conversation_id: String,
    entries: Vec<Message>,
    revision: u64,
}

impl MessageTimeline {
    pub fn new(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            entries: Vec::new(),
            revision: 0,
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn messages(&self) -> &[Message] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bumped by every mutation
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.entries.iter().find(|m| m.id == id)
    }

    /// Newest message the backend knows about (used for mark-read)
    pub fn last_confirmed(&self) -> Option<&Message> {
        self.entries.iter().rev().find(|m| m.is_confirmed())
    }

    /// Apply a history page. Page 1 (newest) replaces the confirmed content it covers while keeping
    /// local entries; later pages are merged in front.
    ///
    /// Confirmed entries not in page 1 survive when they are at least as new as its newest record:
    /// they were pushed while the fetch was in flight.
    pub fn ingest_history(&mut self, page: u32, messages: Vec<Message>) -> HistoryMerge {
        let mut merge = HistoryMerge::default();
        if page <= 1 {
            let newest = messages.iter().map(|m| m.created_at).max();
            let in_page: HashSet<String> = messages.iter().map(|m| m.id.clone()).collect();
            let before = self.entries.len();
            self.entries.retain(|m| {
                !m.is_confirmed()
                    || in_page.contains(&m.id)
                    || newest.map_or(true, |n| m.created_at >= n)
            });
            if self.entries.len() != before {
                trace!(
                    conversation_id = %self.conversation_id,
                    dropped = before - self.entries.len(),
                    "stale confirmed entries replaced by page 1"
                );
            }
            for msg in messages {
                self.merge_one(msg, true, &mut merge);
            }
        } else {
            for msg in messages {
                self.merge_one(msg, false, &mut merge);
            }
        }
        self.sort();
        debug!(
            conversation_id = %self.conversation_id,
            page,
            added = merge.added,
            total = self.entries.len(),
            "history ingested"
        );
        merge
    }

    /// Upsert the newest page fetched after a reconnect without resetting anything
    pub fn merge_latest(&mut self, messages: Vec<Message>) -> HistoryMerge {
        let mut merge = HistoryMerge::default();
        for msg in messages {
            self.merge_one(msg, true, &mut merge);
        }
        self.sort();
        merge
    }

    /// Apply a normalized pushed message
    pub fn ingest_pushed(&mut self, msg: Message) -> PushOutcome {
        if msg.conversation_id != self.conversation_id {
            return PushOutcome::Ignored;
        }

        if let Some(existing) = self.entries.iter_mut().find(|m| m.id == msg.id) {
            trace!(message_id = %msg.id, "duplicate push, updating in place");
            update_in_place(existing, msg);
            self.sort();
            return PushOutcome::Updated;
        }

        let confirmed_temp = if msg.mine {
            self.take_local_match(&msg, None)
        } else {
            None
        };
        self.entries.push(msg);
        self.sort();
        PushOutcome::Appended { confirmed_temp }
    }

    /// Append a pending local message and return its temporary id
    pub fn insert_optimistic(&mut self, sender_id: &str, body: &str, now: DateTime<Utc>) -> TempId {
        let msg = Message::optimistic(&self.conversation_id, sender_id, body, now);
        let id = msg.id.clone();
        self.entries.push(msg);
        self.sort();
        id
    }

    /// Settle a local entry: replace it with the confirmed message, or mark it failed.
    ///
    /// Returns false when there was nothing to settle (e.g. an echo already confirmed it).
    pub fn reconcile(&mut self, temp_id: &str, outcome: Result<Message, String>) -> bool {
        let local = self.entries.iter().position(|m| m.id == temp_id);
        match outcome {
            Ok(confirmed) => {
                if let Some(i) = local {
                    self.entries.remove(i);
                }
                let changed = match self.entries.iter_mut().find(|m| m.id == confirmed.id) {
                    Some(existing) => {
                        update_in_place(existing, confirmed);
                        local.is_some()
                    }
                    None => {
                        self.entries.push(confirmed);
                        true
                    }
                };
                self.sort();
                changed
            }
            Err(reason) => match local {
                Some(i) if self.entries[i].origin.is_local() => {
                    self.entries[i].origin = Origin::Failed { reason };
                    self.revision += 1;
                    true
                }
                _ => false,
            },
        }
    }

    /// Pending → Unconfirmed: stop the spinner, keep the message
    pub fn clear_pending(&mut self, temp_id: &str) -> bool {
        match self.entries.iter_mut().find(|m| m.id == temp_id) {
            Some(m) if m.is_pending() => {
                m.origin = Origin::Unconfirmed;
                self.revision += 1;
                true
            }
            _ => false,
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<Message> {
        let i = self.entries.iter().position(|m| m.id == id)?;
        self.revision += 1;
        Some(self.entries.remove(i))
    }

    fn merge_one(&mut self, msg: Message, reconcile_local: bool, merge: &mut HistoryMerge) {
        if msg.conversation_id != self.conversation_id {
            return;
        }
        if let Some(existing) = self.entries.iter_mut().find(|m| m.id == msg.id) {
            update_in_place(existing, msg);
            return;
        }
        if reconcile_local && msg.mine {
            let window = ChronoDuration::seconds(HISTORY_MATCH_WINDOW_SECS);
            if let Some(temp) = self.take_local_match(&msg, Some(window)) {
                merge.confirmed_temps.push(temp);
            }
        }
        self.entries.push(msg);
        merge.added += 1;
    }

    /// Remove the local entry `confirmed` stands for.
    ///
    /// Oldest local entry with an equal body wins. Without a `window` (live echo) the oldest local
    /// entry is taken when no body matches; with a window only body matches whose local entry was
    /// created no later than `window` after the confirmed timestamp count.
    fn take_local_match(&mut self, confirmed: &Message, window: Option<ChronoDuration>) -> Option<TempId> {
        let locals = || {
            self.entries
                .iter()
                .enumerate()
                .filter(|(_, m)| m.origin.is_local() && is_temporary_id(&m.id))
        };

        let by_body = locals()
            .filter(|(_, m)| m.body == confirmed.body)
            .filter(|(_, m)| match window {
                Some(w) => m.created_at <= confirmed.created_at + w,
                None => true,
            })
            .map(|(i, _)| i)
            .next();

        let index = match (by_body, window) {
            (Some(i), _) => Some(i),
            (None, None) => locals().map(|(i, _)| i).next(),
            (None, Some(_)) => None,
        }?;

        let removed = self.entries.remove(index);
        debug!(
            conversation_id = %self.conversation_id,
            temp_id = %removed.id,
            confirmed_id = %confirmed.id,
            "local message confirmed"
        );
        Some(removed.id)
    }

    fn sort(&mut self) {
        self.revision += 1;
        self.entries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    }
}

fn update_in_place(existing: &mut Message, incoming: Message) {
    let sender_name = incoming.sender_name.or_else(|| existing.sender_name.take());
    *existing = Message {
        sender_name,
        ..incoming
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn confirmed(id: &str, sender: &str, body: &str, secs: i64) -> Message {
        Message {
            id: id.to_string(),
            conversation_id: "c1".to_string(),
            sender_id: sender.to_string(),
            sender_name: None,
            body: body.to_string(),
            created_at: at(secs),
            mine: sender == "me",
            origin: Origin::Confirmed,
        }
    }

    fn ids(t: &MessageTimeline) -> Vec<String> {
        t.messages().iter().map(|m| m.id.clone()).collect()
    }

    fn assert_invariants(t: &MessageTimeline) {
        let msgs = t.messages();
        for pair in msgs.windows(2) {
            assert!(pair[0].created_at <= pair[1].created_at, "timeline out of order");
        }
        let mut seen = HashSet::new();
        for m in msgs {
            assert!(seen.insert(m.id.clone()), "duplicate id {}", m.id);
        }
    }

    #[test]
    fn test_echo_replaces_pending() {
        let mut t = MessageTimeline::new("c1");
        t.ingest_history(
            1,
            vec![confirmed("A", "bob", "a", 1), confirmed("B", "me", "b", 2)],
        );
        let temp = t.insert_optimistic("me", "C", at(3));
        assert_eq!(t.len(), 3);
        assert!(t.get(&temp).unwrap().is_pending());

        let outcome = t.ingest_pushed(confirmed("C9", "me", "C", 4));
        assert_eq!(
            outcome,
            PushOutcome::Appended {
                confirmed_temp: Some(temp.clone())
            }
        );
        assert_eq!(ids(&t), vec!["A", "B", "C9"]);
        assert!(t.get(&temp).is_none());
        assert!(t.get("C9").unwrap().is_confirmed());
    }

    #[test]
    fn test_older_page_prepends() {
        let mut t = MessageTimeline::new("c1");
        t.ingest_history(
            1,
            vec![confirmed("A", "bob", "a", 1), confirmed("B", "bob", "b", 2)],
        );
        let merge = t.ingest_history(2, vec![confirmed("X", "bob", "x", 0)]);
        assert_eq!(merge.added, 1);
        assert_eq!(ids(&t), vec!["X", "A", "B"]);
    }

    #[test]
    fn test_duplicate_push_is_noop() {
        let mut t = MessageTimeline::new("c1");
        t.ingest_pushed(confirmed("A", "bob", "a", 1));
        assert_eq!(t.ingest_pushed(confirmed("A", "bob", "a", 1)), PushOutcome::Updated);
        assert_eq!(t.len(), 1);

        let mut other = confirmed("Z", "bob", "z", 1);
        other.conversation_id = "c2".into();
        assert_eq!(t.ingest_pushed(other), PushOutcome::Ignored);
    }

    #[test]
    fn test_echo_matches_body_among_outstanding_sends() {
        let mut t = MessageTimeline::new("c1");
        let first = t.insert_optimistic("me", "one", at(1));
        let second = t.insert_optimistic("me", "two", at(2));

        let outcome = t.ingest_pushed(confirmed("M2", "me", "two", 3));
        assert_eq!(
            outcome,
            PushOutcome::Appended {
                confirmed_temp: Some(second)
            }
        );
        assert!(t.get(&first).unwrap().is_pending());

        // Server rewrote the body; oldest local entry is the one confirmed
        t.ingest_pushed(confirmed("M1", "me", "one (edited)", 4));
        assert!(t.get(&first).is_none());
        assert_eq!(ids(&t), vec!["M2", "M1"]);
    }

    #[test]
    fn test_failed_entries_survive_echoes() {
        let mut t = MessageTimeline::new("c1");
        let temp = t.insert_optimistic("me", "lost", at(1));
        assert!(t.reconcile(&temp, Err("rejected".into())));
        assert!(t.get(&temp).unwrap().is_failed());

        t.ingest_pushed(confirmed("M1", "me", "lost", 2));
        assert!(t.get(&temp).unwrap().is_failed());
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn test_timeout_then_late_echo() {
        let mut t = MessageTimeline::new("c1");
        let temp = t.insert_optimistic("me", "slow", at(1));
        assert!(t.clear_pending(&temp));
        assert!(!t.clear_pending(&temp));
        assert_eq!(t.get(&temp).unwrap().origin, Origin::Unconfirmed);

        t.ingest_pushed(confirmed("M1", "me", "slow", 9));
        assert_eq!(ids(&t), vec!["M1"]);
    }

    #[test]
    fn test_reconcile_after_echo_does_not_duplicate() {
        let mut t = MessageTimeline::new("c1");
        let temp = t.insert_optimistic("me", "hi", at(1));
        t.ingest_pushed(confirmed("M1", "me", "hi", 2));
        assert!(!t.reconcile(&temp, Ok(confirmed("M1", "me", "hi", 2))));
        assert!(!t.reconcile(&temp, Err("late failure".into())));
        assert_eq!(ids(&t), vec!["M1"]);
    }

    #[test]
    fn test_first_page_keeps_local_entries() {
        let mut t = MessageTimeline::new("c1");
        t.ingest_history(1, vec![confirmed("A", "bob", "a", 1)]);
        let temp = t.insert_optimistic("me", "draft", at(50));

        let merge = t.ingest_history(1, vec![confirmed("B", "bob", "b", 2)]);
        assert_eq!(merge.added, 1);
        assert_eq!(ids(&t), vec!["B".to_string(), temp]);
    }

    #[test]
    fn test_first_page_keeps_messages_pushed_during_fetch() {
        let mut t = MessageTimeline::new("c1");
        t.ingest_history(1, vec![confirmed("A", "bob", "a", 1), confirmed("GONE", "bob", "g", 2)]);
        // Pushed while the refetch of page 1 was in flight
        t.ingest_pushed(confirmed("LIVE", "bob", "live", 9));

        t.ingest_history(1, vec![confirmed("A", "bob", "a", 1), confirmed("B", "bob", "b", 3)]);
        assert_eq!(ids(&t), vec!["A", "B", "LIVE"]);

        // Nothing to compare against: keep what is already shown
        t.ingest_history(1, Vec::new());
        assert_eq!(ids(&t), vec!["A", "B", "LIVE"]);
    }

    #[test]
    fn test_revision_tracks_mutations() {
        let mut t = MessageTimeline::new("c1");
        let r0 = t.revision();
        let temp = t.insert_optimistic("me", "x", at(1));
        let r1 = t.revision();
        assert!(r1 > r0);
        assert_eq!(t.ingest_pushed({
            let mut m = confirmed("Z", "bob", "z", 1);
            m.conversation_id = "c2".into();
            m
        }), PushOutcome::Ignored);
        assert_eq!(t.revision(), r1);
        assert!(t.clear_pending(&temp));
        assert!(t.revision() > r1);
    }

    #[test]
    fn test_history_confirms_local_within_window() {
        let mut t = MessageTimeline::new("c1");
        let old_temp = t.insert_optimistic("me", "ok", at(500));
        let merge = t.merge_latest(vec![confirmed("OLD", "me", "ok", 1)]);
        assert!(merge.confirmed_temps.is_empty());
        assert!(t.get(&old_temp).is_some());

        let merge = t.merge_latest(vec![confirmed("NEW", "me", "ok", 499)]);
        assert_eq!(merge.confirmed_temps, vec![old_temp]);
        assert_eq!(ids(&t), vec!["OLD", "NEW"]);
    }

    #[test]
    fn test_random_interleavings_keep_invariants() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let mut t = MessageTimeline::new("c1");
            let mut next_id = 0;
            for _ in 0..40 {
                next_id += 1;
                let secs = rng.gen_range(0..100);
                let id = format!("m{}", rng.gen_range(0..next_id));
                let sender = if rng.gen_bool(0.5) { "me" } else { "bob" };
                match rng.gen_range(0..4) {
                    0 => {
                        t.ingest_history(rng.gen_range(1..4), vec![confirmed(&id, sender, "b", secs)]);
                    }
                    1 => {
                        t.ingest_pushed(confirmed(&id, sender, "b", secs));
                    }
                    2 => {
                        t.insert_optimistic("me", "b", at(secs));
                    }
                    _ => {
                        t.merge_latest(vec![confirmed(&id, sender, "b", secs)]);
                    }
                }
                assert_invariants(&t);
            }
        }
    }
}
