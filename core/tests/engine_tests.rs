/// Engine tests: history, optimistic sends, pagination, unread counters
mod common;

use chatsync_core::model::{is_temporary_id, ConversationKind, Origin};
use chatsync_core::transport::memory::BackendOp;
use chatsync_core::{BackendError, SyncConfig, SyncError, SyncEvent};
use common::*;

#[tokio::test(start_paused = true)]
async fn test_open_conversation_loads_newest_page() {
    let backend = seeded_backend();
    backend.store_message("c1", "bob", "one");
    backend.store_message("c1", "bob", "two");
    let last = backend.store_message("c1", "bob", "three");

    let h = start_open(backend, "c1").await;
    let snapshot = h.handle.snapshot();
    assert_eq!(bodies(&snapshot, "c1"), vec!["one", "two", "three"]);
    assert_eq!(snapshot.messages("c1")[0].sender_name.as_deref(), Some("Bob"));
    assert!(snapshot.messages("c1").iter().all(|m| !m.mine));

    let page = snapshot.page("c1").unwrap();
    assert_eq!((page.current_page, page.total_pages), (1, 1));

    // Opening marks the newest message read on the backend
    let last_id = last.id.unwrap();
    for _ in 0..50 {
        if h.backend.marked_read().contains(&last_id) {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(h.backend.marked_read().contains(&last_id));
}

#[tokio::test(start_paused = true)]
async fn test_echo_replaces_pending_message() {
    let backend = seeded_backend();
    let a = backend.store_message("c1", "bob", "A");
    let b = backend.store_message("c1", ME, "B");
    let h = start_open(backend, "c1").await;
    let mut events = h.handle.events();

    let temp_id = h.handle.send("c1", "C").await.unwrap();
    assert!(is_temporary_id(&temp_id));

    let event = wait_for_event(&mut events, |e| matches!(e, SyncEvent::MessageConfirmed { .. })).await;
    let SyncEvent::MessageConfirmed {
        temp_id: confirmed_temp,
        message_id,
        ..
    } = event
    else {
        unreachable!()
    };
    assert_eq!(confirmed_temp, temp_id);

    let snapshot = wait_for(&h.handle, |s| s.messages("c1").len() == 3).await;
    let ids: Vec<String> = snapshot.messages("c1").iter().map(|m| m.id.clone()).collect();
    assert_eq!(ids, vec![a.id.unwrap(), b.id.unwrap(), message_id]);
    assert!(snapshot.messages("c1").iter().all(|m| m.origin == Origin::Confirmed));
    assert!(snapshot.messages("c1")[2].mine);

    // Summary follows the confirmed message
    assert_eq!(
        snapshot.conversation("c1").unwrap().last_message.as_ref().unwrap().body,
        "C"
    );
}

#[tokio::test(start_paused = true)]
async fn test_pending_timeout_clears_spinner_only() {
    let backend = seeded_backend();
    let h = start_open(backend, "c1").await;
    h.channel.set_echo(false);

    let started = tokio::time::Instant::now();
    let temp_id = h.handle.send("c1", "hello").await.unwrap();
    let snapshot = wait_for(&h.handle, |s| s.messages("c1").len() == 1).await;
    assert_eq!(snapshot.messages("c1")[0].origin, Origin::Pending);

    let snapshot = wait_for(&h.handle, |s| {
        s.messages("c1")
            .first()
            .map(|m| m.origin == Origin::Unconfirmed)
            .unwrap_or(false)
    })
    .await;
    assert!(started.elapsed() >= std::time::Duration::from_secs(5));
    assert_eq!(snapshot.messages("c1")[0].id, temp_id);
    assert_eq!(snapshot.messages("c1")[0].body, "hello");

    // A late echo still replaces the unconfirmed entry
    h.channel.inject_message("c1", ME, "hello");
    let snapshot = wait_for(&h.handle, |s| {
        s.messages("c1")
            .first()
            .map(|m| m.origin == Origin::Confirmed)
            .unwrap_or(false)
    })
    .await;
    assert_eq!(bodies(&snapshot, "c1"), vec!["hello"]);
}

#[tokio::test(start_paused = true)]
async fn test_publish_failure_uses_fallback() {
    let backend = seeded_backend();
    let h = start_open(backend, "c1").await;
    h.channel.set_fail_publish(true);

    h.handle.send("c1", "via rest").await.unwrap();
    let snapshot = wait_for(&h.handle, |s| {
        s.messages("c1")
            .iter()
            .any(|m| m.body == "via rest" && m.origin == Origin::Confirmed)
    })
    .await;
    assert_eq!(snapshot.messages("c1").len(), 1);
    assert_eq!(
        h.backend.fallback_sends(),
        vec![("c1".to_string(), "via rest".to_string())]
    );
}

#[tokio::test(start_paused = true)]
async fn test_failed_fallback_can_be_resent() {
    let backend = seeded_backend();
    let h = start(backend, config()).await;
    h.handle.refresh_conversations().await.unwrap();
    h.backend
        .fail_next(BackendOp::SendMessage, BackendError::status(500, "boom"));

    // Not connected: goes straight to the fallback path
    let temp_id = h.handle.send("c1", "retry me").await.unwrap();
    let snapshot = wait_for(&h.handle, |s| {
        s.messages("c1").iter().any(|m| m.is_failed())
    })
    .await;
    assert_eq!(snapshot.messages("c1")[0].id, temp_id);
    let Origin::Failed { reason } = &snapshot.messages("c1")[0].origin else {
        panic!("expected failed origin");
    };
    assert!(reason.contains("500"));

    let second = h.handle.resend("c1", &temp_id).await.unwrap();
    assert_ne!(second, temp_id);
    let snapshot = wait_for(&h.handle, |s| {
        s.messages("c1").len() == 1 && s.messages("c1")[0].origin == Origin::Confirmed
    })
    .await;
    assert_eq!(bodies(&snapshot, "c1"), vec!["retry me"]);

    // Only failed entries can be resent
    let err = h.handle.resend("c1", &second).await.unwrap_err();
    assert!(matches!(err, SyncError::SendFailed(_)));
}

#[tokio::test(start_paused = true)]
async fn test_load_older_prepends_and_advances_page() {
    let backend = seeded_backend();
    backend.store_message("c1", "bob", "X");
    backend.store_message("c1", "bob", "A");
    backend.store_message("c1", ME, "B");

    let config = SyncConfig {
        page_size: 2,
        ..config()
    };
    let h = start(backend, config).await;
    h.handle.connect().await.unwrap();
    h.handle.refresh_conversations().await.unwrap();
    h.handle.open_conversation("c1").await.unwrap();
    let snapshot = wait_for(&h.handle, |s| s.messages("c1").len() == 2).await;
    assert_eq!(bodies(&snapshot, "c1"), vec!["A", "B"]);
    assert_eq!(snapshot.page("c1").unwrap().total_pages, 2);

    h.handle.send("c1", "C").await.unwrap();
    wait_for(&h.handle, |s| {
        s.messages("c1").len() == 3 && s.messages("c1").iter().all(|m| m.origin == Origin::Confirmed)
    })
    .await;

    let mut events = h.handle.events();
    assert!(h.handle.load_older("c1").await.unwrap());

    let event = wait_for_event(&mut events, |e| matches!(e, SyncEvent::HistoryPrepended { .. })).await;
    assert!(matches!(event, SyncEvent::HistoryPrepended { count: 1, .. }));

    let snapshot = wait_for(&h.handle, |s| s.page("c1").map(|p| p.current_page == 2).unwrap_or(false)).await;
    assert_eq!(bodies(&snapshot, "c1"), vec!["X", "A", "B", "C"]);
    let page = snapshot.page("c1").unwrap();
    assert_eq!(page.current_page, 2);
    assert!(!page.has_more());
    assert!(!h.handle.load_older("c1").await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_unread_counts_background_conversations() {
    let backend = seeded_backend();
    let h = start_open(backend, "c1").await;
    h.handle
        .set_visible_conversations(vec!["c1".into(), "c2".into()])
        .await
        .unwrap();

    h.channel.inject_message("c2", "bob", "hi");
    h.channel.inject_message("c2", "ann", "hello?");
    h.channel.inject_message("c2", ME, "from my phone");
    h.channel.inject_message("c1", "bob", "open one");

    let snapshot = wait_for(&h.handle, |s| s.messages("c1").len() == 1 && s.unread("c2") == 2).await;
    assert_eq!(snapshot.unread("c1"), 0);
    assert_eq!(snapshot.conversation("c2").unwrap().unread_count, 2);
    assert_eq!(
        snapshot.conversation("c2").unwrap().last_message.as_ref().unwrap().body,
        "from my phone"
    );
    // Most recent activity first
    assert_eq!(snapshot.conversations[0].id, "c1");

    h.handle.open_conversation("c2").await.unwrap();
    let snapshot = wait_for(&h.handle, |s| s.open_conversation.as_deref() == Some("c2")).await;
    assert_eq!(snapshot.unread("c2"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_authoritative_unread_count() {
    let backend = seeded_backend();
    let h = start_open(backend, "c1").await;
    h.backend.set_unread("c2", 7);

    h.handle.refresh_unread("c2").await.unwrap();
    wait_for(&h.handle, |s| s.unread("c2") == 7).await;

    h.handle.mark_read("c2").await.unwrap();
    wait_for(&h.handle, |s| s.unread("c2") == 0).await;
}

#[tokio::test(start_paused = true)]
async fn test_history_failures_are_visible_per_conversation() {
    let backend = seeded_backend();
    let h = start(backend, config()).await;
    h.handle.refresh_conversations().await.unwrap();

    h.backend
        .fail_next(BackendOp::GetMessages, BackendError::status(403, "nope"));
    h.handle.open_conversation("c1").await.unwrap();
    let snapshot = wait_for(&h.handle, |s| s.errors.contains_key("c1")).await;
    assert_eq!(
        snapshot.errors["c1"],
        "You no longer have access to this conversation."
    );

    // Retrying clears the error
    assert!(h.handle.load_initial("c1").await.unwrap());
    wait_for(&h.handle, |s| !s.errors.contains_key("c1")).await;
}

#[tokio::test(start_paused = true)]
async fn test_missing_history_is_an_empty_page() {
    let backend = seeded_backend();
    let h = start(backend, config()).await;
    h.handle.refresh_conversations().await.unwrap();

    h.backend
        .fail_next(BackendOp::GetMessages, BackendError::status(404, "gone"));
    h.handle.open_conversation("c2").await.unwrap();
    let snapshot = wait_for(&h.handle, |s| s.page("c2").map(|p| p.current_page == 1).unwrap_or(false)).await;
    assert!(snapshot.messages("c2").is_empty());
    assert!(snapshot.errors.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_create_and_leave_conversation() {
    let backend = seeded_backend();
    let h = start_open(backend, "c1").await;

    let created = h
        .handle
        .create_conversation(ConversationKind::Direct, vec!["zoe".into()])
        .await
        .unwrap();
    assert_eq!(created.kind, ConversationKind::Direct);
    assert_eq!(created.display_name, "zoe");
    let id = created.id.clone();
    wait_for(&h.handle, move |s| s.conversation(&id).is_some()).await;

    h.handle.leave_conversation("c1").await.unwrap();
    let snapshot = wait_for(&h.handle, |s| s.conversation("c1").is_none()).await;
    assert!(snapshot.open_conversation.is_none());
    assert!(snapshot.messages("c1").is_empty());

    let err = h.handle.leave_conversation("c1").await.unwrap_err();
    assert!(matches!(err, SyncError::FetchFailed(_)));
}

#[tokio::test(start_paused = true)]
async fn test_unknown_conversation_and_empty_body() {
    let backend = seeded_backend();
    let h = start_open(backend, "c1").await;

    let err = h.handle.send("nowhere", "hi").await.unwrap_err();
    assert!(matches!(err, SyncError::UnknownConversation(_)));
    let err = h.handle.open_conversation("nowhere").await.unwrap_err();
    assert!(matches!(err, SyncError::UnknownConversation(_)));
    let err = h.handle.send("c1", "   ").await.unwrap_err();
    assert!(matches!(err, SyncError::SendFailed(_)));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_engine() {
    let backend = seeded_backend();
    let h = start_open(backend, "c1").await;
    h.handle.shutdown().await.unwrap();
    let err = h.handle.send("c1", "late").await.unwrap_err();
    assert!(matches!(err, SyncError::EngineStopped));
    assert!(!h.channel.is_open());
}

#[tokio::test(start_paused = true)]
async fn test_unchanged_timelines_are_shared_between_snapshots() {
    let backend = seeded_backend();
    backend.store_message("c1", "bob", "hello");
    let h = start_open(backend, "c1").await;
    let before = h.handle.snapshot();

    h.channel.push_typing("c1", "bob", true);
    let typing = wait_for(&h.handle, |s| !s.typing_in("c1").is_empty()).await;
    assert!(typing.rev > before.rev);
    assert!(std::sync::Arc::ptr_eq(&before.timelines["c1"], &typing.timelines["c1"]));

    h.channel.inject_message("c1", "bob", "again");
    let changed = wait_for(&h.handle, |s| s.messages("c1").len() == 2).await;
    assert!(!std::sync::Arc::ptr_eq(&before.timelines["c1"], &changed.timelines["c1"]));
}
