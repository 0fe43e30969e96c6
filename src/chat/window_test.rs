use super::*;
use serde_json::json;
use std::sync::Mutex;

use crate::api::events::{ChangeKind, RowChange, TYPING_TABLE};
use crate::testing::{Fixture, delete_change, insert_change, message, update_change};

fn options() -> ChatOptions {
    ChatOptions {
        request_timeout: Duration::from_secs(1),
        typing_debounce: Duration::from_millis(300),
        typing_ttl: Duration::from_secs(3),
        reconnect_initial: Duration::from_millis(10),
        reconnect_max: Duration::from_millis(40),
    }
}

fn history() -> Vec<Message> {
    vec![
        message("a", "them", "me", 0, "Is the bike still for sale?"),
        message("b", "me", "them", 10, "Yes"),
        message("c", "them", "me", 20, "Can I see it tomorrow?"),
        // another buyer asking about the same ad
        message("x", "stranger", "me", 15, "Hello?"),
    ]
}

async fn open_as(fx: &Fixture, user: &str, counterpart: &str) -> ChatWindow {
    let name = if counterpart == "them" { "Ana" } else { "Ben" };
    match ChatWindow::open(
        fx.collaborators(Some(user)),
        options(),
        "ad-1",
        Counterpart::new(counterpart, name),
        None,
    )
    .await
    {
        Ok(window) => window,
        Err(e) => panic!("open failed: {e}"),
    }
}

async fn next(window: &mut ChatWindow) -> ViewUpdate {
    tokio::time::timeout(Duration::from_secs(2), window.next_update())
        .await
        .expect("update in time")
}

fn ids(window: &ChatWindow) -> Vec<&str> {
    window.messages().iter().map(|m| m.id.as_str()).collect()
}

// =============================================================================
// open
// =============================================================================

#[tokio::test]
async fn anonymous_open_redirects_to_sign_in() {
    let fx = Fixture::new(history());
    let opened = ChatWindow::open(
        fx.collaborators(None),
        options(),
        "ad-1",
        Counterpart::new("them", "Ana"),
        None,
    )
    .await;
    let Err(ChatError::SignInRequired { redirect }) = opened else {
        panic!("expected sign-in redirect");
    };
    assert_eq!(redirect, "https://example.test/login");
    assert_eq!(fx.feed.subscriptions(), 0);
    assert_eq!(fx.backend.state.lock().unwrap().history_fetches, 0);
}

#[tokio::test]
async fn open_subscribes_and_loads_scoped_history() {
    let fx = Fixture::new(history());
    let window = open_as(&fx, "me", "them").await;
    assert_eq!(ids(&window), vec!["a", "b", "c"]);
    assert!(window.is_subscribed());
    assert_eq!(fx.feed.subscriptions(), 1);
    assert_eq!(window.counterpart_name(), "Ana");
}

#[tokio::test]
async fn open_paints_cached_snapshot_when_offline() {
    let fx = Fixture::new(history());
    let scope = ConversationScope::new("ad-1", "me", "them");
    let mut cache = SnapshotCache::open_in_memory().unwrap();
    cache.save_history(&scope, &history()).unwrap();
    fx.backend.set_offline(true);

    let window = ChatWindow::open(
        fx.collaborators(Some("me")),
        options(),
        "ad-1",
        Counterpart::new("them", "Ana"),
        Some(cache),
    )
    .await
    .ok()
    .expect("open is not fatal");
    assert_eq!(ids(&window), vec!["a", "b", "c"]);
    assert_eq!(fx.notifier.errors(), 1);
}

// =============================================================================
// send
// =============================================================================

#[tokio::test]
async fn send_hello_then_counterpart_reads_it() {
    let fx = Fixture::new(Vec::new());
    let mut mine = open_as(&fx, "me", "them").await;
    let mut theirs = open_as(&fx, "them", "me").await;

    mine.set_composer("Hello");
    let id = mine.send().await.unwrap();
    assert_eq!(mine.composer(), "");
    assert_eq!(mine.messages().len(), 1);
    let sent = &mine.messages()[0];
    assert_eq!(sent.sender_id, "me");
    assert_eq!(sent.content, "Hello");
    assert!(!sent.is_read);

    // the counterpart sees it through the feed and reads it
    let row = fx.backend.row(&id).unwrap();
    fx.feed.push(FeedSignal::Change(insert_change(&row)));
    assert_eq!(
        next(&mut theirs).await,
        ViewUpdate::Inserted {
            id: id.clone(),
            scroll_to_bottom: true
        }
    );
    assert!(theirs.mark_read(&id).await.unwrap());
    assert!(!theirs.mark_read(&id).await.unwrap(), "second mark is a no-op");
    assert!(fx.backend.row(&id).unwrap().is_read);

    // the sender's own insert echo is absorbed, the read flip is not
    fx.feed.push(FeedSignal::Change(update_change(&fx.backend.row(&id).unwrap())));
    assert_eq!(next(&mut mine).await, ViewUpdate::Updated { id: id.clone() });
    assert!(mine.store().get(&id).unwrap().is_read);
    assert_eq!(fx.notifier.errors(), 0);
}

#[tokio::test]
async fn empty_send_is_rejected_without_a_request() {
    let fx = Fixture::new(history());
    let mut window = open_as(&fx, "me", "them").await;
    window.set_composer("   ");
    assert!(!window.can_send());

    let err = window.send().await.unwrap_err();
    assert!(matches!(err, ChatError::ValidationFailure(_)));
    assert_eq!(fx.backend.state.lock().unwrap().inserts, 0);
}

#[tokio::test]
async fn failed_send_restores_draft_and_reply_target() {
    let fx = Fixture::new(history());
    let mut window = open_as(&fx, "me", "them").await;
    window.reply_to("a").unwrap();
    window.set_composer("Tomorrow works");
    fx.backend.set_offline(true);

    let err = window.send().await.unwrap_err();
    assert!(err.is_network());
    assert_eq!(window.composer(), "Tomorrow works");
    assert_eq!(window.reply_target().map(|m| m.id.as_str()), Some("a"));
    assert!(window.can_send());
    assert!(!window.is_sending());
    assert_eq!(window.messages().len(), 3);
    assert_eq!(fx.notifier.errors(), 1);
}

#[tokio::test]
async fn reply_is_attached_and_cleared() {
    let fx = Fixture::new(history());
    let mut window = open_as(&fx, "me", "them").await;
    window.reply_to("c").unwrap();
    window.set_composer("Sure, after 5");
    let id = window.send().await.unwrap();

    assert!(window.reply_target().is_none());
    let sent = window.store().get(&id).unwrap();
    assert_eq!(sent.reply_to_message_id.as_deref(), Some("c"));
    assert!(matches!(window.reply_to("nope"), Err(ChatError::NotFound(_))));
}

// =============================================================================
// edit / delete
// =============================================================================

#[tokio::test]
async fn edit_keeps_position_and_marks_edited() {
    let fx = Fixture::new(history());
    let mut window = open_as(&fx, "me", "them").await;
    let created = window.store().get("b").unwrap().created_at;

    assert_eq!(window.begin_edit("b").unwrap(), "Yes");
    window.commit_edit("Yes, still for sale").await.unwrap();

    assert_eq!(ids(&window), vec!["a", "b", "c"]);
    let edited = window.store().get("b").unwrap();
    assert_eq!(edited.content, "Yes, still for sale");
    assert_eq!(edited.created_at, created);
    assert!(edited.is_edited());
    assert!(window.editing().is_none());
}

#[tokio::test]
async fn only_the_sender_may_edit_or_delete() {
    let fx = Fixture::new(history());
    let mut window = open_as(&fx, "me", "them").await;

    let err = window.edit("a", "rewritten").await.unwrap_err();
    assert!(matches!(err, ChatError::PermissionDenied(_)));
    assert!(matches!(window.request_delete("a"), Err(ChatError::PermissionDenied(_))));
    assert!(matches!(window.begin_edit("a"), Err(ChatError::PermissionDenied(_))));

    assert_eq!(fx.backend.row("a").unwrap().content, "Is the bike still for sale?");
    assert_eq!(fx.notifier.errors(), 3);
}

#[tokio::test]
async fn deleted_message_ignores_late_updates() {
    let fx = Fixture::new(history());
    let mut window = open_as(&fx, "me", "them").await;
    let mut late = window.store().get("b").unwrap().clone();

    window.request_delete("b").unwrap();
    assert_eq!(window.pending_delete(), Some("b"));
    window.confirm_delete().await.unwrap();
    assert_eq!(ids(&window), vec!["a", "c"]);
    assert!(fx.backend.row("b").is_none());

    late.content = "zombie".into();
    fx.feed.push(FeedSignal::Change(update_change(&late)));
    fx.feed.push(FeedSignal::Change(delete_change("b")));
    let d = message("d", "them", "me", 30, "Ok");
    fx.feed.push(FeedSignal::Change(insert_change(&d)));

    assert_eq!(
        next(&mut window).await,
        ViewUpdate::Inserted {
            id: "d".into(),
            scroll_to_bottom: true
        }
    );
    assert_eq!(ids(&window), vec!["a", "c", "d"]);
}

#[tokio::test]
async fn remote_delete_clears_reply_target() {
    let fx = Fixture::new(history());
    let mut window = open_as(&fx, "me", "them").await;
    window.reply_to("c").unwrap();

    fx.feed.push(FeedSignal::Change(delete_change("c")));
    assert_eq!(next(&mut window).await, ViewUpdate::Removed { id: "c".into() });
    assert!(window.reply_target().is_none());
}

// =============================================================================
// typing
// =============================================================================

#[tokio::test]
async fn keystrokes_within_debounce_write_once_and_send_clears() {
    let fx = Fixture::new(history());
    let mut window = open_as(&fx, "me", "them").await;
    let t0 = Utc::now();

    window.on_keystroke_at("H", t0).await;
    window
        .on_keystroke_at("He", t0 + chrono::Duration::milliseconds(120))
        .await;
    assert_eq!(window.composer(), "He");
    assert_eq!(fx.backend.state.lock().unwrap().typing_writes.len(), 1);

    window.set_composer("Hello");
    window.send().await.unwrap();
    assert_eq!(fx.backend.state.lock().unwrap().typing_clears, 1);
}

#[tokio::test]
async fn erasing_the_composer_does_not_signal_typing() {
    let fx = Fixture::new(history());
    let mut window = open_as(&fx, "me", "them").await;
    window.on_keystroke("").await;
    window.on_keystroke("  ").await;
    assert!(fx.backend.state.lock().unwrap().typing_writes.is_empty());
}

fn typing_change(user: &str, recipient: &str) -> RowChange {
    let now = Utc::now();
    RowChange {
        table: TYPING_TABLE.into(),
        kind: ChangeKind::Insert,
        record: json!({
            "ad_id": "ad-1",
            "user_id": user,
            "recipient_id": recipient,
            "created_at": now,
            "expires_at": now + chrono::Duration::seconds(3),
        }),
        old_record: serde_json::Value::Null,
    }
}

#[tokio::test]
async fn counterpart_typing_shows_label_until_expiry() {
    let fx = Fixture::new(history());
    let mut window = open_as(&fx, "me", "them").await;
    assert!(window.typing_label(Utc::now()).is_none());

    fx.feed.push(FeedSignal::Change(typing_change("them", "me")));
    assert_eq!(next(&mut window).await, ViewUpdate::TypingChanged);
    assert_eq!(window.typing_label(Utc::now()).as_deref(), Some("Ana is typing…"));
    assert!(window.typing_label(Utc::now() + chrono::Duration::seconds(4)).is_none());
}

#[tokio::test]
async fn typing_from_another_buyer_is_not_shown() {
    let fx = Fixture::new(history());
    let mut window = open_as(&fx, "me", "them").await;

    fx.feed.push(FeedSignal::Change(typing_change("stranger", "me")));
    let d = message("d", "them", "me", 30, "Ok");
    fx.feed.push(FeedSignal::Change(insert_change(&d)));
    assert!(matches!(next(&mut window).await, ViewUpdate::Inserted { .. }));
    assert!(window.typing_label(Utc::now()).is_none());
}

// =============================================================================
// read state
// =============================================================================

#[tokio::test]
async fn click_to_read_marks_incoming_and_updates_badge() {
    let fx = Fixture::new(history());
    let mut window = open_as(&fx, "me", "them").await;
    let badge = Arc::new(Mutex::new(Vec::new()));
    let sink = badge.clone();
    window.set_unread_badge(Box::new(move |n| sink.lock().unwrap().push(n)));
    assert_eq!(*badge.lock().unwrap(), vec![2]);

    let e = message("e", "them", "me", 40, "Still there?");
    fx.feed.push(FeedSignal::Change(insert_change(&e)));
    next(&mut window).await;
    assert_eq!(*badge.lock().unwrap(), vec![2, 3]);

    assert_eq!(window.on_message_clicked("c").await.unwrap(), 3);
    assert_eq!(*badge.lock().unwrap(), vec![2, 3, 0]);
    assert!(!window.store().get("b").unwrap().is_read, "own message untouched");
}

// =============================================================================
// resync
// =============================================================================

#[tokio::test]
async fn dropped_feed_resubscribes_and_refetches() {
    let fx = Fixture::new(history());
    let mut window = open_as(&fx, "me", "them").await;

    // missed while the feed was down
    fx.backend
        .state
        .lock()
        .unwrap()
        .rows
        .push(message("m", "them", "me", 50, "Hello again"));
    fx.feed.push(FeedSignal::Dropped("socket closed".into()));

    assert_eq!(next(&mut window).await, ViewUpdate::Resynced);
    assert_eq!(ids(&window), vec!["a", "b", "c", "m"]);
    assert_eq!(fx.feed.subscriptions(), 2);
    assert_eq!(fx.backend.state.lock().unwrap().history_fetches, 2);
    assert_eq!(fx.notifier.errors(), 0);
}

#[tokio::test]
async fn failed_resync_notifies_once_and_recovers() {
    let fx = Fixture::new(history());
    let mut window = open_as(&fx, "me", "them").await;
    fx.backend.set_offline(true);
    fx.feed.push(FeedSignal::Dropped("socket closed".into()));

    assert_eq!(next(&mut window).await, ViewUpdate::Offline);
    assert_eq!(next(&mut window).await, ViewUpdate::Offline);
    assert!(!window.is_subscribed());
    assert_eq!(fx.notifier.errors(), 1);

    fx.backend.set_offline(false);
    assert_eq!(next(&mut window).await, ViewUpdate::Resynced);
    assert!(window.is_subscribed());
}

#[tokio::test]
async fn interrupted_resync_fetches_again_on_next_update() {
    let fx = Fixture::new(history());
    let mut window = open_as(&fx, "me", "them").await;

    fx.backend
        .state
        .lock()
        .unwrap()
        .rows
        .push(message("m", "them", "me", 50, "Sent during the gap"));
    fx.backend.set_history_delay(Duration::from_millis(300));
    fx.feed.push(FeedSignal::Dropped("socket closed".into()));

    // the front-end stops waiting while the history fetch is still in flight
    let interrupted = tokio::time::timeout(Duration::from_millis(100), window.next_update()).await;
    assert!(interrupted.is_err());
    assert!(!window.is_subscribed(), "feed stays down until history is back");
    assert_eq!(ids(&window), vec!["a", "b", "c"]);

    fx.backend.set_history_delay(Duration::ZERO);
    assert_eq!(next(&mut window).await, ViewUpdate::Resynced);
    assert!(window.is_subscribed());
    assert_eq!(ids(&window), vec!["a", "b", "c", "m"]);
}

#[tokio::test]
async fn becoming_visible_resyncs_a_dead_feed() {
    let fx = Fixture::new(history());
    fx.feed.refuse.store(true, std::sync::atomic::Ordering::SeqCst);
    let mut window = open_as(&fx, "me", "them").await;
    assert!(!window.is_subscribed());

    fx.feed.refuse.store(false, std::sync::atomic::Ordering::SeqCst);
    assert_eq!(window.on_visible().await, Some(ViewUpdate::Resynced));
    assert_eq!(window.on_visible().await, None);
}

#[tokio::test]
async fn close_unsubscribes_and_clears_typing() {
    let fx = Fixture::new(history());
    let mut window = open_as(&fx, "me", "them").await;
    window.on_keystroke("typing").await;
    window.close().await;

    assert!(fx.feed.is_current_closed());
    assert_eq!(fx.backend.state.lock().unwrap().typing_clears, 1);
}
