//! In-memory collaborators for exercising the chat core without a backend.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::api::events::{ChangeKind, MESSAGES_TABLE, RowChange};
use crate::api::models::{
    ConversationScope, ConversationSummary, Message, NewMessage, TypingIndicator, summarize_inbox,
};
use crate::api::{ChangeFeed, FeedSignal, MessageBackend, NoticeLevel, Notifier, Session, StaticSession, Subscription};
use crate::chat::window::Collaborators;
use crate::error::ChatError;

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

pub fn message(id: &str, from: &str, to: &str, secs: i64, content: &str) -> Message {
    Message {
        id: id.into(),
        ad_id: "ad-1".into(),
        sender_id: from.into(),
        recipient_id: to.into(),
        content: content.into(),
        message_type: crate::api::models::MessageType::Text,
        created_at: at(secs),
        edited_at: None,
        is_read: false,
        reply_to_message_id: None,
    }
}

pub fn insert_change(m: &Message) -> RowChange {
    RowChange {
        table: MESSAGES_TABLE.into(),
        kind: ChangeKind::Insert,
        record: serde_json::to_value(m).unwrap(),
        old_record: serde_json::Value::Null,
    }
}

pub fn update_change(m: &Message) -> RowChange {
    RowChange {
        table: MESSAGES_TABLE.into(),
        kind: ChangeKind::Update,
        record: serde_json::to_value(m).unwrap(),
        old_record: serde_json::json!({ "id": m.id }),
    }
}

pub fn delete_change(id: &str) -> RowChange {
    RowChange {
        table: MESSAGES_TABLE.into(),
        kind: ChangeKind::Delete,
        record: serde_json::Value::Null,
        old_record: serde_json::json!({ "id": id }),
    }
}

#[derive(Default)]
pub struct BackendState {
    pub rows: Vec<Message>,
    pub typing: Vec<TypingIndicator>,
    pub typing_writes: Vec<TypingIndicator>,
    pub typing_clears: usize,
    pub inserts: usize,
    pub mark_read_calls: usize,
    pub history_fetches: usize,
}

/// Behaves like the hosted tables: row-level ownership filters, server ids.
#[derive(Default)]
pub struct FakeBackend {
    pub state: Mutex<BackendState>,
    pub offline: AtomicBool,
    history_delay_ms: AtomicU64,
    next_id: AtomicUsize,
}

impl FakeBackend {
    pub fn with_rows(rows: Vec<Message>) -> Arc<Self> {
        let backend = Self::default();
        backend.state.lock().unwrap().rows = rows;
        Arc::new(backend)
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Makes every history fetch take `delay` before answering.
    pub fn set_history_delay(&self, delay: Duration) {
        self.history_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), ChatError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(ChatError::NetworkFailure("offline".into()));
        }
        Ok(())
    }

    pub fn row(&self, id: &str) -> Option<Message> {
        self.state.lock().unwrap().rows.iter().find(|m| m.id == id).cloned()
    }
}

#[async_trait]
impl MessageBackend for FakeBackend {
    async fn fetch_history(&self, scope: &ConversationScope) -> Result<Vec<Message>, ChatError> {
        let delay = self.history_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.check()?;
        let mut state = self.state.lock().unwrap();
        state.history_fetches += 1;
        let mut rows: Vec<Message> = state.rows.iter().filter(|m| scope.contains(m)).cloned().collect();
        rows.sort_by(Message::display_cmp);
        Ok(rows)
    }

    async fn insert_message(&self, message: &NewMessage) -> Result<Message, ChatError> {
        self.check()?;
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let row = Message {
            id: format!("srv-{n}"),
            ad_id: message.ad_id.clone(),
            sender_id: message.sender_id.clone(),
            recipient_id: message.recipient_id.clone(),
            content: message.content.clone(),
            message_type: message.message_type,
            created_at: at(1_000 + i64::try_from(n).unwrap()),
            edited_at: None,
            is_read: false,
            reply_to_message_id: message.reply_to_message_id.clone(),
        };
        let mut state = self.state.lock().unwrap();
        state.inserts += 1;
        state.rows.push(row.clone());
        Ok(row)
    }

    async fn update_content(
        &self,
        id: &str,
        sender_id: &str,
        content: &str,
        edited_at: DateTime<Utc>,
    ) -> Result<Option<Message>, ChatError> {
        self.check()?;
        let mut state = self.state.lock().unwrap();
        let Some(row) = state.rows.iter_mut().find(|m| m.id == id && m.sender_id == sender_id) else {
            return Ok(None);
        };
        row.content = content.to_string();
        row.edited_at = Some(edited_at);
        Ok(Some(row.clone()))
    }

    async fn delete_message(&self, id: &str, sender_id: &str) -> Result<bool, ChatError> {
        self.check()?;
        let mut state = self.state.lock().unwrap();
        let before = state.rows.len();
        state.rows.retain(|m| !(m.id == id && m.sender_id == sender_id));
        Ok(state.rows.len() != before)
    }

    async fn mark_read(&self, id: &str, recipient_id: &str) -> Result<Option<Message>, ChatError> {
        self.check()?;
        let mut state = self.state.lock().unwrap();
        state.mark_read_calls += 1;
        let Some(row) = state.rows.iter_mut().find(|m| m.id == id && m.recipient_id == recipient_id) else {
            return Ok(None);
        };
        row.is_read = true;
        Ok(Some(row.clone()))
    }

    async fn upsert_typing(&self, indicator: &TypingIndicator) -> Result<(), ChatError> {
        self.check()?;
        self.state.lock().unwrap().typing_writes.push(indicator.clone());
        Ok(())
    }

    async fn clear_typing(&self, _scope: &ConversationScope) -> Result<(), ChatError> {
        self.check()?;
        self.state.lock().unwrap().typing_clears += 1;
        Ok(())
    }

    async fn fetch_typing(
        &self,
        scope: &ConversationScope,
        now: DateTime<Utc>,
    ) -> Result<Vec<TypingIndicator>, ChatError> {
        self.check()?;
        let state = self.state.lock().unwrap();
        Ok(state
            .typing
            .iter()
            .filter(|t| scope.accepts_typing(t) && t.expires_at > now)
            .cloned()
            .collect())
    }

    async fn unread_count(&self, user_id: &str) -> Result<u64, ChatError> {
        self.check()?;
        let state = self.state.lock().unwrap();
        Ok(state.rows.iter().filter(|m| m.recipient_id == user_id && !m.is_read).count() as u64)
    }

    async fn inbox(&self, user_id: &str) -> Result<Vec<ConversationSummary>, ChatError> {
        self.check()?;
        let state = self.state.lock().unwrap();
        Ok(summarize_inbox(user_id, &state.rows))
    }
}

/// Hands out channel-backed subscriptions the test can push into.
#[derive(Default)]
pub struct FakeFeed {
    senders: Mutex<Vec<mpsc::Sender<FeedSignal>>>,
    pub refuse: AtomicBool,
}

impl FakeFeed {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn subscriptions(&self) -> usize {
        self.senders.lock().unwrap().len()
    }

    /// Broadcasts to every live subscription; returns how many took it.
    pub fn push(&self, signal: FeedSignal) -> usize {
        let senders = self.senders.lock().unwrap();
        senders
            .iter()
            .filter(|tx| tx.try_send(signal.clone()).is_ok())
            .count()
    }

    pub fn is_current_closed(&self) -> bool {
        self.senders.lock().unwrap().last().is_none_or(mpsc::Sender::is_closed)
    }
}

#[async_trait]
impl ChangeFeed for FakeFeed {
    async fn subscribe(&self, _scope: &ConversationScope) -> Result<Subscription, ChatError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(ChatError::SubscriptionDropped("refused".into()));
        }
        let (tx, rx) = mpsc::channel(64);
        let _ = tx.try_send(FeedSignal::Subscribed);
        self.senders.lock().unwrap().push(tx);
        Ok(Subscription::new(rx))
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub notices: Mutex<Vec<(NoticeLevel, String)>>,
}

impl RecordingNotifier {
    pub fn errors(&self) -> usize {
        self.notices
            .lock()
            .unwrap()
            .iter()
            .filter(|(level, _)| *level == NoticeLevel::Error)
            .count()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, level: NoticeLevel, message: &str) {
        self.notices.lock().unwrap().push((level, message.to_string()));
    }
}

pub struct Fixture {
    pub backend: Arc<FakeBackend>,
    pub feed: Arc<FakeFeed>,
    pub notifier: Arc<RecordingNotifier>,
}

impl Fixture {
    pub fn new(rows: Vec<Message>) -> Self {
        Self {
            backend: FakeBackend::with_rows(rows),
            feed: FakeFeed::new(),
            notifier: Arc::new(RecordingNotifier::default()),
        }
    }

    pub fn collaborators(&self, user: Option<&str>) -> Collaborators {
        let session: Arc<dyn Session> = Arc::new(StaticSession {
            user_id: user.map(str::to_string),
            sign_in_url: "https://example.test/login".into(),
        });
        Collaborators {
            backend: self.backend.clone(),
            feed: self.feed.clone(),
            session,
            notifier: self.notifier.clone(),
        }
    }
}
