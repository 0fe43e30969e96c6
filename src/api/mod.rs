//! Collaborators the chat core talks to: the hosted backend's query/mutation
//! interface, its change feed, the signed-in session and the toast surface.
//!
//! Everything is injected as a trait object so the store and the adapter can
//! be driven by fakes in tests.

pub mod client;
pub mod events;
pub mod models;
pub mod realtime;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::error::ChatError;
use events::RowChange;
use models::{ConversationScope, ConversationSummary, Message, NewMessage, TypingIndicator};

#[async_trait]
pub trait MessageBackend: Send + Sync {
    async fn fetch_history(&self, scope: &ConversationScope) -> Result<Vec<Message>, ChatError>;

    async fn insert_message(&self, message: &NewMessage) -> Result<Message, ChatError>;

    /// Returns `None` when no row owned by `sender_id` matched.
    async fn update_content(
        &self,
        id: &str,
        sender_id: &str,
        content: &str,
        edited_at: DateTime<Utc>,
    ) -> Result<Option<Message>, ChatError>;

    /// Returns `false` when no row owned by `sender_id` matched.
    async fn delete_message(&self, id: &str, sender_id: &str) -> Result<bool, ChatError>;

    /// Returns `None` when no row addressed to `recipient_id` matched.
    async fn mark_read(&self, id: &str, recipient_id: &str) -> Result<Option<Message>, ChatError>;

    async fn upsert_typing(&self, indicator: &TypingIndicator) -> Result<(), ChatError>;

    async fn clear_typing(&self, scope: &ConversationScope) -> Result<(), ChatError>;

    /// Counterpart indicators addressed to us that have not expired at `now`.
    async fn fetch_typing(
        &self,
        scope: &ConversationScope,
        now: DateTime<Utc>,
    ) -> Result<Vec<TypingIndicator>, ChatError>;

    async fn unread_count(&self, user_id: &str) -> Result<u64, ChatError>;

    async fn inbox(&self, user_id: &str) -> Result<Vec<ConversationSummary>, ChatError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedSignal {
    Subscribed,
    Change(RowChange),
    Dropped(String),
}

/// A live change feed. Dropping it unsubscribes.
pub struct Subscription {
    events: mpsc::Receiver<FeedSignal>,
}

impl Subscription {
    pub fn new(events: mpsc::Receiver<FeedSignal>) -> Self {
        Self { events }
    }

    /// `None` once the producer is gone, which callers treat like a drop.
    pub async fn recv(&mut self) -> Option<FeedSignal> {
        self.events.recv().await
    }
}

#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe(&self, scope: &ConversationScope) -> Result<Subscription, ChatError>;
}

pub trait Session: Send + Sync {
    fn user_id(&self) -> Option<String>;
    fn sign_in_url(&self) -> String;
}

/// Session built from stored credentials.
#[derive(Debug, Clone)]
pub struct StaticSession {
    pub user_id: Option<String>,
    pub sign_in_url: String,
}

impl Session for StaticSession {
    fn user_id(&self) -> Option<String> {
        self.user_id.clone().filter(|id| !id.is_empty())
    }

    fn sign_in_url(&self) -> String {
        self.sign_in_url.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Success,
    Error,
}

pub trait Notifier: Send + Sync {
    fn notify(&self, level: NoticeLevel, message: &str);
}

/// Toasts routed to the log, for headless front-ends.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, level: NoticeLevel, message: &str) {
        match level {
            NoticeLevel::Success => log::info!("{message}"),
            NoticeLevel::Error => log::error!("{message}"),
        }
    }
}
