//! The conversation view for one ad and one counterpart.
//!
//! A `ChatWindow` owns its store, typing state and feed subscription. It is
//! driven from a single task: actions take `&mut self`, and `next_update`
//! pulls feed traffic in between them.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use crate::api::models::{ConversationScope, Message, MessageType, NewMessage};
use crate::api::{ChangeFeed, FeedSignal, MessageBackend, NoticeLevel, Notifier, Session, Subscription};
use crate::app::AppState;
use crate::chat::read_state::{ReadStateReconciler, UnreadBadge, mark_one};
use crate::chat::store::MessageStore;
use crate::chat::subscription::{Applied, SubscriptionAdapter};
use crate::chat::typing::{TypingBoard, TypingEmitter, typing_label};
use crate::error::ChatError;
use crate::storage::SnapshotCache;
use crate::utils::{Backoff, with_timeout};

#[derive(Clone)]
pub struct Collaborators {
    pub backend: Arc<dyn MessageBackend>,
    pub feed: Arc<dyn ChangeFeed>,
    pub session: Arc<dyn Session>,
    pub notifier: Arc<dyn Notifier>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatOptions {
    pub request_timeout: Duration,
    pub typing_debounce: Duration,
    pub typing_ttl: Duration,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
}

impl ChatOptions {
    pub fn from_state(state: &AppState) -> Self {
        Self {
            request_timeout: state.request_timeout(),
            typing_debounce: state.typing_debounce(),
            typing_ttl: state.typing_ttl(),
            reconnect_initial: Duration::from_millis(state.reconnect_initial_ms),
            reconnect_max: Duration::from_millis(state.reconnect_max_ms),
        }
    }
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self::from_state(&AppState::default())
    }
}

/// The other participant, as the view shows them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Counterpart {
    pub id: String,
    pub name: String,
}

impl Counterpart {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// What the front-end should repaint after `next_update`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewUpdate {
    Inserted { id: String, scroll_to_bottom: bool },
    Updated { id: String },
    Removed { id: String },
    TypingChanged,
    Resynced,
    Offline,
}

enum Wake {
    Feed(Option<FeedSignal>),
    TypingExpired,
}

pub struct ChatWindow {
    scope: ConversationScope,
    counterpart_name: String,
    store: MessageStore,
    typing_out: TypingEmitter,
    typing_in: TypingBoard,
    adapter: SubscriptionAdapter,
    read_state: ReadStateReconciler,
    subscription: Option<Subscription>,
    backoff: Backoff,
    cache: Option<SnapshotCache>,
    composer: String,
    reply_to: Option<String>,
    editing: Option<String>,
    pending_delete: Option<String>,
    sending: bool,
    offline_notified: bool,
    collab: Collaborators,
    options: ChatOptions,
}

impl ChatWindow {
    /// Opens the view for `ad_id` with `counterpart`.
    ///
    /// Anonymous sessions get `SignInRequired`. A failed subscribe or history
    /// fetch does not fail the open: the cached snapshot stays on screen and
    /// `next_update` keeps trying to resync.
    pub async fn open(
        collab: Collaborators,
        options: ChatOptions,
        ad_id: &str,
        counterpart: Counterpart,
        cache: Option<SnapshotCache>,
    ) -> Result<Self, ChatError> {
        let Some(self_id) = collab.session.user_id() else {
            let redirect = collab.session.sign_in_url();
            log::info!("chat opened without a session, redirecting to {redirect}");
            return Err(ChatError::SignInRequired { redirect });
        };
        let scope = ConversationScope::new(ad_id, self_id.clone(), counterpart.id);

        let snapshot = match cache.as_ref().map(|c| c.load_history(&scope)) {
            Some(Ok(rows)) => {
                if let Some(Ok(Some(at))) = cache.as_ref().map(|c| c.last_fetched_at(&scope)) {
                    log::debug!("painting {} cached messages from {at}", rows.len());
                }
                rows
            }
            Some(Err(e)) => {
                log::warn!("ignoring unreadable snapshot for {}: {e}", scope.cache_key());
                Vec::new()
            }
            None => Vec::new(),
        };

        let mut window = Self {
            counterpart_name: counterpart.name,
            store: MessageStore::from_snapshot(snapshot),
            typing_out: TypingEmitter::new(options.typing_debounce, options.typing_ttl),
            typing_in: TypingBoard::new(),
            adapter: SubscriptionAdapter::new(scope.clone()),
            read_state: ReadStateReconciler::new(self_id),
            subscription: None,
            backoff: Backoff::new(options.reconnect_initial, options.reconnect_max),
            cache,
            composer: String::new(),
            reply_to: None,
            editing: None,
            pending_delete: None,
            sending: false,
            offline_notified: false,
            scope,
            collab,
            options,
        };

        // Subscribe before fetching so nothing lands in between.
        match with_timeout(window.options.request_timeout, window.collab.feed.subscribe(&window.scope)).await {
            Ok(sub) => window.subscription = Some(sub),
            Err(e) => log::warn!("subscribe failed for {}: {e}", window.scope.cache_key()),
        }
        if let Err(e) = window.refresh_history().await {
            window.report(&e);
        }
        window.refresh_typing().await;
        log::info!(
            "opened chat {} with {} messages",
            window.scope.cache_key(),
            window.store.len()
        );
        Ok(window)
    }

    pub fn scope(&self) -> &ConversationScope {
        &self.scope
    }

    pub fn counterpart_name(&self) -> &str {
        &self.counterpart_name
    }

    pub fn messages(&self) -> &[Message] {
        self.store.messages()
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscription.is_some()
    }

    fn self_id(&self) -> &str {
        &self.scope.self_id
    }

    fn report(&self, e: &ChatError) {
        log::error!("{e}");
        self.collab.notifier.notify(NoticeLevel::Error, &e.user_message());
    }

    fn fail<T>(&self, e: ChatError) -> Result<T, ChatError> {
        self.report(&e);
        Err(e)
    }

    pub fn set_unread_badge(&mut self, badge: UnreadBadge) {
        self.read_state.set_badge(badge);
        self.read_state.publish(&self.store);
    }

    // ---- composer ----

    pub fn set_composer(&mut self, text: impl Into<String>) {
        self.composer = text.into();
    }

    pub fn composer(&self) -> &str {
        &self.composer
    }

    pub fn can_send(&self) -> bool {
        !self.sending && !self.composer.trim().is_empty()
    }

    pub fn is_sending(&self) -> bool {
        self.sending
    }

    pub async fn on_keystroke(&mut self, text: impl Into<String>) {
        self.on_keystroke_at(text, Utc::now()).await;
    }

    pub async fn on_keystroke_at(&mut self, text: impl Into<String>, now: chrono::DateTime<Utc>) {
        self.composer = text.into();
        if self.composer.trim().is_empty() {
            return;
        }
        let Some(indicator) = self.typing_out.on_keystroke(&self.scope, now) else {
            return;
        };
        let write = self.collab.backend.upsert_typing(&indicator);
        if let Err(e) = with_timeout(self.options.request_timeout, write).await {
            log::warn!("typing indicator write failed: {e}");
        }
    }

    async fn clear_own_typing(&mut self) {
        if !self.typing_out.on_send(Utc::now()) {
            return;
        }
        let clear = self.collab.backend.clear_typing(&self.scope);
        if let Err(e) = with_timeout(self.options.request_timeout, clear).await {
            log::warn!("typing indicator clear failed: {e}");
        }
    }

    // ---- send / reply ----

    pub async fn send(&mut self) -> Result<String, ChatError> {
        self.send_with_type(MessageType::Text).await
    }

    /// Sends the composer text. Returns the id the server assigned.
    ///
    /// The composer and reply target are cleared up front and restored if the
    /// insert fails. The message itself only appears once the server has it.
    pub async fn send_with_type(&mut self, message_type: MessageType) -> Result<String, ChatError> {
        if self.sending {
            return self.fail(ChatError::ValidationFailure("a message is already being sent"));
        }
        let content = self.composer.trim().to_string();
        if content.is_empty() {
            return self.fail(ChatError::ValidationFailure("message is empty"));
        }

        let draft = std::mem::take(&mut self.composer);
        let reply = self.reply_to.take();
        self.sending = true;
        self.clear_own_typing().await;

        let new = NewMessage {
            ad_id: self.scope.ad_id.clone(),
            sender_id: self.scope.self_id.clone(),
            recipient_id: self.scope.counterpart_id.clone(),
            content,
            message_type,
            reply_to_message_id: reply.clone(),
        };
        let result = with_timeout(self.options.request_timeout, self.collab.backend.insert_message(&new)).await;
        self.sending = false;

        match result {
            Ok(row) => {
                let id = row.id.clone();
                log::debug!("sent {id}");
                self.store.insert(row);
                Ok(id)
            }
            Err(e) => {
                self.composer = draft;
                self.reply_to = reply;
                self.fail(e)
            }
        }
    }

    pub fn reply_to(&mut self, id: &str) -> Result<(), ChatError> {
        if !self.store.contains(id) {
            return self.fail(ChatError::NotFound(id.to_string()));
        }
        self.reply_to = Some(id.to_string());
        Ok(())
    }

    pub fn cancel_reply(&mut self) {
        self.reply_to = None;
    }

    pub fn reply_target(&self) -> Option<&Message> {
        self.reply_to.as_deref().and_then(|id| self.store.get(id))
    }

    // ---- edit ----

    /// Starts editing one of our own messages; returns its current text.
    pub fn begin_edit(&mut self, id: &str) -> Result<String, ChatError> {
        let content = match self.store.owned_by(id, self.self_id()) {
            Ok(m) => m.content.clone(),
            Err(e) => return self.fail(e),
        };
        self.editing = Some(id.to_string());
        Ok(content)
    }

    pub fn editing(&self) -> Option<&str> {
        self.editing.as_deref()
    }

    pub fn cancel_edit(&mut self) {
        self.editing = None;
    }

    pub async fn commit_edit(&mut self, new_text: &str) -> Result<(), ChatError> {
        let Some(id) = self.editing.clone() else {
            return self.fail(ChatError::ValidationFailure("no message is being edited"));
        };
        self.edit(&id, new_text).await?;
        self.editing = None;
        Ok(())
    }

    pub async fn edit(&mut self, id: &str, new_text: &str) -> Result<(), ChatError> {
        let content = new_text.trim();
        if content.is_empty() {
            return self.fail(ChatError::ValidationFailure("message is empty"));
        }
        match self.store.owned_by(id, self.self_id()) {
            Ok(m) if m.content == content => return Ok(()),
            Ok(_) => {}
            Err(e) => return self.fail(e),
        }

        let update = self
            .collab
            .backend
            .update_content(id, &self.scope.self_id, content, Utc::now());
        match with_timeout(self.options.request_timeout, update).await {
            Ok(Some(row)) => {
                self.store.apply_update(row);
                Ok(())
            }
            Ok(None) => self.fail(ChatError::PermissionDenied(format!("edit of {id} was refused"))),
            Err(e) => self.fail(e),
        }
    }

    // ---- delete ----

    /// Records `id` for deletion once the user confirms.
    pub fn request_delete(&mut self, id: &str) -> Result<(), ChatError> {
        if let Err(e) = self.store.owned_by(id, self.self_id()) {
            return self.fail(e);
        }
        self.pending_delete = Some(id.to_string());
        Ok(())
    }

    pub fn pending_delete(&self) -> Option<&str> {
        self.pending_delete.as_deref()
    }

    pub fn cancel_delete(&mut self) {
        self.pending_delete = None;
    }

    pub async fn confirm_delete(&mut self) -> Result<(), ChatError> {
        let Some(id) = self.pending_delete.take() else {
            return self.fail(ChatError::ValidationFailure("no message is awaiting deletion"));
        };
        self.delete(&id).await
    }

    pub async fn delete(&mut self, id: &str) -> Result<(), ChatError> {
        if let Err(e) = self.store.owned_by(id, self.self_id()) {
            return self.fail(e);
        }
        let request = self.collab.backend.delete_message(id, &self.scope.self_id);
        match with_timeout(self.options.request_timeout, request).await {
            Ok(existed) => {
                if !existed {
                    log::debug!("{id} was already gone on the server");
                }
                self.forget(id);
                Ok(())
            }
            Err(e) => self.fail(e),
        }
    }

    fn forget(&mut self, id: &str) {
        self.store.remove(id);
        for slot in [&mut self.reply_to, &mut self.editing, &mut self.pending_delete] {
            if slot.as_deref() == Some(id) {
                *slot = None;
            }
        }
        self.read_state.publish(&self.store);
    }

    // ---- read state ----

    pub async fn mark_read(&mut self, id: &str) -> Result<bool, ChatError> {
        let result = mark_one(
            &mut self.store,
            self.collab.backend.as_ref(),
            &self.scope.self_id,
            id,
            self.options.request_timeout,
        )
        .await;
        self.read_state.publish(&self.store);
        result.or_else(|e| self.fail(e))
    }

    /// Click-to-read: marks every unread incoming message. Returns how many flipped.
    pub async fn on_message_clicked(&mut self, id: &str) -> Result<usize, ChatError> {
        if !self.store.contains(id) {
            return self.fail(ChatError::NotFound(id.to_string()));
        }
        let result = self
            .read_state
            .reconcile(&mut self.store, self.collab.backend.as_ref(), self.options.request_timeout)
            .await;
        result.or_else(|e| self.fail(e))
    }

    pub fn typing_label(&self, now: chrono::DateTime<Utc>) -> Option<String> {
        self.typing_in
            .first_active(now)
            .map(|_| typing_label(&self.counterpart_name))
    }

    // ---- feed ----

    /// Waits for the next change that affects the view and applies it.
    ///
    /// While the feed is down each call waits out the reconnect backoff and
    /// tries one resync.
    pub async fn next_update(&mut self) -> ViewUpdate {
        loop {
            let expiry = self.typing_expiry();
            let wake = match self.subscription.as_mut() {
                Some(sub) => tokio::select! {
                    signal = sub.recv() => Wake::Feed(signal),
                    _ = tokio::time::sleep(expiry.unwrap_or_default()), if expiry.is_some() => Wake::TypingExpired,
                },
                None => return self.reconnect().await,
            };

            match wake {
                Wake::TypingExpired => {
                    self.typing_in.prune(Utc::now());
                    return ViewUpdate::TypingChanged;
                }
                Wake::Feed(Some(FeedSignal::Subscribed)) => {
                    log::debug!("feed live for {}", self.scope.cache_key());
                }
                Wake::Feed(Some(FeedSignal::Change(change))) => {
                    if let Some(update) = self.apply_change(&change) {
                        return update;
                    }
                }
                Wake::Feed(Some(FeedSignal::Dropped(reason))) => {
                    log::warn!("feed dropped for {}: {reason}", self.scope.cache_key());
                    self.subscription = None;
                }
                Wake::Feed(None) => {
                    log::warn!("feed closed for {}", self.scope.cache_key());
                    self.subscription = None;
                }
            }
        }
    }

    fn typing_expiry(&self) -> Option<Duration> {
        let now = Utc::now();
        let first = self.typing_in.first_active(now)?;
        let left = (first.expires_at - now).to_std().unwrap_or_default();
        Some(left + Duration::from_millis(1))
    }

    fn apply_change(&mut self, change: &crate::api::events::RowChange) -> Option<ViewUpdate> {
        let update = match self.adapter.apply(change, &mut self.store, &mut self.typing_in) {
            Applied::Inserted(id) => {
                let scroll_to_bottom = self.store.last().is_some_and(|m| m.id == id);
                ViewUpdate::Inserted { id, scroll_to_bottom }
            }
            Applied::Updated(id) => ViewUpdate::Updated { id },
            Applied::Removed(id) => {
                self.forget(&id);
                ViewUpdate::Removed { id }
            }
            Applied::Typing => return Some(ViewUpdate::TypingChanged),
            Applied::Ignored => return None,
        };
        self.read_state.publish(&self.store);
        Some(update)
    }

    async fn reconnect(&mut self) -> ViewUpdate {
        let delay = self.backoff.next_delay();
        log::warn!("resyncing {} in {delay:?}", self.scope.cache_key());
        tokio::time::sleep(delay).await;
        match self.resync().await {
            Ok(()) => ViewUpdate::Resynced,
            Err(e) => {
                log::warn!("resync failed: {e}");
                if !self.offline_notified {
                    self.offline_notified = true;
                    self.collab.notifier.notify(
                        NoticeLevel::Error,
                        &ChatError::SubscriptionDropped(e.to_string()).user_message(),
                    );
                }
                ViewUpdate::Offline
            }
        }
    }

    /// Re-subscribe, then replace the store with a fresh history.
    ///
    /// The subscription is installed only after the last await, so a dropped
    /// future leaves the feed down and the next call fetches again.
    async fn resync(&mut self) -> Result<(), ChatError> {
        let sub = with_timeout(self.options.request_timeout, self.collab.feed.subscribe(&self.scope)).await?;
        self.refresh_history().await?;
        self.typing_in.clear();
        self.refresh_typing().await;
        self.subscription = Some(sub);
        self.backoff.reset();
        if self.offline_notified {
            self.offline_notified = false;
            self.collab.notifier.notify(NoticeLevel::Success, "Reconnected");
        }
        log::info!("resynced {}", self.scope.cache_key());
        Ok(())
    }

    /// Resyncs right away if the feed is down. `None` when it is live.
    pub async fn on_visible(&mut self) -> Option<ViewUpdate> {
        if self.subscription.is_some() {
            return None;
        }
        self.backoff.reset();
        Some(self.reconnect_now().await)
    }

    async fn reconnect_now(&mut self) -> ViewUpdate {
        match self.resync().await {
            Ok(()) => ViewUpdate::Resynced,
            Err(e) => {
                self.report(&e);
                ViewUpdate::Offline
            }
        }
    }

    async fn refresh_history(&mut self) -> Result<(), ChatError> {
        let rows = with_timeout(self.options.request_timeout, self.collab.backend.fetch_history(&self.scope)).await?;
        self.store.replace_all(rows);
        self.save_snapshot();
        self.read_state.publish(&self.store);
        Ok(())
    }

    async fn refresh_typing(&mut self) {
        let now = Utc::now();
        let fetch = self.collab.backend.fetch_typing(&self.scope, now);
        match with_timeout(self.options.request_timeout, fetch).await {
            Ok(rows) => {
                for row in rows.into_iter().filter(|t| self.scope.accepts_typing(t)) {
                    self.typing_in.upsert(row);
                }
            }
            Err(e) => log::warn!("could not load typing indicators: {e}"),
        }
    }

    fn save_snapshot(&mut self) {
        if let Some(cache) = self.cache.as_mut() {
            if let Err(e) = cache.save_history(&self.scope, self.store.messages()) {
                log::warn!("could not save snapshot: {e}");
            }
        }
    }

    /// Unsubscribes and withdraws our typing indicator.
    pub async fn close(mut self) {
        self.subscription = None;
        self.clear_own_typing().await;
        self.save_snapshot();
        log::info!("closed chat {}", self.scope.cache_key());
    }
}

#[cfg(test)]
#[path = "window_test.rs"]
mod window_test;
