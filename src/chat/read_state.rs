use std::time::Duration;

use crate::api::MessageBackend;
use crate::chat::store::MessageStore;
use crate::error::ChatError;
use crate::utils::with_timeout;

/// Receives the conversation's unread count whenever it changes.
pub type UnreadBadge = Box<dyn Fn(usize) + Send + Sync>;

/// Flips `is_read` for one message as `reader`.
///
/// Returns `Ok(false)` without a request when the message is already read,
/// was sent by `reader`, or is unknown.
pub async fn mark_one(
    store: &mut MessageStore,
    backend: &dyn MessageBackend,
    reader: &str,
    id: &str,
    timeout: Duration,
) -> Result<bool, ChatError> {
    if !store.can_mark_read(id, reader) {
        return Ok(false);
    }
    match with_timeout(timeout, backend.mark_read(id, reader)).await? {
        Some(row) => {
            store.apply_update(row);
            store.mark_read(id, reader);
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Click-to-read reconciliation for the viewer of one conversation.
pub struct ReadStateReconciler {
    reader_id: String,
    badge: Option<UnreadBadge>,
    published: Option<usize>,
}

impl ReadStateReconciler {
    pub fn new(reader_id: impl Into<String>) -> Self {
        Self {
            reader_id: reader_id.into(),
            badge: None,
            published: None,
        }
    }

    pub fn set_badge(&mut self, badge: UnreadBadge) {
        self.badge = Some(badge);
        self.published = None;
    }

    /// Pushes the unread count to the badge if it moved since the last push.
    pub fn publish(&mut self, store: &MessageStore) {
        let count = store.unread_count_for(&self.reader_id);
        if self.published == Some(count) {
            return;
        }
        if let Some(badge) = &self.badge {
            badge(count);
            self.published = Some(count);
        }
    }

    /// Marks every unread incoming message read, oldest first.
    ///
    /// Stops at the first failure; messages marked before it stay marked.
    pub async fn reconcile(
        &mut self,
        store: &mut MessageStore,
        backend: &dyn MessageBackend,
        timeout: Duration,
    ) -> Result<usize, ChatError> {
        let mut marked = 0;
        let mut outcome = Ok(());
        for id in store.unread_for(&self.reader_id) {
            match mark_one(store, backend, &self.reader_id, &id, timeout).await {
                Ok(true) => marked += 1,
                Ok(false) => {}
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }
        self.publish(store);
        outcome.map(|()| marked)
    }
}

#[cfg(test)]
#[path = "read_state_test.rs"]
mod read_state_test;
