use std::collections::HashSet;

use crate::api::models::Message;
use crate::error::ChatError;

/// Messages of one conversation, always in display order.
///
/// Owned by a single chat window and discarded with it. The store never talks
/// to the network; it only applies rows the backend has confirmed, whether
/// they come back from a request or through the change feed.
#[derive(Debug, Clone, Default)]
pub struct MessageStore {
    messages: Vec<Message>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(messages: Vec<Message>) -> Self {
        let mut store = Self::new();
        store.replace_all(messages);
        store
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.messages.iter().position(|m| m.id == id)
    }

    /// Adds a confirmed row. Returns `false` if the id is already present.
    pub fn insert(&mut self, message: Message) -> bool {
        if self.contains(&message.id) {
            return false;
        }
        let at = self
            .messages
            .partition_point(|m| m.display_cmp(&message).is_lt());
        self.messages.insert(at, message);
        true
    }

    /// Applies an updated row in place. Unknown ids are ignored.
    ///
    /// Only the mutable fields are taken: `content`, `edited_at` and a
    /// false-to-true `is_read`. Identity, participants and `created_at` stay as
    /// first seen, so an update can never move a message.
    pub fn apply_update(&mut self, row: Message) -> bool {
        let Some(at) = self.position(&row.id) else {
            return false;
        };
        let current = &mut self.messages[at];
        let is_read = current.is_read || row.is_read;
        let changed = current.content != row.content
            || current.edited_at != row.edited_at
            || current.is_read != is_read;
        current.content = row.content;
        current.edited_at = row.edited_at;
        current.is_read = is_read;
        changed
    }

    pub fn remove(&mut self, id: &str) -> Option<Message> {
        let at = self.position(id)?;
        Some(self.messages.remove(at))
    }

    /// Replaces the contents with a fresh history, sorted and de-duplicated.
    pub fn replace_all(&mut self, mut messages: Vec<Message>) {
        messages.sort_by(Message::display_cmp);
        let mut seen = HashSet::new();
        messages.retain(|m| seen.insert(m.id.clone()));
        self.messages = messages;
    }

    /// The message, if `actor` sent it and may therefore edit or delete it.
    pub fn owned_by(&self, id: &str, actor: &str) -> Result<&Message, ChatError> {
        let message = self.get(id).ok_or_else(|| ChatError::NotFound(id.to_string()))?;
        if message.sender_id != actor {
            return Err(ChatError::PermissionDenied(format!("{actor} did not send {id}")));
        }
        Ok(message)
    }

    /// Whether `reader` may flip `is_read` on the message right now.
    pub fn can_mark_read(&self, id: &str, reader: &str) -> bool {
        self.get(id)
            .is_some_and(|m| !m.is_read && m.sender_id != reader && m.recipient_id == reader)
    }

    /// Local read flip. No-op when already read or when `reader` is not the recipient.
    pub fn mark_read(&mut self, id: &str, reader: &str) -> bool {
        if !self.can_mark_read(id, reader) {
            return false;
        }
        match self.position(id) {
            Some(at) => {
                self.messages[at].is_read = true;
                true
            }
            None => false,
        }
    }

    /// Ids of messages addressed to `reader` that are still unread, oldest first.
    pub fn unread_for(&self, reader: &str) -> Vec<String> {
        self.messages
            .iter()
            .filter(|m| !m.is_read && m.recipient_id == reader && m.sender_id != reader)
            .map(|m| m.id.clone())
            .collect()
    }

    pub fn unread_count_for(&self, reader: &str) -> usize {
        self.messages
            .iter()
            .filter(|m| !m.is_read && m.recipient_id == reader && m.sender_id != reader)
            .count()
    }
}

#[cfg(test)]
#[path = "store_test.rs"]
mod store_test;
