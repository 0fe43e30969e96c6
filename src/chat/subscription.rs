use serde_json::Value;

use crate::api::events::{ChangeKind, MESSAGES_TABLE, RowChange, TYPING_TABLE};
use crate::api::models::{ConversationScope, Message, TypingIndicator};
use crate::chat::store::MessageStore;
use crate::chat::typing::TypingBoard;

/// What a single feed change did to the view's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    Inserted(String),
    Updated(String),
    Removed(String),
    Typing,
    Ignored,
}

/// Turns raw row changes into store and typing-board mutations for one scope.
///
/// The backend filters the feed by ad only; the participant pair is checked
/// here so rows from other buyers of the same ad never reach the store.
#[derive(Debug, Clone)]
pub struct SubscriptionAdapter {
    scope: ConversationScope,
}

impl SubscriptionAdapter {
    pub fn new(scope: ConversationScope) -> Self {
        Self { scope }
    }

    pub fn scope(&self) -> &ConversationScope {
        &self.scope
    }

    pub fn apply(&self, change: &RowChange, store: &mut MessageStore, typing: &mut TypingBoard) -> Applied {
        match change.table.as_str() {
            MESSAGES_TABLE => self.apply_message(change, store),
            TYPING_TABLE => self.apply_typing(change, typing),
            other => {
                log::debug!("ignoring change on {other}");
                Applied::Ignored
            }
        }
    }

    fn apply_message(&self, change: &RowChange, store: &mut MessageStore) -> Applied {
        if change.kind == ChangeKind::Delete {
            // Deletes only carry the key, so the store is the scope check.
            return match change.row_id() {
                Some(id) if store.remove(id).is_some() => Applied::Removed(id.to_string()),
                _ => Applied::Ignored,
            };
        }
        let Some(row) = decode::<Message>(&change.record) else {
            return Applied::Ignored;
        };
        if !self.scope.contains(&row) {
            return Applied::Ignored;
        }
        let id = row.id.clone();
        let applied = match change.kind {
            ChangeKind::Insert => store.insert(row),
            ChangeKind::Update => store.apply_update(row),
            ChangeKind::Delete => false,
        };
        match (applied, change.kind) {
            (true, ChangeKind::Insert) => Applied::Inserted(id),
            (true, ChangeKind::Update) => Applied::Updated(id),
            _ => Applied::Ignored,
        }
    }

    fn apply_typing(&self, change: &RowChange, typing: &mut TypingBoard) -> Applied {
        if change.kind == ChangeKind::Delete {
            let user = change.old_record.get("user_id").and_then(Value::as_str);
            return match user {
                Some(user) if user == self.scope.counterpart_id && typing.remove(user) => Applied::Typing,
                _ => Applied::Ignored,
            };
        }
        let Some(indicator) = decode::<TypingIndicator>(&change.record) else {
            return Applied::Ignored;
        };
        if self.scope.accepts_typing(&indicator) && typing.upsert(indicator) {
            Applied::Typing
        } else {
            Applied::Ignored
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(record: &Value) -> Option<T> {
    match serde_json::from_value(record.clone()) {
        Ok(row) => Some(row),
        Err(e) => {
            log::warn!("skipping undecodable row: {e}");
            None
        }
    }
}

#[cfg(test)]
#[path = "subscription_test.rs"]
mod subscription_test;
