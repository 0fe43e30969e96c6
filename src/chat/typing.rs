//! Ephemeral "is typing" presence for one conversation.
//!
//! Writers refresh a single expiring record per (ad, writer, recipient).
//! Deletes are best effort, so readers never trust absence of a delete event:
//! every read checks `expires_at` against the wall clock.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;

use crate::api::models::{ConversationScope, TypingIndicator};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypingState {
    Idle,
    Typing,
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(1))
}

/// Our own side: decides when a keystroke turns into an indicator write.
#[derive(Debug, Clone)]
pub struct TypingEmitter {
    debounce: chrono::Duration,
    ttl: chrono::Duration,
    last_emit: Option<DateTime<Utc>>,
}

impl TypingEmitter {
    pub fn new(debounce: Duration, ttl: Duration) -> Self {
        Self {
            debounce: to_chrono(debounce),
            ttl: to_chrono(ttl),
            last_emit: None,
        }
    }

    pub fn state(&self, now: DateTime<Utc>) -> TypingState {
        match self.last_emit {
            Some(at) if now <= at + self.ttl => TypingState::Typing,
            _ => TypingState::Idle,
        }
    }

    /// The indicator to write for this keystroke, if any.
    ///
    /// The first keystroke emits right away; further keystrokes inside the
    /// debounce window are absorbed, later ones refresh the expiry.
    pub fn on_keystroke(&mut self, scope: &ConversationScope, now: DateTime<Utc>) -> Option<TypingIndicator> {
        if let Some(at) = self.last_emit {
            if now >= at && now - at < self.debounce {
                return None;
            }
        }
        self.last_emit = Some(now);
        Some(TypingIndicator {
            ad_id: scope.ad_id.clone(),
            user_id: scope.self_id.clone(),
            recipient_id: scope.counterpart_id.clone(),
            created_at: now,
            expires_at: now + self.ttl,
        })
    }

    /// Back to idle. Returns whether a live record may still exist remotely.
    pub fn on_send(&mut self, now: DateTime<Utc>) -> bool {
        let was_typing = self.state(now) == TypingState::Typing;
        self.last_emit = None;
        was_typing
    }
}

/// The other side: indicators we have been told about, keyed by typist.
#[derive(Debug, Clone, Default)]
pub struct TypingBoard {
    records: HashMap<String, TypingIndicator>,
}

impl TypingBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Newer writes supersede older ones from the same typist.
    pub fn upsert(&mut self, indicator: TypingIndicator) -> bool {
        match self.records.get(&indicator.user_id) {
            Some(existing) if existing.created_at > indicator.created_at => false,
            _ => {
                self.records.insert(indicator.user_id.clone(), indicator);
                true
            }
        }
    }

    pub fn remove(&mut self, user_id: &str) -> bool {
        self.records.remove(user_id).is_some()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn active(&self, now: DateTime<Utc>) -> Vec<&TypingIndicator> {
        let mut live: Vec<&TypingIndicator> = self.records.values().filter(|t| t.is_active(now)).collect();
        live.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.user_id.cmp(&b.user_id)));
        live
    }

    pub fn first_active(&self, now: DateTime<Utc>) -> Option<&TypingIndicator> {
        self.active(now).into_iter().next()
    }

    /// Drops expired records; returns how many went.
    pub fn prune(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.records.len();
        self.records.retain(|_, t| t.is_active(now));
        before - self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

pub fn typing_label(name: &str) -> String {
    format!("{name} is typing…")
}

#[cfg(test)]
#[path = "typing_test.rs"]
mod typing_test;
