use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    Text,
    Image,
    Offer,
    System,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Message {
    pub id: String,
    pub ad_id: String,
    pub sender_id: String,
    pub recipient_id: String,
    pub content: String,
    #[serde(default)]
    pub message_type: MessageType,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default)]
    pub reply_to_message_id: Option<String>,
}

impl Message {
    /// Display order: oldest first, id breaks ties.
    pub fn display_cmp(&self, other: &Message) -> Ordering {
        self.created_at
            .cmp(&other.created_at)
            .then_with(|| self.id.cmp(&other.id))
    }

    pub fn is_edited(&self) -> bool {
        self.edited_at.is_some()
    }
}

/// Insert payload; the server fills in id, created_at and is_read.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct NewMessage {
    pub ad_id: String,
    pub sender_id: String,
    pub recipient_id: String,
    pub content: String,
    pub message_type: MessageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to_message_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TypingIndicator {
    pub ad_id: String,
    pub user_id: String,
    pub recipient_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl TypingIndicator {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        now <= self.expires_at
    }
}

/// The (ad, participant pair) a chat view is about. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConversationScope {
    pub ad_id: String,
    pub self_id: String,
    pub counterpart_id: String,
}

impl ConversationScope {
    pub fn new(ad_id: impl Into<String>, self_id: impl Into<String>, counterpart_id: impl Into<String>) -> Self {
        Self {
            ad_id: ad_id.into(),
            self_id: self_id.into(),
            counterpart_id: counterpart_id.into(),
        }
    }

    pub fn contains(&self, m: &Message) -> bool {
        m.ad_id == self.ad_id
            && ((m.sender_id == self.self_id && m.recipient_id == self.counterpart_id)
                || (m.sender_id == self.counterpart_id && m.recipient_id == self.self_id))
    }

    /// Only the counterpart's indicator addressed to us belongs to this view.
    pub fn accepts_typing(&self, t: &TypingIndicator) -> bool {
        t.ad_id == self.ad_id && t.user_id == self.counterpart_id && t.recipient_id == self.self_id
    }

    /// Same key for both participants of the conversation.
    pub fn cache_key(&self) -> String {
        let (a, b) = if self.self_id <= self.counterpart_id {
            (&self.self_id, &self.counterpart_id)
        } else {
            (&self.counterpart_id, &self.self_id)
        };
        format!("{}:{}:{}", self.ad_id, a, b)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConversationSummary {
    pub scope: ConversationScope,
    pub last_message: Message,
    pub unread: usize,
}

/// Groups a user's recent messages (any order) into one summary per conversation,
/// most recently active first.
pub fn summarize_inbox(self_id: &str, messages: &[Message]) -> Vec<ConversationSummary> {
    let mut out: Vec<ConversationSummary> = Vec::new();
    for m in messages {
        let counterpart = if m.sender_id == self_id {
            &m.recipient_id
        } else if m.recipient_id == self_id {
            &m.sender_id
        } else {
            continue;
        };
        let unread = usize::from(m.recipient_id == self_id && !m.is_read);
        let existing = out
            .iter_mut()
            .find(|s| s.scope.ad_id == m.ad_id && &s.scope.counterpart_id == counterpart);
        match existing {
            Some(summary) => {
                summary.unread += unread;
                if m.display_cmp(&summary.last_message) == Ordering::Greater {
                    summary.last_message = m.clone();
                }
            }
            None => out.push(ConversationSummary {
                scope: ConversationScope::new(m.ad_id.clone(), self_id, counterpart.clone()),
                last_message: m.clone(),
                unread,
            }),
        }
    }
    out.sort_by(|a, b| b.last_message.display_cmp(&a.last_message));
    out
}

#[cfg(test)]
#[path = "models_test.rs"]
mod models_test;
