use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

pub const EVENT_JOIN: &str = "phx_join";
pub const EVENT_LEAVE: &str = "phx_leave";
pub const EVENT_REPLY: &str = "phx_reply";
pub const EVENT_ERROR: &str = "phx_error";
pub const EVENT_CLOSE: &str = "phx_close";
pub const EVENT_HEARTBEAT: &str = "heartbeat";
pub const EVENT_CHANGES: &str = "postgres_changes";
pub const HEARTBEAT_TOPIC: &str = "phoenix";

pub const MESSAGES_TABLE: &str = "messages";
pub const TYPING_TABLE: &str = "typing_indicators";

/// Phoenix channel envelope, used both ways on the real-time socket.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct IncomingEvent {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, rename = "ref")]
    pub reference: Option<String>,
}

impl IncomingEvent {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn join(topic: &str, ad_id: &str, access_token: Option<&str>, reference: &str) -> Self {
        let changes: Vec<Value> = [MESSAGES_TABLE, TYPING_TABLE]
            .iter()
            .map(|table| {
                json!({
                    "event": "*",
                    "schema": "public",
                    "table": table,
                    "filter": format!("ad_id=eq.{ad_id}"),
                })
            })
            .collect();
        let mut payload = json!({
            "config": {
                "broadcast": { "self": false },
                "presence": { "key": "" },
                "postgres_changes": changes,
            }
        });
        if let Some(token) = access_token {
            payload["access_token"] = Value::String(token.to_string());
        }
        Self {
            topic: topic.to_string(),
            event: EVENT_JOIN.to_string(),
            payload,
            reference: Some(reference.to_string()),
        }
    }

    pub fn leave(topic: &str, reference: &str) -> Self {
        Self {
            topic: topic.to_string(),
            event: EVENT_LEAVE.to_string(),
            payload: json!({}),
            reference: Some(reference.to_string()),
        }
    }

    pub fn heartbeat(reference: &str) -> Self {
        Self {
            topic: HEARTBEAT_TOPIC.to_string(),
            event: EVENT_HEARTBEAT.to_string(),
            payload: json!({}),
            reference: Some(reference.to_string()),
        }
    }

    /// `Some(Ok(()))` for an ok reply, `Some(Err(reason))` for an error reply.
    pub fn reply_status(&self) -> Option<Result<(), String>> {
        if self.event != EVENT_REPLY {
            return None;
        }
        match self.payload.get("status").and_then(Value::as_str) {
            Some("ok") => Some(Ok(())),
            other => {
                let reason = self
                    .payload
                    .pointer("/response/reason")
                    .and_then(Value::as_str)
                    .or(other)
                    .unwrap_or("join rejected");
                Some(Err(reason.to_string()))
            }
        }
    }

    pub fn row_change(&self) -> Option<RowChange> {
        if self.event != EVENT_CHANGES {
            return None;
        }
        let data = self.payload.get("data")?;
        serde_json::from_value(data.clone()).ok()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// One row-level change from the backend's change feed.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RowChange {
    pub table: String,
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    #[serde(default)]
    pub record: Value,
    #[serde(default)]
    pub old_record: Value,
}

impl RowChange {
    /// Primary key of the affected row, from `record` or, for deletes, `old_record`.
    pub fn row_id(&self) -> Option<&str> {
        let source = match self.kind {
            ChangeKind::Delete => &self.old_record,
            ChangeKind::Insert | ChangeKind::Update => &self.record,
        };
        source.get("id").and_then(Value::as_str)
    }
}

#[cfg(test)]
#[path = "events_test.rs"]
mod events_test;
