use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use rusqlite::{Connection, OptionalExtension, params};
use std::fs;
use std::path::{Path, PathBuf};

use crate::api::models::{ConversationScope, Message};
use crate::error::ChatError;

pub fn default_path() -> Option<PathBuf> {
    let proj = ProjectDirs::from("com", "example", "MarketplaceChat")?;
    Some(proj.data_dir().join("cache.sqlite"))
}

// Last fetched history per conversation, painted before the network answers
// and kept on screen while the feed is down.
pub struct SnapshotCache {
    conn: Connection,
}

impl SnapshotCache {
    pub fn open(path: &Path) -> Result<Self, ChatError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| ChatError::Config(e.to_string()))?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, ChatError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, ChatError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                scope_key TEXT NOT NULL,
                created_at TEXT NOT NULL,
                raw_json TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS messages_scope ON messages (scope_key, created_at, id);
            CREATE TABLE IF NOT EXISTS scopes (
                scope_key TEXT PRIMARY KEY,
                fetched_at TEXT NOT NULL
            );
            "#,
        )?;
        Ok(Self { conn })
    }

    /// Replaces everything cached for the scope with `messages`.
    pub fn save_history(&mut self, scope: &ConversationScope, messages: &[Message]) -> Result<(), ChatError> {
        let key = scope.cache_key();
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM messages WHERE scope_key = ?1", params![key])?;
        for m in messages.iter().filter(|m| scope.contains(m)) {
            let raw = serde_json::to_string(m).map_err(|e| ChatError::Config(e.to_string()))?;
            tx.execute(
                r#"
                INSERT INTO messages (id, scope_key, created_at, raw_json)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(id) DO UPDATE SET
                    scope_key=excluded.scope_key,
                    created_at=excluded.created_at,
                    raw_json=excluded.raw_json
                "#,
                params![m.id, key, m.created_at, raw],
            )?;
        }
        tx.execute(
            r#"
            INSERT INTO scopes (scope_key, fetched_at) VALUES (?1, ?2)
            ON CONFLICT(scope_key) DO UPDATE SET fetched_at=excluded.fetched_at
            "#,
            params![key, Utc::now()],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn load_history(&self, scope: &ConversationScope) -> Result<Vec<Message>, ChatError> {
        let mut stmt = self
            .conn
            .prepare("SELECT raw_json FROM messages WHERE scope_key = ?1 ORDER BY created_at ASC, id ASC")?;
        let rows = stmt.query_map(params![scope.cache_key()], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for raw in rows {
            let raw = raw?;
            match serde_json::from_str::<Message>(&raw) {
                Ok(m) if scope.contains(&m) => out.push(m),
                Ok(_) => {}
                Err(e) => log::warn!("skipping unreadable cached message: {e}"),
            }
        }
        Ok(out)
    }

    pub fn last_fetched_at(&self, scope: &ConversationScope) -> Result<Option<DateTime<Utc>>, ChatError> {
        let ts = self
            .conn
            .query_row(
                "SELECT fetched_at FROM scopes WHERE scope_key = ?1",
                params![scope.cache_key()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(ts)
    }
}

#[cfg(test)]
#[path = "storage_test.rs"]
mod storage_test;
