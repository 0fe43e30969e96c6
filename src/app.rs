use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::api::StaticSession;
use crate::error::ChatError;

const CONFIG_FILE: &str = "marketplace-chat.toml";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppState {
    pub base_url: String,
    pub anon_key: String,
    pub access_token: Option<String>,
    pub user_id: Option<String>,
    pub request_timeout_secs: u64,
    pub typing_debounce_ms: u64,
    pub typing_ttl_secs: u64,
    pub heartbeat_secs: u64,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    pub sign_in_path: String,
}

impl Default for AppState {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            anon_key: String::new(),
            access_token: None,
            user_id: None,
            request_timeout_secs: 15,
            typing_debounce_ms: 300,
            typing_ttl_secs: 3,
            heartbeat_secs: 25,
            reconnect_initial_ms: 1000,
            reconnect_max_ms: 10_000,
            sign_in_path: "/login".into(),
        }
    }
}

impl AppState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config_path() -> Option<PathBuf> {
        let base = BaseDirs::new()?;
        Some(base.config_dir().join(CONFIG_FILE))
    }

    /// Loads the user's config file; anything unreadable falls back to defaults.
    pub fn load() -> Self {
        let Some(path) = Self::config_path() else {
            log::warn!("no config directory, using defaults");
            return Self::new();
        };
        match Self::load_from(&path) {
            Ok(state) => state,
            Err(e) => {
                if path.exists() {
                    log::warn!("ignoring {}: {e}", path.display());
                }
                Self::new()
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, ChatError> {
        let text = fs::read_to_string(path).map_err(|e| ChatError::Config(e.to_string()))?;
        toml::from_str(&text).map_err(|e| ChatError::Config(e.to_string()))
    }

    pub fn save(&self) -> Result<(), ChatError> {
        let path = Self::config_path().ok_or_else(|| ChatError::Config("no config dir".into()))?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ChatError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| ChatError::Config(e.to_string()))?;
        }
        let toml = toml::to_string_pretty(self).map_err(|e| ChatError::Config(e.to_string()))?;
        fs::write(path, toml).map_err(|e| ChatError::Config(e.to_string()))
    }

    pub fn is_configured(&self) -> bool {
        !self.base_url.is_empty() && !self.anon_key.is_empty()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn typing_debounce(&self) -> Duration {
        Duration::from_millis(self.typing_debounce_ms)
    }

    pub fn typing_ttl(&self) -> Duration {
        Duration::from_secs(self.typing_ttl_secs.max(1))
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }

    pub fn sign_in_url(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), self.sign_in_path)
    }

    pub fn session(&self) -> StaticSession {
        StaticSession {
            user_id: self.user_id.clone(),
            sign_in_url: self.sign_in_url(),
        }
    }
}

#[cfg(test)]
#[path = "app_test.rs"]
mod app_test;
