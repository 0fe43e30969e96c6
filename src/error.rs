use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("network failure: {0}")]
    NetworkFailure(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("invalid input: {0}")]
    ValidationFailure(&'static str),
    #[error("real-time subscription dropped: {0}")]
    SubscriptionDropped(String),
    #[error("message {0} not found")]
    NotFound(String),
    #[error("sign in required (redirect to {redirect})")]
    SignInRequired { redirect: String },
    #[error("cache error: {0}")]
    Cache(#[from] rusqlite::Error),
    #[error("config error: {0}")]
    Config(String),
}

impl ChatError {
    /// Text shown to the user in a toast.
    pub fn user_message(&self) -> String {
        match self {
            ChatError::NetworkFailure(_) => "Could not reach the server. Please try again.".into(),
            ChatError::PermissionDenied(_) => "You are not allowed to do that.".into(),
            ChatError::ValidationFailure(what) => format!("Cannot send: {what}."),
            ChatError::SubscriptionDropped(_) => {
                "Lost connection to the chat. Messages may be out of date.".into()
            }
            ChatError::NotFound(_) => "That message no longer exists.".into(),
            ChatError::SignInRequired { .. } => "Please sign in to chat.".into(),
            ChatError::Cache(_) => "Could not read the local message cache.".into(),
            ChatError::Config(e) => format!("Configuration problem: {e}"),
        }
    }

    pub fn is_network(&self) -> bool {
        matches!(self, ChatError::NetworkFailure(_))
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(e: reqwest::Error) -> Self {
        match e.status().map(|s| s.as_u16()) {
            Some(401 | 403) => ChatError::PermissionDenied(e.to_string()),
            _ => ChatError::NetworkFailure(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(e: serde_json::Error) -> Self {
        ChatError::NetworkFailure(format!("malformed response: {e}"))
    }
}

impl From<url::ParseError> for ChatError {
    fn from(e: url::ParseError) -> Self {
        ChatError::Config(format!("invalid url: {e}"))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ChatError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ChatError::SubscriptionDropped(e.to_string())
    }
}
