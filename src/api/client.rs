use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::header::{CONTENT_RANGE, HeaderValue};
use reqwest::{Client as HttpClient, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::time::Duration;

use crate::api::MessageBackend;
use crate::api::events::{MESSAGES_TABLE, TYPING_TABLE};
use crate::api::models::{
    ConversationScope, ConversationSummary, Message, NewMessage, TypingIndicator, summarize_inbox,
};
use crate::app::AppState;
use crate::error::ChatError;

const INBOX_LIMIT: usize = 500;

/// Credentials returned by a password sign-in.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthSession {
    pub access_token: String,
    pub user_id: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    user: TokenUser,
}

#[derive(Deserialize)]
struct TokenUser {
    id: String,
}

/// REST client for the hosted backend (PostgREST tables plus the auth endpoint).
#[derive(Clone)]
pub struct ApiClient {
    http: HttpClient,
    base_url: String,
    anon_key: String,
    access_token: Option<String>,
}

impl ApiClient {
    pub fn new(
        base_url: &str,
        anon_key: &str,
        access_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ChatError> {
        let http = HttpClient::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            anon_key: anon_key.to_string(),
            access_token: access_token.filter(|t| !t.is_empty()),
        })
    }

    pub fn from_state(state: &AppState) -> Result<Self, ChatError> {
        Self::new(
            &state.base_url,
            &state.anon_key,
            state.access_token.clone(),
            state.request_timeout(),
        )
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    fn rest(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn with_auth(&self, req: RequestBuilder) -> RequestBuilder {
        let bearer = self.access_token.as_deref().unwrap_or(&self.anon_key);
        req.header("apikey", &self.anon_key)
            .header("Authorization", format!("Bearer {bearer}"))
    }

    fn check(resp: Response) -> Result<Response, ChatError> {
        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ChatError::PermissionDenied(format!("HTTP {status}")));
        }
        if !status.is_success() {
            return Err(ChatError::NetworkFailure(format!("HTTP {status}")));
        }
        Ok(resp)
    }

    async fn rows<T: DeserializeOwned>(resp: Response) -> Result<Vec<T>, ChatError> {
        let text = Self::check(resp)?.text().await?;
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&text)?)
    }

    pub async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<AuthSession, ChatError> {
        let endpoint = format!("{}/auth/v1/token", self.base_url);
        let req = self
            .http
            .post(&endpoint)
            .query(&[("grant_type", "password")])
            .header("apikey", &self.anon_key)
            .json(&json!({ "email": email, "password": password }));
        let resp = req.send().await?;
        if resp.status() == StatusCode::BAD_REQUEST {
            return Err(ChatError::PermissionDenied("invalid email or password".into()));
        }
        let token: TokenResponse = Self::check(resp)?.json().await?;
        Ok(AuthSession {
            access_token: token.access_token,
            user_id: token.user.id,
        })
    }
}

fn eq(value: &str) -> String {
    format!("eq.{value}")
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// PostgREST filter matching both directions of a conversation.
pub(crate) fn pair_filter(scope: &ConversationScope) -> String {
    let (me, them) = (&scope.self_id, &scope.counterpart_id);
    format!(
        "(and(sender_id.eq.{me},recipient_id.eq.{them}),and(sender_id.eq.{them},recipient_id.eq.{me}))"
    )
}

/// Total from a `Content-Range` header such as `0-24/57` or `*/0`.
pub(crate) fn content_range_total(header: Option<&HeaderValue>) -> Option<u64> {
    let raw = header?.to_str().ok()?;
    let (_, total) = raw.rsplit_once('/')?;
    total.trim().parse().ok()
}

#[async_trait]
impl MessageBackend for ApiClient {
    async fn fetch_history(&self, scope: &ConversationScope) -> Result<Vec<Message>, ChatError> {
        let req = self.http.get(self.rest(MESSAGES_TABLE)).query(&[
            ("select", "*".to_string()),
            ("ad_id", eq(&scope.ad_id)),
            ("or", pair_filter(scope)),
            ("order", "created_at.asc,id.asc".to_string()),
        ]);
        let resp = self.with_auth(req).send().await?;
        Self::rows(resp).await
    }

    async fn insert_message(&self, message: &NewMessage) -> Result<Message, ChatError> {
        let req = self
            .http
            .post(self.rest(MESSAGES_TABLE))
            .header("Prefer", "return=representation")
            .json(message);
        let resp = self.with_auth(req).send().await?;
        Self::rows::<Message>(resp)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ChatError::NetworkFailure("insert returned no row".into()))
    }

    async fn update_content(
        &self,
        id: &str,
        sender_id: &str,
        content: &str,
        edited_at: DateTime<Utc>,
    ) -> Result<Option<Message>, ChatError> {
        let req = self
            .http
            .patch(self.rest(MESSAGES_TABLE))
            .query(&[("id", eq(id)), ("sender_id", eq(sender_id))])
            .header("Prefer", "return=representation")
            .json(&json!({ "content": content, "edited_at": timestamp(edited_at) }));
        let resp = self.with_auth(req).send().await?;
        Ok(Self::rows::<Message>(resp).await?.into_iter().next())
    }

    async fn delete_message(&self, id: &str, sender_id: &str) -> Result<bool, ChatError> {
        let req = self
            .http
            .delete(self.rest(MESSAGES_TABLE))
            .query(&[("id", eq(id)), ("sender_id", eq(sender_id))])
            .header("Prefer", "return=representation");
        let resp = self.with_auth(req).send().await?;
        Ok(!Self::rows::<Message>(resp).await?.is_empty())
    }

    async fn mark_read(&self, id: &str, recipient_id: &str) -> Result<Option<Message>, ChatError> {
        let req = self
            .http
            .patch(self.rest(MESSAGES_TABLE))
            .query(&[("id", eq(id)), ("recipient_id", eq(recipient_id))])
            .header("Prefer", "return=representation")
            .json(&json!({ "is_read": true }));
        let resp = self.with_auth(req).send().await?;
        Ok(Self::rows::<Message>(resp).await?.into_iter().next())
    }

    async fn upsert_typing(&self, indicator: &TypingIndicator) -> Result<(), ChatError> {
        let req = self
            .http
            .post(self.rest(TYPING_TABLE))
            .query(&[("on_conflict", "ad_id,user_id,recipient_id")])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(indicator);
        let resp = self.with_auth(req).send().await?;
        Self::check(resp)?;
        Ok(())
    }

    async fn clear_typing(&self, scope: &ConversationScope) -> Result<(), ChatError> {
        let req = self.http.delete(self.rest(TYPING_TABLE)).query(&[
            ("ad_id", eq(&scope.ad_id)),
            ("user_id", eq(&scope.self_id)),
            ("recipient_id", eq(&scope.counterpart_id)),
        ]);
        let resp = self.with_auth(req).send().await?;
        Self::check(resp)?;
        Ok(())
    }

    async fn fetch_typing(
        &self,
        scope: &ConversationScope,
        now: DateTime<Utc>,
    ) -> Result<Vec<TypingIndicator>, ChatError> {
        let req = self.http.get(self.rest(TYPING_TABLE)).query(&[
            ("select", "*".to_string()),
            ("ad_id", eq(&scope.ad_id)),
            ("user_id", eq(&scope.counterpart_id)),
            ("recipient_id", eq(&scope.self_id)),
            ("expires_at", format!("gt.{}", timestamp(now))),
        ]);
        let resp = self.with_auth(req).send().await?;
        Self::rows(resp).await
    }

    async fn unread_count(&self, user_id: &str) -> Result<u64, ChatError> {
        let req = self
            .http
            .get(self.rest(MESSAGES_TABLE))
            .query(&[
                ("select", "id".to_string()),
                ("recipient_id", eq(user_id)),
                ("is_read", "eq.false".to_string()),
            ])
            .header("Prefer", "count=exact");
        let resp = Self::check(self.with_auth(req).send().await?)?;
        if let Some(total) = content_range_total(resp.headers().get(CONTENT_RANGE)) {
            return Ok(total);
        }
        let ids: Vec<serde_json::Value> = Self::rows(resp).await?;
        Ok(ids.len() as u64)
    }

    async fn inbox(&self, user_id: &str) -> Result<Vec<ConversationSummary>, ChatError> {
        let req = self.http.get(self.rest(MESSAGES_TABLE)).query(&[
            ("select", "*".to_string()),
            ("or", format!("(sender_id.eq.{user_id},recipient_id.eq.{user_id})")),
            ("order", "created_at.desc".to_string()),
            ("limit", INBOX_LIMIT.to_string()),
        ]);
        let resp = self.with_auth(req).send().await?;
        let recent: Vec<Message> = Self::rows(resp).await?;
        Ok(summarize_inbox(user_id, &recent))
    }
}

#[cfg(test)]
#[path = "client_test.rs"]
mod client_test;
