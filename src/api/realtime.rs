//! Change feed over the backend's Phoenix-channel websocket.
//!
//! One socket per subscription. The socket task owns both halves of the
//! stream; the only link back to the chat view is the bounded channel inside
//! [`Subscription`]. When the view drops it, the task leaves the channel and
//! closes the socket.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use url::Url;

use crate::api::events::{EVENT_CLOSE, EVENT_ERROR, IncomingEvent};
use crate::api::models::ConversationScope;
use crate::api::{ChangeFeed, FeedSignal, Subscription};
use crate::app::AppState;
use crate::error::ChatError;

const FEED_CAPACITY: usize = 256;
const JOIN_REF: &str = "1";

#[derive(Debug, Clone)]
pub struct RealtimeClient {
    ws_url: Url,
    access_token: Option<String>,
    heartbeat: Duration,
    connect_timeout: Duration,
}

impl RealtimeClient {
    pub fn new(
        base_url: &str,
        anon_key: &str,
        access_token: Option<String>,
        heartbeat: Duration,
        connect_timeout: Duration,
    ) -> Result<Self, ChatError> {
        Ok(Self {
            ws_url: socket_url(base_url, anon_key)?,
            access_token: access_token.filter(|t| !t.is_empty()),
            heartbeat,
            connect_timeout,
        })
    }

    pub fn from_state(state: &AppState) -> Result<Self, ChatError> {
        Self::new(
            &state.base_url,
            &state.anon_key,
            state.access_token.clone(),
            state.heartbeat(),
            state.request_timeout(),
        )
    }
}

/// `https://x` becomes `wss://x/realtime/v1/websocket?apikey=..&vsn=1.0.0`.
pub(crate) fn socket_url(base_url: &str, anon_key: &str) -> Result<Url, ChatError> {
    let mut url = Url::parse(base_url.trim_end_matches('/'))?;
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => return Err(ChatError::Config(format!("unsupported scheme {other}"))),
    };
    url.set_scheme(scheme)
        .map_err(|()| ChatError::Config("cannot switch url scheme".into()))?;
    url.set_path("/realtime/v1/websocket");
    url.query_pairs_mut()
        .clear()
        .append_pair("apikey", anon_key)
        .append_pair("vsn", "1.0.0");
    Ok(url)
}

pub(crate) fn channel_topic(scope: &ConversationScope) -> String {
    format!("realtime:chat:{}", scope.cache_key())
}

#[async_trait]
impl ChangeFeed for RealtimeClient {
    async fn subscribe(&self, scope: &ConversationScope) -> Result<Subscription, ChatError> {
        let connect = connect_async(self.ws_url.as_str());
        let (ws, _) = tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| ChatError::SubscriptionDropped("connect timed out".into()))??;
        let (mut sink, stream) = ws.split();

        let topic = channel_topic(scope);
        let join = IncomingEvent::join(&topic, &scope.ad_id, self.access_token.as_deref(), JOIN_REF);
        sink.send(WsMessage::Text(serde_json::to_string(&join)?)).await?;
        log::debug!("joined {topic}");

        let (tx, rx) = mpsc::channel(FEED_CAPACITY);
        tokio::spawn(run_channel(sink, stream, tx, topic, self.heartbeat));
        Ok(Subscription::new(rx))
    }
}

async fn run_channel<S, R>(mut sink: S, mut stream: R, tx: mpsc::Sender<FeedSignal>, topic: String, heartbeat: Duration)
where
    S: futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
    R: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + heartbeat, heartbeat);
    let mut next_ref: u64 = 2;

    let dropped = 'feed: loop {
        tokio::select! {
            () = tx.closed() => {
                let leave = IncomingEvent::leave(&topic, &next_ref.to_string());
                if let Ok(text) = serde_json::to_string(&leave) {
                    let _ = sink.send(WsMessage::Text(text)).await;
                }
                let _ = sink.close().await;
                log::debug!("left {topic}");
                return;
            }
            _ = ticker.tick() => {
                if let Err(e) = send_heartbeat(&mut sink, &mut next_ref).await {
                    break format!("heartbeat failed: {e}");
                }
            }
            frame = stream.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    let event = match IncomingEvent::parse(&text) {
                        Ok(event) => event,
                        Err(e) => {
                            log::warn!("unparseable realtime frame: {e}");
                            continue;
                        }
                    };
                    if event.topic != topic {
                        continue;
                    }
                    let signal = if let Some(change) = event.row_change() {
                        FeedSignal::Change(change)
                    } else if event.reference.as_deref() == Some(JOIN_REF) {
                        match event.reply_status() {
                            Some(Ok(())) => FeedSignal::Subscribed,
                            Some(Err(reason)) => break reason,
                            None => continue,
                        }
                    } else if event.event == EVENT_ERROR || event.event == EVENT_CLOSE {
                        break format!("channel {}", event.event);
                    } else {
                        continue;
                    };
                    // A busy view may leave the channel full; keep the socket alive meanwhile.
                    let permit = loop {
                        tokio::select! {
                            permit = tx.reserve() => break permit,
                            _ = ticker.tick() => {
                                if let Err(e) = send_heartbeat(&mut sink, &mut next_ref).await {
                                    break 'feed format!("heartbeat failed: {e}");
                                }
                            }
                        }
                    };
                    match permit {
                        Ok(permit) => permit.send(signal),
                        // View is gone; the closed() arm finishes up on the next turn.
                        Err(_) => continue,
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => break "socket closed".to_string(),
                Some(Ok(_)) => {}
                Some(Err(e)) => break e.to_string(),
            }
        }
    };

    log::warn!("realtime feed for {topic} dropped: {dropped}");
    let _ = tx.send(FeedSignal::Dropped(dropped)).await;
}

async fn send_heartbeat<S>(sink: &mut S, next_ref: &mut u64) -> Result<(), tokio_tungstenite::tungstenite::Error>
where
    S: futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let beat = IncomingEvent::heartbeat(&next_ref.to_string());
    *next_ref += 1;
    let Ok(text) = serde_json::to_string(&beat) else {
        return Ok(());
    };
    sink.send(WsMessage::Text(text)).await
}

#[cfg(test)]
#[path = "realtime_test.rs"]
mod realtime_test;
