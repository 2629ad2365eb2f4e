use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use shared::{
    domain::UserId,
    protocol::{ChangeEvent, ChatMessage},
};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use crate::{error::SyncError, RealtimeConnector, RealtimeSubscription, SubscriptionRequest};

const JOIN_REF: &str = "1";
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);
const PROTOCOL_VERSION: &str = "1.0.0";

/// One frame of the Phoenix channel protocol spoken by the realtime service.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PhoenixFrame {
    topic: String,
    event: String,
    #[serde(default)]
    payload: Value,
    #[serde(rename = "ref", default)]
    reference: Option<String>,
}

impl PhoenixFrame {
    fn new(topic: &str, event: &str, payload: Value, reference: impl Into<String>) -> Self {
        Self {
            topic: topic.to_string(),
            event: event.to_string(),
            payload,
            reference: Some(reference.into()),
        }
    }

    fn to_message(&self) -> Result<Message> {
        Ok(Message::Text(serde_json::to_string(self)?))
    }
}

#[derive(Debug, Deserialize)]
struct PostgresChange {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    table: Option<String>,
    record: Value,
}

#[derive(Debug, PartialEq)]
enum FrameAction {
    Change(ChangeEvent),
    Closed,
    Ignore,
}

pub(crate) fn topic_for(user_id: UserId) -> String {
    format!("realtime:messages:{user_id}")
}

/// Join payload: inserts where the user is recipient or sender, and updates
/// where the user is recipient.
pub(crate) fn join_payload(user_id: UserId, access_token: &str) -> Value {
    let change = |event: &str, column: &str| {
        json!({
            "event": event,
            "schema": "public",
            "table": "messages",
            "filter": format!("{column}=eq.{user_id}"),
        })
    };
    json!({
        "config": {
            "broadcast": { "self": false },
            "presence": { "key": "" },
            "postgres_changes": [
                change("INSERT", "recipient_id"),
                change("INSERT", "sender_id"),
                change("UPDATE", "recipient_id"),
            ],
        },
        "access_token": access_token,
    })
}

fn decode_frame(text: &str, topic: &str) -> FrameAction {
    let frame: PhoenixFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(err) => {
            warn!("realtime: undecodable frame skipped: {err}");
            return FrameAction::Ignore;
        }
    };
    if frame.topic != topic {
        return FrameAction::Ignore;
    }

    match frame.event.as_str() {
        "postgres_changes" => {
            let Some(data) = frame.payload.get("data").cloned() else {
                return FrameAction::Ignore;
            };
            let change: PostgresChange = match serde_json::from_value(data) {
                Ok(change) => change,
                Err(err) => {
                    warn!("realtime: malformed change payload skipped: {err}");
                    return FrameAction::Ignore;
                }
            };
            if change.table.as_deref().is_some_and(|table| table != "messages") {
                return FrameAction::Ignore;
            }
            let record: ChatMessage = match serde_json::from_value(change.record) {
                Ok(record) => record,
                Err(err) => {
                    warn!("realtime: message record skipped: {err}");
                    return FrameAction::Ignore;
                }
            };
            match change.kind.as_str() {
                "INSERT" => FrameAction::Change(ChangeEvent::Insert(record)),
                "UPDATE" => FrameAction::Change(ChangeEvent::Update(record)),
                _ => FrameAction::Ignore,
            }
        }
        "phx_close" | "phx_error" => FrameAction::Closed,
        "system" if frame.payload.get("status").and_then(Value::as_str) == Some("error") => {
            warn!(payload = %frame.payload, "realtime: channel reported an error");
            FrameAction::Closed
        }
        _ => FrameAction::Ignore,
    }
}

/// Connects to the platform realtime websocket and joins one
/// `postgres_changes` channel per subscription.
pub struct PhoenixRealtimeConnector {
    platform_url: String,
    anon_key: String,
    heartbeat: Duration,
}

impl PhoenixRealtimeConnector {
    pub fn new(platform_url: impl Into<String>, anon_key: impl Into<String>, heartbeat: Duration) -> Self {
        Self {
            platform_url: platform_url.into(),
            anon_key: anon_key.into(),
            heartbeat,
        }
    }

    pub(crate) fn websocket_url(&self) -> Result<Url> {
        let mut url = Url::parse(&self.platform_url)
            .map_err(|_| SyncError::InvalidPlatformUrl(self.platform_url.clone()))?;
        let scheme = match url.scheme() {
            "https" => "wss",
            "http" => "ws",
            _ => return Err(SyncError::InvalidPlatformUrl(self.platform_url.clone()).into()),
        };
        url.set_scheme(scheme)
            .map_err(|_| SyncError::InvalidPlatformUrl(self.platform_url.clone()))?;
        let base_path = url.path().trim_end_matches('/').to_string();
        url.set_path(&format!("{base_path}/realtime/v1/websocket"));
        url.query_pairs_mut()
            .clear()
            .append_pair("apikey", &self.anon_key)
            .append_pair("vsn", PROTOCOL_VERSION);
        Ok(url)
    }
}

#[async_trait]
impl RealtimeConnector for PhoenixRealtimeConnector {
    async fn connect(&self, request: SubscriptionRequest) -> Result<Box<dyn RealtimeSubscription>> {
        let url = self.websocket_url()?;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .with_context(|| format!("failed to connect realtime websocket: {}", url.path()))?;
        let (mut writer, mut reader) = ws_stream.split();

        let user_id = request.identity.user_id;
        let topic = topic_for(user_id);
        let join = PhoenixFrame::new(
            &topic,
            "phx_join",
            join_payload(user_id, &request.identity.access_token),
            JOIN_REF,
        );
        writer.send(join.to_message()?).await?;

        tokio::time::timeout(JOIN_TIMEOUT, async {
            loop {
                match reader.next().await {
                    Some(Ok(Message::Text(text))) => {
                        let Ok(frame) = serde_json::from_str::<PhoenixFrame>(&text) else {
                            continue;
                        };
                        if frame.event != "phx_reply"
                            || frame.topic != topic
                            || frame.reference.as_deref() != Some(JOIN_REF)
                        {
                            continue;
                        }
                        if frame.payload.get("status").and_then(Value::as_str) == Some("ok") {
                            return Ok(());
                        }
                        let reason = frame
                            .payload
                            .pointer("/response/reason")
                            .and_then(Value::as_str)
                            .unwrap_or("join refused")
                            .to_string();
                        return Err(anyhow::Error::from(SyncError::SubscriptionRejected(reason)));
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return Err(anyhow!("realtime socket closed before join reply"))
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return Err(err.into()),
                }
            }
        })
        .await
        .context("timed out waiting for realtime join reply")??;
        info!(user_id = %user_id, topic = %topic, "realtime: channel joined");

        let (changes_tx, changes_rx) = mpsc::unbounded_channel();
        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();
        let heartbeat_every = self.heartbeat;
        let pump_topic = topic.clone();
        let task = tokio::spawn(async move {
            let mut heartbeat = tokio::time::interval(heartbeat_every);
            heartbeat.tick().await;
            let mut next_ref: u64 = 2;
            loop {
                tokio::select! {
                    _ = heartbeat.tick() => {
                        let frame = PhoenixFrame::new("phoenix", "heartbeat", json!({}), next_ref.to_string());
                        next_ref += 1;
                        let Ok(message) = frame.to_message() else { break };
                        if let Err(err) = writer.send(message).await {
                            warn!(topic = %pump_topic, "realtime: heartbeat failed: {err}");
                            break;
                        }
                    }
                    outgoing = outgoing_rx.recv() => match outgoing {
                        Some(message) => {
                            let closing = matches!(message, Message::Close(_));
                            if writer.send(message).await.is_err() || closing {
                                break;
                            }
                        }
                        None => break,
                    },
                    incoming = reader.next() => match incoming {
                        Some(Ok(Message::Text(text))) => match decode_frame(&text, &pump_topic) {
                            FrameAction::Change(change) => {
                                if changes_tx.send(change).is_err() {
                                    break;
                                }
                            }
                            FrameAction::Closed => {
                                debug!(topic = %pump_topic, "realtime: channel closed by server");
                                break;
                            }
                            FrameAction::Ignore => {}
                        },
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            warn!(topic = %pump_topic, "realtime: receive failed: {err}");
                            break;
                        }
                    },
                }
            }
        });

        Ok(Box::new(PhoenixSubscription {
            topic,
            changes: changes_rx,
            outgoing: outgoing_tx,
            task: Some(task),
        }))
    }
}

pub struct PhoenixSubscription {
    topic: String,
    changes: mpsc::UnboundedReceiver<ChangeEvent>,
    outgoing: mpsc::UnboundedSender<Message>,
    task: Option<JoinHandle<()>>,
}

#[async_trait]
impl RealtimeSubscription for PhoenixSubscription {
    async fn next_change(&mut self) -> Option<ChangeEvent> {
        self.changes.recv().await
    }

    async fn close(&mut self) -> Result<()> {
        let Some(mut task) = self.task.take() else {
            return Ok(());
        };
        let leave = PhoenixFrame::new(&self.topic, "phx_leave", json!({}), "leave");
        let _ = self.outgoing.send(leave.to_message()?);
        let _ = self.outgoing.send(Message::Close(None));
        if tokio::time::timeout(CLOSE_TIMEOUT, &mut task).await.is_err() {
            task.abort();
        }
        Ok(())
    }
}

impl Drop for PhoenixSubscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
#[path = "tests/realtime_tests.rs"]
mod tests;
