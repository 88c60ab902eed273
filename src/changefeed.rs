//! Row-level changefeed from the canonical store.
//!
//! `Changefeed` is the boundary the realtime manager subscribes through.
//! `SupabaseChangefeed` speaks the Phoenix-channel realtime protocol over a
//! websocket: join one topic carrying a `postgres_changes` filter per
//! monitored table, wait for the join reply, then pump change frames into
//! an mpsc channel until the socket closes or the subscription is dropped.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::normalize_store_url;
use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};

/// Phoenix-level keepalive, independent of the crew heartbeat.
const PHX_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const EVENT_BUFFER: usize = 256;
const CHANNEL_TOPIC: &str = "realtime:order-sync";
const JOIN_REF: &str = "1";

// ---------------------------------------------------------------------------
// Event model
// ---------------------------------------------------------------------------

/// The record families the manager monitors over one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    Orders,
    CrewStatus,
    CrewSessions,
    CrewActivity,
}

impl Family {
    pub const ALL: [Family; 4] = [
        Family::Orders,
        Family::CrewStatus,
        Family::CrewSessions,
        Family::CrewActivity,
    ];

    pub fn table(self) -> &'static str {
        match self {
            Family::Orders => "orders",
            Family::CrewStatus => "crew_status",
            Family::CrewSessions => "crew_sessions",
            Family::CrewActivity => "crew_activity_logs",
        }
    }

    pub fn from_table(table: &str) -> Option<Family> {
        Family::ALL.into_iter().find(|f| f.table() == table)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// One row-level change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    #[serde(alias = "type", alias = "eventType")]
    pub event_type: ChangeKind,
    pub table: String,
    #[serde(default)]
    pub record: Value,
    #[serde(default)]
    pub old_record: Value,
}

impl ChangeEvent {
    pub fn family(&self) -> Option<Family> {
        Family::from_table(&self.table)
    }

    /// `record` for inserts/updates, `old_record` for deletes.
    pub fn row(&self) -> &Value {
        match self.event_type {
            ChangeKind::Delete => &self.old_record,
            _ => &self.record,
        }
    }
}

// ---------------------------------------------------------------------------
// Subscription handle
// ---------------------------------------------------------------------------

/// A live subscription. Dropping it releases the underlying transport.
pub struct Subscription {
    events: mpsc::Receiver<ChangeEvent>,
    shutdown: CancellationToken,
}

impl Subscription {
    pub fn new(events: mpsc::Receiver<ChangeEvent>, shutdown: CancellationToken) -> Self {
        Self { events, shutdown }
    }

    /// Next change, or `None` once the transport has closed.
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        self.events.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
pub trait Changefeed: Send + Sync + 'static {
    /// Open one multiplexed subscription covering `families`. Resolves once
    /// the transport reports subscribed (Ok) or failed (Err).
    async fn subscribe(&self, families: &[Family]) -> StoreResult<Subscription>;
}

// ---------------------------------------------------------------------------
// Phoenix frames
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawFrame {
    event: String,
    #[serde(default)]
    payload: Value,
    #[serde(default, rename = "ref")]
    reference: Option<String>,
}

/// What an incoming frame means to the subscription.
#[derive(Debug, PartialEq)]
enum Frame {
    JoinOk,
    JoinError(String),
    Change(ChangeEvent),
    ChannelClosed(String),
    Ignored,
}

fn parse_frame(text: &str) -> Frame {
    let raw: RawFrame = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(e) => {
            debug!("Ignoring unparseable realtime frame: {e}");
            return Frame::Ignored;
        }
    };

    match raw.event.as_str() {
        "phx_reply" if raw.reference.as_deref() == Some(JOIN_REF) => {
            if raw.payload.get("status").and_then(Value::as_str) == Some("ok") {
                Frame::JoinOk
            } else {
                let reason = raw
                    .payload
                    .pointer("/response/reason")
                    .and_then(Value::as_str)
                    .unwrap_or("join rejected")
                    .to_string();
                Frame::JoinError(reason)
            }
        }
        "postgres_changes" => match raw.payload.get("data") {
            Some(data) => match serde_json::from_value::<ChangeEvent>(data.clone()) {
                Ok(event) => Frame::Change(event),
                Err(e) => {
                    warn!("Malformed postgres_changes payload: {e}");
                    Frame::Ignored
                }
            },
            None => Frame::Ignored,
        },
        "system" if raw.payload.get("status").and_then(Value::as_str) == Some("error") => {
            let message = raw
                .payload
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("channel error")
                .to_string();
            Frame::ChannelClosed(message)
        }
        "phx_error" => Frame::ChannelClosed("channel errored".to_string()),
        "phx_close" => Frame::ChannelClosed("channel closed".to_string()),
        _ => Frame::Ignored,
    }
}

fn join_message(families: &[Family], access_token: &str) -> Value {
    let changes: Vec<Value> = families
        .iter()
        .map(|f| serde_json::json!({ "event": "*", "schema": "public", "table": f.table() }))
        .collect();
    serde_json::json!({
        "topic": CHANNEL_TOPIC,
        "event": "phx_join",
        "payload": {
            "config": {
                "broadcast": { "self": false },
                "presence": { "key": "" },
                "postgres_changes": changes,
            },
            "access_token": access_token,
        },
        "ref": JOIN_REF,
        "join_ref": JOIN_REF,
    })
}

/// `https://x.supabase.co` -> `wss://x.supabase.co/realtime/v1/websocket`.
pub fn realtime_url(store_url: &str, api_key: &str) -> String {
    let base = normalize_store_url(store_url);
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base
    };
    format!("{ws_base}/realtime/v1/websocket?apikey={api_key}&vsn=1.0.0")
}

// ---------------------------------------------------------------------------
// Websocket implementation
// ---------------------------------------------------------------------------

pub struct SupabaseChangefeed {
    ws_url: String,
    api_key: String,
}

impl SupabaseChangefeed {
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            ws_url: realtime_url(&config.url, &config.anon_key),
            api_key: config.anon_key.clone(),
        }
    }
}

#[async_trait]
impl Changefeed for SupabaseChangefeed {
    async fn subscribe(&self, families: &[Family]) -> StoreResult<Subscription> {
        let (ws, _) = tokio_tungstenite::connect_async(self.ws_url.as_str())
            .await
            .map_err(|e| StoreError::Unreachable(format!("realtime connect: {e}")))?;
        let (mut ws_sink, mut ws_stream) = ws.split();

        let join = join_message(families, &self.api_key).to_string();
        ws_sink
            .send(Message::Text(join.into()))
            .await
            .map_err(|e| StoreError::Subscribe(format!("join send: {e}")))?;

        // Wait for the join reply; changes are not delivered before it.
        loop {
            match ws_stream.next().await {
                Some(Ok(Message::Text(text))) => match parse_frame(&text) {
                    Frame::JoinOk => break,
                    Frame::JoinError(reason) | Frame::ChannelClosed(reason) => {
                        return Err(StoreError::Subscribe(reason));
                    }
                    _ => {}
                },
                Some(Ok(Message::Close(_))) | None => {
                    return Err(StoreError::Subscribe("socket closed during join".into()));
                }
                Some(Err(e)) => return Err(StoreError::Subscribe(e.to_string())),
                _ => {}
            }
        }

        info!(
            tables = families.len(),
            "Realtime subscription established"
        );

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let shutdown = CancellationToken::new();
        let task_shutdown = shutdown.clone();

        tokio::spawn(async move {
            let mut heartbeat = tokio::time::interval(PHX_HEARTBEAT_INTERVAL);
            heartbeat.tick().await; // skip immediate tick
            let mut heartbeat_ref: u64 = 1;

            loop {
                tokio::select! {
                    _ = task_shutdown.cancelled() => {
                        let _ = ws_sink.close().await;
                        debug!("Realtime subscription released");
                        return;
                    }

                    _ = heartbeat.tick() => {
                        heartbeat_ref += 1;
                        let hb = serde_json::json!({
                            "topic": "phoenix",
                            "event": "heartbeat",
                            "payload": {},
                            "ref": heartbeat_ref.to_string(),
                        });
                        if ws_sink.send(Message::Text(hb.to_string().into())).await.is_err() {
                            warn!("Realtime heartbeat failed, closing subscription");
                            return;
                        }
                    }

                    msg = ws_stream.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => match parse_frame(&text) {
                                Frame::Change(event) => {
                                    if tx.send(event).await.is_err() {
                                        return;
                                    }
                                }
                                Frame::ChannelClosed(reason) => {
                                    warn!("Realtime channel closed: {reason}");
                                    return;
                                }
                                _ => {}
                            },
                            Some(Ok(Message::Ping(data))) => {
                                let _ = ws_sink.send(Message::Pong(data)).await;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                info!("Realtime socket closed by server");
                                return;
                            }
                            Some(Err(e)) => {
                                warn!("Realtime socket error: {e}");
                                return;
                            }
                            _ => {}
                        }
                    }
                }
            }
        });

        Ok(Subscription::new(rx, shutdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn family_table_round_trip() {
        for family in Family::ALL {
            assert_eq!(Family::from_table(family.table()), Some(family));
        }
        assert_eq!(Family::from_table("products"), None);
    }

    #[test]
    fn parses_join_reply() {
        let ok = r#"{"event":"phx_reply","payload":{"status":"ok","response":{}},"ref":"1","topic":"realtime:order-sync"}"#;
        assert_eq!(parse_frame(ok), Frame::JoinOk);

        let err = r#"{"event":"phx_reply","payload":{"status":"error","response":{"reason":"unauthorized"}},"ref":"1"}"#;
        assert_eq!(parse_frame(err), Frame::JoinError("unauthorized".into()));

        // Heartbeat replies carry other refs and are ignored.
        let hb = r#"{"event":"phx_reply","payload":{"status":"ok"},"ref":"7"}"#;
        assert_eq!(parse_frame(hb), Frame::Ignored);
    }

    #[test]
    fn parses_postgres_change() {
        let text = r#"{
            "event": "postgres_changes",
            "topic": "realtime:order-sync",
            "payload": {
                "ids": [1],
                "data": {
                    "type": "UPDATE",
                    "table": "orders",
                    "schema": "public",
                    "record": {"id": "o-1", "status": "ready"},
                    "old_record": {"id": "o-1"},
                    "commit_timestamp": "2026-10-16T09:00:00Z"
                }
            }
        }"#;
        match parse_frame(text) {
            Frame::Change(event) => {
                assert_eq!(event.event_type, ChangeKind::Update);
                assert_eq!(event.family(), Some(Family::Orders));
                assert_eq!(event.row()["status"], "ready");
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn channel_errors_close_subscription() {
        let text = r#"{"event":"system","payload":{"status":"error","message":"replication slot lost"}}"#;
        assert_eq!(
            parse_frame(text),
            Frame::ChannelClosed("replication slot lost".into())
        );
        assert_eq!(
            parse_frame(r#"{"event":"phx_close","payload":{}}"#),
            Frame::ChannelClosed("channel closed".into())
        );
        assert_eq!(parse_frame("not json"), Frame::Ignored);
    }

    #[test]
    fn join_message_lists_every_family() {
        let msg = join_message(&Family::ALL, "anon");
        let tables: Vec<&str> = msg["payload"]["config"]["postgres_changes"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["table"].as_str().unwrap())
            .collect();
        assert_eq!(
            tables,
            vec!["orders", "crew_status", "crew_sessions", "crew_activity_logs"]
        );
        assert_eq!(msg["event"], "phx_join");
    }

    #[test]
    fn realtime_url_switches_scheme() {
        assert_eq!(
            realtime_url("https://abc.supabase.co/", "k"),
            "wss://abc.supabase.co/realtime/v1/websocket?apikey=k&vsn=1.0.0"
        );
        assert_eq!(
            realtime_url("localhost:54321", "k"),
            "ws://localhost:54321/realtime/v1/websocket?apikey=k&vsn=1.0.0"
        );
    }

    #[test]
    fn delete_row_uses_old_record() {
        let event = ChangeEvent {
            event_type: ChangeKind::Delete,
            table: "crew_sessions".into(),
            record: Value::Null,
            old_record: serde_json::json!({"id": "s-1"}),
        };
        assert_eq!(event.row()["id"], "s-1");
    }
}
