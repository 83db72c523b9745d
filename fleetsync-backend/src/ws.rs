//! WebSocket change feed.
//!
//! Each subscription opens its own socket and sends
//! `{"type":"subscribe","table":"<table>"}`. The server answers with JSON
//! frames: row changes carry `"type": "INSERT" | "UPDATE" | "DELETE"` plus
//! the change fields, `{"type":"error","message":..}` reports a channel-level
//! problem, anything else (acks, heartbeats) is ignored. When the socket
//! closes or errors, the subscription's event stream ends.

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, Request};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use fleetsync_core::{
    ChangeEvent, ChangeFeed, ConfigError, FeedMessage, FeedSubscription, SubscriptionError,
    SyncResult, TableName,
};

use crate::config::BackendConfig;

/// Buffer between the socket reader and the subscriber.
pub const CHANNEL_CAPACITY: usize = 256;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct OpenChannel {
    table: TableName,
    close: oneshot::Sender<()>,
}

/// `ChangeFeed` over WebSocket, one socket per channel.
pub struct WsChangeFeed {
    endpoint: String,
    api_key: String,
    bearer: String,
    channels: Arc<DashMap<String, OpenChannel>>,
    next_id: AtomicU64,
}

impl WsChangeFeed {
    pub fn new(config: &BackendConfig) -> SyncResult<Self> {
        config.validate()?;
        Ok(Self {
            endpoint: config.realtime_endpoint(),
            api_key: config.api_key.clone(),
            bearer: format!("Bearer {}", config.bearer_token()),
            channels: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Tables with an open socket.
    pub fn open_tables(&self) -> Vec<TableName> {
        self.channels.iter().map(|c| c.table.clone()).collect()
    }

    fn request(&self) -> SyncResult<Request<()>> {
        let mut request =
            self.endpoint
                .as_str()
                .into_client_request()
                .map_err(|e| ConfigError::InvalidValue {
                    field: "backend.realtime_url".to_string(),
                    value: self.endpoint.clone(),
                    reason: e.to_string(),
                })?;
        let headers = request.headers_mut();
        headers.insert("apikey", header_value("backend.api_key", &self.api_key)?);
        headers.insert(
            "authorization",
            header_value("backend.access_token", &self.bearer)?,
        );
        Ok(request)
    }
}

fn header_value(field: &str, value: &str) -> Result<HeaderValue, ConfigError> {
    HeaderValue::from_str(value).map_err(|e| ConfigError::InvalidValue {
        field: field.to_string(),
        value: "<redacted>".to_string(),
        reason: e.to_string(),
    })
}

/// Frame that opens a table channel.
pub fn subscribe_frame(table: &TableName) -> String {
    json!({"type": "subscribe", "table": table.as_str()}).to_string()
}

/// Frame that closes a table channel.
pub fn unsubscribe_frame(table: &TableName) -> String {
    json!({"type": "unsubscribe", "table": table.as_str()}).to_string()
}

/// Decode a server text frame. `None` for frames that carry no event.
pub fn decode_frame(text: &str) -> Option<FeedMessage> {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(err) => return Some(FeedMessage::Error(format!("undecodable frame: {err}"))),
    };
    match value.get("type").and_then(Value::as_str) {
        Some("INSERT" | "UPDATE" | "DELETE") => match serde_json::from_value::<ChangeEvent>(value) {
            Ok(event) => Some(FeedMessage::Change(event)),
            Err(err) => Some(FeedMessage::Error(format!(
                "undecodable change event: {err}"
            ))),
        },
        Some("error") => Some(FeedMessage::Error(
            value
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown channel error")
                .to_string(),
        )),
        _ => None,
    }
}

fn channel_failed(table: &TableName, reason: impl ToString) -> SubscriptionError {
    SubscriptionError::ChannelFailed {
        table: table.to_string(),
        reason: reason.to_string(),
    }
}

#[async_trait]
impl ChangeFeed for WsChangeFeed {
    async fn subscribe(&self, table: &TableName) -> SyncResult<FeedSubscription> {
        let request = self.request()?;
        let (socket, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| channel_failed(table, e))?;
        let (mut sink, source) = socket.split();
        sink.send(Message::Text(subscribe_frame(table)))
            .await
            .map_err(|e| channel_failed(table, e))?;

        let channel_id = format!(
            "realtime:{}:{}",
            table,
            self.next_id.fetch_add(1, Ordering::Relaxed)
        );
        let (events_tx, events) = mpsc::channel(CHANNEL_CAPACITY);
        let (close, close_rx) = oneshot::channel();
        self.channels.insert(
            channel_id.clone(),
            OpenChannel {
                table: table.clone(),
                close,
            },
        );
        tokio::spawn(forward(
            table.clone(),
            channel_id.clone(),
            sink,
            source,
            events_tx,
            close_rx,
            self.channels.clone(),
        ));
        info!(table = %table, channel = %channel_id, "Opened change channel");

        Ok(FeedSubscription { channel_id, events })
    }

    async fn unsubscribe(&self, channel_id: &str) -> SyncResult<()> {
        if let Some((_, channel)) = self.channels.remove(channel_id) {
            let _ = channel.close.send(());
            debug!(channel = %channel_id, "Closing change channel");
        }
        Ok(())
    }
}

async fn forward(
    table: TableName,
    channel_id: String,
    mut sink: SplitSink<Socket, Message>,
    mut source: SplitStream<Socket>,
    events: mpsc::Sender<FeedMessage>,
    mut close: oneshot::Receiver<()>,
    channels: Arc<DashMap<String, OpenChannel>>,
) {
    loop {
        tokio::select! {
            _ = &mut close => {
                let _ = sink.send(Message::Text(unsubscribe_frame(&table))).await;
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            frame = source.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if let Some(message) = decode_frame(&text) {
                        if events.send(message).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    debug!(table = %table, channel = %channel_id, "Change channel closed by server");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(table = %table, channel = %channel_id, error = %err, "Change channel failed");
                    break;
                }
            }
        }
    }
    channels.remove(&channel_id);
}

impl std::fmt::Debug for WsChangeFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsChangeFeed")
            .field("endpoint", &self.endpoint)
            .field("channels", &self.channels.len())
            .finish_non_exhaustive()
    }
}
