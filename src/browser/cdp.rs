//! Minimal Chrome DevTools Protocol client.
//!
//! One WebSocket per page, owned by a connection actor. Commands are JSON
//! `{id, method, params}` with replies routed back through oneshot channels;
//! protocol events fan out on a broadcast channel so the navigation wait and
//! the screencast pump can subscribe independently.

use std::collections::HashMap;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;

use crate::errors::BrowserError;

/// Capacity of the event fan-out. Screencast frames are the dominant event;
/// a subscriber that lags simply misses frames, which the feed tolerates.
const EVENT_CAPACITY: usize = 256;
const COMMAND_CAPACITY: usize = 32;

/// A protocol event, e.g. `Page.screencastFrame`.
#[derive(Debug, Clone)]
pub struct CdpEvent {
    pub method: String,
    pub params: Value,
}

struct CdpCommand {
    method: String,
    params: Value,
    reply: oneshot::Sender<Result<Value, BrowserError>>,
}

/// Handle to a live CDP WebSocket session. Cheap to clone.
#[derive(Clone)]
pub struct CdpConnection {
    cmd_tx: mpsc::Sender<CdpCommand>,
    event_tx: broadcast::Sender<CdpEvent>,
}

impl CdpConnection {
    /// Connects to a page's `webSocketDebuggerUrl` and spawns the actor that
    /// owns the socket.
    pub async fn connect(ws_url: &str) -> Result<Self, BrowserError> {
        let (socket, _response) = tokio_tungstenite::connect_async(ws_url)
            .await
            .map_err(|e| BrowserError::ConnectFailed(e.to_string()))?;

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);

        tokio::spawn(run_connection(socket, cmd_rx, event_tx.clone()));

        Ok(Self { cmd_tx, event_tx })
    }

    /// Issues a command and waits for the browser's reply.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, BrowserError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(CdpCommand {
                method: method.to_string(),
                params,
                reply: reply_tx,
            })
            .await
            .map_err(|_| BrowserError::SessionClosed)?;
        reply_rx.await.map_err(|_| BrowserError::SessionClosed)?
    }

    /// Subscribes to protocol events.
    pub fn subscribe(&self) -> broadcast::Receiver<CdpEvent> {
        self.event_tx.subscribe()
    }

    /// True while the actor still accepts commands.
    pub fn is_open(&self) -> bool {
        !self.cmd_tx.is_closed()
    }
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn run_connection(
    mut socket: WsStream,
    mut cmd_rx: mpsc::Receiver<CdpCommand>,
    event_tx: broadcast::Sender<CdpEvent>,
) {
    let mut next_id: u64 = 1;
    let mut pending: HashMap<u64, oneshot::Sender<Result<Value, BrowserError>>> = HashMap::new();

    loop {
        tokio::select! {
            maybe_cmd = cmd_rx.recv() => {
                let Some(cmd) = maybe_cmd else { break };
                let id = next_id;
                next_id += 1;
                let payload = json!({
                    "id": id,
                    "method": cmd.method,
                    "params": cmd.params,
                })
                .to_string();
                if socket.send(Message::Text(payload.into())).await.is_err() {
                    let _ = cmd.reply.send(Err(BrowserError::SessionClosed));
                    break;
                }
                pending.insert(id, cmd.reply);
            }
            maybe_msg = socket.next() => {
                let text = match maybe_msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        tracing::warn!(target: "cdp", "socket error: {e}");
                        break;
                    }
                };
                let Ok(value) = serde_json::from_str::<Value>(&text) else {
                    tracing::warn!(target: "cdp", "unparseable message from browser");
                    continue;
                };
                dispatch(value, &mut pending, &event_tx);
            }
        }
    }

    for (_, reply) in pending.drain() {
        let _ = reply.send(Err(BrowserError::SessionClosed));
    }
    tracing::debug!(target: "cdp", "connection actor finished");
}

fn dispatch(
    value: Value,
    pending: &mut HashMap<u64, oneshot::Sender<Result<Value, BrowserError>>>,
    event_tx: &broadcast::Sender<CdpEvent>,
) {
    if let Some(id) = value.get("id").and_then(Value::as_u64) {
        let Some(reply) = pending.remove(&id) else {
            return;
        };
        let outcome = if let Some(error) = value.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown protocol error");
            Err(BrowserError::Protocol(message.to_string()))
        } else {
            Ok(value.get("result").cloned().unwrap_or(Value::Null))
        };
        let _ = reply.send(outcome);
    } else if let Some(method) = value.get("method").and_then(Value::as_str) {
        let _ = event_tx.send(CdpEvent {
            method: method.to_string(),
            params: value.get("params").cloned().unwrap_or(Value::Null),
        });
    }
}
