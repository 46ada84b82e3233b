//! High-level handle on one browser page.
//!
//! Opens a fresh page through the DevTools HTTP API, then drives it over a
//! [`CdpConnection`]: navigation with a completion signal, element waits and
//! clicks, in-page evaluation, and the screencast feed with per-frame
//! acknowledgment.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;

use crate::browser::cdp::CdpConnection;
use crate::errors::BrowserError;
use crate::pipeline::{Frame, FrameQueue};

const SELECTOR_POLL_INTERVAL: Duration = Duration::from_millis(250);
const SCREENCAST_QUALITY: u32 = 80;

/// Page operations the playback activator needs. A trait seam so the
/// selector cascade is testable without a browser.
pub trait PageOps {
    /// Waits up to `timeout` for the selector to match an element.
    async fn wait_for_selector(&self, selector: &str, timeout: Duration) -> bool;
    /// Clicks the first element matching the selector; false when absent.
    async fn click(&self, selector: &str) -> bool;
    /// Evaluates an expression in the page, returning its JSON value.
    async fn evaluate(&self, expression: &str) -> Result<Value, BrowserError>;
}

#[derive(Deserialize)]
struct NewTargetReply {
    id: String,
    #[serde(rename = "webSocketDebuggerUrl")]
    ws_url: String,
}

/// One rendering-surface session. Cheap to clone; all clones share the
/// underlying WebSocket actor.
#[derive(Clone)]
pub struct Page {
    conn: CdpConnection,
    target_id: String,
    chrome_host: String,
    http: reqwest::Client,
}

impl Page {
    /// Opens a new blank page on the browser at `chrome_host` (host:port of
    /// its DevTools HTTP endpoint) and attaches to it.
    pub async fn open(chrome_host: &str) -> Result<Self, BrowserError> {
        let http = reqwest::Client::new();
        let endpoint = format!("http://{chrome_host}/json/new");

        // Chrome switched /json/new from GET to PUT; try PUT first.
        let response = match http.put(&endpoint).send().await {
            Ok(r) if r.status().is_success() => r,
            _ => http
                .get(&endpoint)
                .send()
                .await
                .map_err(|e| BrowserError::ConnectFailed(e.to_string()))?,
        };
        let target: NewTargetReply = response
            .json()
            .await
            .map_err(|e| BrowserError::ConnectFailed(format!("bad /json/new reply: {e}")))?;

        let conn = CdpConnection::connect(&target.ws_url).await?;
        conn.call("Page.enable", json!({})).await?;
        conn.call("Runtime.enable", json!({})).await?;

        tracing::info!(target: "browser", target_id = %target.id, "page session opened");

        Ok(Self {
            conn,
            target_id: target.id,
            chrome_host: chrome_host.to_string(),
            http,
        })
    }

    /// Navigates and waits for the load event. A timeout here is fatal to
    /// session startup, unlike the activator's element waits.
    pub async fn navigate(&self, url: &str, timeout: Duration) -> Result<(), BrowserError> {
        // Subscribe before issuing the command so the load event can't slip
        // between the reply and the wait.
        let mut events = self.conn.subscribe();

        let reply = self.conn.call("Page.navigate", json!({ "url": url })).await?;
        if let Some(error_text) = reply.get("errorText").and_then(Value::as_str) {
            if !error_text.is_empty() {
                return Err(BrowserError::NavigationFailed {
                    url: url.to_string(),
                    detail: error_text.to_string(),
                });
            }
        }

        let wait = async {
            loop {
                match events.recv().await {
                    Ok(event) if event.method == "Page.loadEventFired" => return Ok(()),
                    Ok(_) => continue,
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return Err(BrowserError::SessionClosed),
                }
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(BrowserError::NavigationTimeout(timeout)),
        }
    }

    /// Starts the screencast feed and spawns the pump that decodes each
    /// frame, acknowledges it, and appends it to the capture queue. The pump
    /// stops when the capturing flag clears or the session closes.
    pub async fn start_screencast(
        &self,
        max_width: u32,
        max_height: u32,
        queue: Arc<FrameQueue>,
        capturing: Arc<AtomicBool>,
    ) -> Result<(), BrowserError> {
        let mut events = self.conn.subscribe();
        self.conn
            .call(
                "Page.startScreencast",
                json!({
                    "format": "jpeg",
                    "quality": SCREENCAST_QUALITY,
                    "maxWidth": max_width,
                    "maxHeight": max_height,
                }),
            )
            .await?;

        let conn = self.conn.clone();
        tokio::spawn(async move {
            let mut seq: u64 = 0;
            loop {
                if !capturing.load(Ordering::SeqCst) {
                    break;
                }
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(target: "browser", skipped, "screencast pump lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                if event.method != "Page.screencastFrame" {
                    continue;
                }

                // Ack first so the browser keeps the feed flowing even if
                // this frame turns out to be undecodable.
                if let Some(session_id) = event.params.get("sessionId").cloned() {
                    let _ = conn
                        .call(
                            "Page.screencastFrameAck",
                            json!({ "sessionId": session_id }),
                        )
                        .await;
                }

                let Some(data) = event.params.get("data").and_then(Value::as_str) else {
                    continue;
                };
                match BASE64.decode(data) {
                    Ok(bytes) => {
                        if let Some(evicted) = queue.push(Frame::new(Bytes::from(bytes), seq)) {
                            tracing::warn!(target: "browser", evicted, "capture queue overflow, dropped oldest frame");
                        }
                        seq += 1;
                    }
                    Err(e) => {
                        tracing::warn!(target: "browser", "undecodable screencast frame: {e}");
                    }
                }
            }
            tracing::debug!(target: "browser", frames = seq, "screencast pump finished");
        });

        Ok(())
    }

    pub async fn stop_screencast(&self) {
        let _ = self.conn.call("Page.stopScreencast", json!({})).await;
    }

    /// Closes the page. Best-effort: the protocol close first, then the
    /// DevTools HTTP endpoint as a fallback for a wedged socket.
    pub async fn close(&self) {
        if self.conn.is_open() {
            let _ = self.conn.call("Page.close", json!({})).await;
        }
        let endpoint = format!("http://{}/json/close/{}", self.chrome_host, self.target_id);
        let _ = self.http.get(&endpoint).send().await;
        tracing::info!(target: "browser", target_id = %self.target_id, "page session closed");
    }
}

impl PageOps for Page {
    async fn wait_for_selector(&self, selector: &str, timeout: Duration) -> bool {
        let quoted = serde_json::to_string(selector).unwrap_or_default();
        let expression = format!("document.querySelector({quoted}) !== null");
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Ok(value) = self.evaluate(&expression).await {
                if value.as_bool() == Some(true) {
                    return true;
                }
            }
            if tokio::time::Instant::now() + SELECTOR_POLL_INTERVAL > deadline {
                return false;
            }
            tokio::time::sleep(SELECTOR_POLL_INTERVAL).await;
        }
    }

    async fn click(&self, selector: &str) -> bool {
        let quoted = serde_json::to_string(selector).unwrap_or_default();
        let expression = format!(
            "(() => {{ const el = document.querySelector({quoted}); \
             if (!el) return false; el.click(); return true; }})()"
        );
        matches!(self.evaluate(&expression).await, Ok(value) if value.as_bool() == Some(true))
    }

    async fn evaluate(&self, expression: &str) -> Result<Value, BrowserError> {
        let reply = self
            .conn
            .call(
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "returnByValue": true,
                    "awaitPromise": true,
                    "userGesture": true,
                }),
            )
            .await?;
        if let Some(exception) = reply.get("exceptionDetails") {
            let text = exception
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or("evaluation threw");
            return Err(BrowserError::Protocol(text.to_string()));
        }
        Ok(reply
            .pointer("/result/value")
            .cloned()
            .unwrap_or(Value::Null))
    }
}
