//! [`CdpMux`]: a single WebSocket to the browser, assigning monotonically
//! increasing request ids and routing responses to waiters (§4.4 "CDPMux").
//!
//! A background actor task owns the WebSocket, driven by an mpsc command
//! channel, with request/response correlation via `tokio::sync::oneshot`
//! keyed by the monotonic id, and event fan-out via `tokio::sync::broadcast`.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use futures_util::SinkExt;
use futures_util::StreamExt;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;
use tracing::trace;
use tracing::warn;

/// The default CDP WebSocket connect timeout (§4.4: 5s).
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// An error from [`CdpMux`].
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The WebSocket connection attempt exceeded its deadline.
    #[error("cdp/timeout: {0}")]
    Timeout(String),
    /// No suitable CDP target (page) could be found.
    #[error("cdp/no-target: {0}")]
    NoTarget(String),
    /// Chrome responded to a command with a protocol-level error.
    #[error("cdp/protocol: {method} failed ({code}): {message}")]
    Protocol {
        /// The method that failed.
        method: String,
        /// Chrome's numeric error code.
        code: i64,
        /// Chrome's error message.
        message: String,
    },
    /// The WebSocket transport closed (or was never connected).
    #[error("cdp/transport-closed: {0}")]
    TransportClosed(String),
    /// A generic connection failure (HTTP discovery, WebSocket handshake).
    #[error("connection: {0}")]
    Connection(String),
}

/// A `Result` specialized to [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// An unsolicited CDP event (`{method, params}` with no `id`).
#[derive(Clone, Debug)]
pub struct CdpEvent {
    /// The event's CDP method name (e.g. `Network.requestWillBeSent`).
    pub method: String,
    /// The event's parameters.
    pub params: Value,
}

/// Commands sent to the background transport actor.
enum Command {
    Send {
        id: u64,
        method: String,
        params: Value,
        reply: oneshot::Sender<Result<Value>>,
    },
    Shutdown,
}

/// A handle to a connected CDP WebSocket (§4.4).
///
/// Cloning a [`CdpMux`] shares the same background actor and request-id
/// counter; every clone observes the same events and failures.
#[derive(Clone)]
pub struct CdpMux {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<CdpEvent>,
    next_id: Arc<AtomicU64>,
    connected: Arc<std::sync::atomic::AtomicBool>,
}

impl std::fmt::Debug for CdpMux {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CdpMux").finish_non_exhaustive()
    }
}

/// Resolves the WebSocket debugger URL to connect to, per §4.4 "Target
/// selection".
///
/// If `target_selector` names an explicit target id, its page WebSocket URL
/// is constructed directly. Otherwise: fetch `/json/version`; if it carries
/// a `webSocketDebuggerUrl`, use it; otherwise fetch `/json/list` and pick
/// the first `type == "page"` entry. If the resolved URL's host is
/// `localhost` but the caller configured a different host (the tunneled
/// local-forward case), the hostname is rewritten.
pub async fn resolve_target(
    http_base: &str,
    target_selector: Option<&str>,
    configured_host: &str,
) -> Result<String> {
    let client = reqwest::Client::new();

    let ws_url = if let Some(target_id) = target_selector {
        format!("{http_base}/devtools/page/{target_id}")
            .replacen("http://", "ws://", 1)
            .replacen("https://", "wss://", 1)
    } else {
        let version: Value = client
            .get(format!("{http_base}/json/version"))
            .send()
            .await
            .map_err(|err| Error::Connection(err.to_string()))?
            .json()
            .await
            .map_err(|err| Error::Connection(err.to_string()))?;

        if let Some(url) = version.get("webSocketDebuggerUrl").and_then(|v| v.as_str()) {
            url.to_string()
        } else {
            let list: Vec<Value> = client
                .get(format!("{http_base}/json/list"))
                .send()
                .await
                .map_err(|err| Error::Connection(err.to_string()))?
                .json()
                .await
                .map_err(|err| Error::Connection(err.to_string()))?;

            list.iter()
                .find(|entry| entry.get("type").and_then(|v| v.as_str()) == Some("page"))
                .and_then(|entry| entry.get("webSocketDebuggerUrl").and_then(|v| v.as_str()))
                .map(str::to_string)
                .ok_or_else(|| Error::NoTarget("no page target available".into()))?
        }
    };

    Ok(rewrite_localhost(&ws_url, configured_host))
}

/// Rewrites a `localhost` hostname in `ws_url` to `configured_host`, for the
/// tunneled-access case where the browser reports `localhost` but the
/// client is configured with the forward's bind address (§4.4).
fn rewrite_localhost(ws_url: &str, configured_host: &str) -> String {
    if configured_host == "localhost" || configured_host.is_empty() {
        return ws_url.to_string();
    }

    if let Ok(mut parsed) = url::Url::parse(ws_url) {
        if parsed.host_str() == Some("localhost") {
            let _ = parsed.set_host(Some(configured_host));
            return parsed.to_string();
        }
    }

    ws_url.to_string()
}

impl CdpMux {
    /// Connects to `ws_url` and spawns the background transport actor
    /// (§4.4 "connect while already connected is a no-op" is enforced by
    /// the caller holding a single `CdpMux` per session).
    pub async fn connect(ws_url: &str, connect_timeout: Duration) -> Result<Self> {
        let connect = tokio_tungstenite::connect_async(ws_url);
        let (stream, _) = tokio::time::timeout(connect_timeout, connect)
            .await
            .map_err(|_| Error::Timeout(format!("connecting to {ws_url}")))?
            .map_err(|err| Error::Connection(err.to_string()))?;

        let (commands_tx, commands_rx) = mpsc::channel(256);
        let (events_tx, _) = broadcast::channel(1024);
        let connected = Arc::new(std::sync::atomic::AtomicBool::new(true));

        spawn_actor(stream, commands_rx, events_tx.clone(), connected.clone());

        Ok(Self {
            commands: commands_tx,
            events: events_tx,
            next_id: Arc::new(AtomicU64::new(1)),
            connected,
        })
    }

    /// Sends a CDP command and awaits its result (§4.4 "Request/response").
    pub async fn send(&self, method: impl Into<String>, params: Value) -> Result<Value> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(Error::TransportClosed("send after transport closed".into()));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let method = method.into();
        let (reply_tx, reply_rx) = oneshot::channel();

        self.commands
            .send(Command::Send {
                id,
                method: method.clone(),
                params,
                reply: reply_tx,
            })
            .await
            .map_err(|_| Error::TransportClosed("transport actor has exited".into()))?;

        reply_rx
            .await
            .map_err(|_| Error::TransportClosed("transport actor dropped the reply".into()))?
    }

    /// Subscribes to unsolicited CDP events (`message(method, params)`).
    pub fn subscribe(&self) -> broadcast::Receiver<CdpEvent> {
        self.events.subscribe()
    }

    /// Returns `true` iff the WebSocket is (as far as this handle knows)
    /// still connected.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Gracefully closes the WebSocket connection.
    pub async fn disconnect(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }
}

/// Runs the background actor that owns the WebSocket stream, serializing
/// all reads/writes through a single task (§5 "Within one CDPMux, `send`
/// results are delivered in the order responses arrive; inbound events are
/// delivered to subscribers in arrival order, serialized with responses").
fn spawn_actor(
    stream: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    mut commands: mpsc::Receiver<Command>,
    events: broadcast::Sender<CdpEvent>,
    connected: Arc<std::sync::atomic::AtomicBool>,
) {
    tokio::spawn(async move {
        let (mut write, mut read) = stream.split();
        let mut waiters: HashMap<u64, oneshot::Sender<Result<Value>>> = HashMap::new();

        loop {
            tokio::select! {
                command = commands.recv() => {
                    match command {
                        Some(Command::Send { id, method, params, reply }) => {
                            let frame = serde_json::json!({ "id": id, "method": method, "params": params });
                            trace!(id, method = %method, "sending CDP command");

                            match serde_json::to_string(&frame) {
                                Ok(text) => {
                                    if write.send(Message::Text(text.into())).await.is_err() {
                                        let _ = reply.send(Err(Error::TransportClosed("write failed".into())));
                                        break;
                                    }
                                    waiters.insert(id, reply);
                                }
                                Err(err) => {
                                    let _ = reply.send(Err(Error::Connection(err.to_string())));
                                }
                            }
                        }
                        Some(Command::Shutdown) | None => break,
                    }
                }
                message = read.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            handle_inbound_frame(&text, &mut waiters, &events);
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(err)) => {
                            warn!(error = %err, "CDP WebSocket error");
                            break;
                        }
                        None => break,
                    }
                }
            }
        }

        // Transport closed: fail every outstanding waiter exactly once
        // (§9 "Request/response correlation"), then clear the map.
        connected.store(false, Ordering::SeqCst);
        for (_, waiter) in waiters.drain() {
            let _ = waiter.send(Err(Error::TransportClosed("WebSocket closed".into())));
        }
        debug!("CDP transport actor exiting");
    });
}

/// Parses one inbound WebSocket frame and either completes a waiter (for a
/// response) or fans the frame out as an event (for a notification).
fn handle_inbound_frame(
    text: &str,
    waiters: &mut HashMap<u64, oneshot::Sender<Result<Value>>>,
    events: &broadcast::Sender<CdpEvent>,
) {
    let Ok(frame) = serde_json::from_str::<Value>(text) else {
        warn!("received malformed CDP frame");
        return;
    };

    if let Some(id) = frame.get("id").and_then(|v| v.as_u64()) {
        let Some(waiter) = waiters.remove(&id) else {
            return;
        };

        if let Some(error) = frame.get("error") {
            let code = error.get("code").and_then(|v| v.as_i64()).unwrap_or(0);
            let message = error
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let method = frame
                .get("method")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let _ = waiter.send(Err(Error::Protocol { method, code, message }));
        } else {
            let result = frame.get("result").cloned().unwrap_or(Value::Null);
            let _ = waiter.send(Ok(result));
        }
        return;
    }

    if let Some(method) = frame.get("method").and_then(|v| v.as_str()) {
        let params = frame.get("params").cloned().unwrap_or(Value::Null);
        // No receivers is a normal, silent case: nobody happens to be
        // subscribed to this particular event stream right now.
        let _ = events.send(CdpEvent {
            method: method.to_string(),
            params,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_localhost_when_client_is_configured_elsewhere() {
        let rewritten = rewrite_localhost("ws://localhost:9222/devtools/page/ABC", "127.0.0.1");
        assert_eq!(rewritten, "ws://127.0.0.1:9222/devtools/page/ABC");
    }

    #[test]
    fn leaves_non_localhost_urls_untouched() {
        let rewritten = rewrite_localhost("ws://10.0.0.5:9222/devtools/page/ABC", "127.0.0.1");
        assert_eq!(rewritten, "ws://10.0.0.5:9222/devtools/page/ABC");
    }

    #[test]
    fn inbound_error_frame_fails_the_waiter_with_protocol_error() {
        let mut waiters = HashMap::new();
        let (tx, rx) = oneshot::channel();
        waiters.insert(1, tx);
        let (events, _) = broadcast::channel(8);

        let frame = serde_json::json!({
            "id": 1,
            "method": "Page.navigate",
            "error": { "code": -32000, "message": "boom" }
        })
        .to_string();

        handle_inbound_frame(&frame, &mut waiters, &events);
        let result = rx.try_recv().unwrap();
        assert!(matches!(result, Err(Error::Protocol { code: -32000, .. })));
    }

    #[test]
    fn inbound_notification_without_id_is_broadcast() {
        let mut waiters = HashMap::new();
        let (events, mut rx) = broadcast::channel(8);

        let frame = serde_json::json!({
            "method": "Page.loadEventFired",
            "params": { "timestamp": 1.0 }
        })
        .to_string();

        handle_inbound_frame(&frame, &mut waiters, &events);
        let event = rx.try_recv().unwrap();
        assert_eq!(event.method, "Page.loadEventFired");
    }
}
