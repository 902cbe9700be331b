//! Minimal Chrome DevTools Protocol client over WebSocket
//!
//! Sends JSON commands with increasing ids, correlates responses through
//! oneshot channels, and queues unsolicited events for the caller.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace, warn};

use super::error::RenderError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<CdpResponse>>>>;

/// Default budget for a single command round trip
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Unsolicited message pushed by the browser
#[derive(Debug, Clone)]
pub struct CdpEvent {
    pub method: String,
    pub params: Value,
}

#[derive(Debug, Clone)]
struct CdpResponse {
    result: Option<Value>,
    error: Option<CdpResponseError>,
}

#[derive(Debug, Clone, Deserialize)]
struct CdpResponseError {
    code: i64,
    message: String,
    #[serde(default)]
    data: Option<String>,
}

/// Decoded inbound frame
#[derive(Debug)]
enum Incoming {
    Response(u64, CdpResponse),
    Event(CdpEvent),
}

/// Classify a decoded frame: an `id` makes it a response, else a `method` makes it an event
fn parse_incoming(mut frame: Value) -> Option<Incoming> {
    if let Some(id) = frame.get("id").and_then(Value::as_u64) {
        let error = frame
            .get("error")
            .and_then(|e| CdpResponseError::deserialize(e).ok());
        return Some(Incoming::Response(
            id,
            CdpResponse {
                result: frame.get_mut("result").map(Value::take),
                error,
            },
        ));
    }
    let method = frame.get("method")?.as_str()?.to_owned();
    let params = frame.get_mut("params").map_or(Value::Null, Value::take);
    Some(Incoming::Event(CdpEvent { method, params }))
}

/// DevTools connection to one browser or page target
pub struct CdpClient {
    next_id: AtomicU64,
    pending: Pending,
    writer: Mutex<SplitSink<WsStream, Message>>,
    events: mpsc::UnboundedReceiver<CdpEvent>,
    reader: JoinHandle<()>,
}

impl CdpClient {
    /// Connect to a `ws://host:port/devtools/...` endpoint
    pub async fn connect(ws_url: &str) -> Result<Self, RenderError> {
        let (stream, _) = tokio_tungstenite::connect_async(ws_url)
            .await
            .map_err(|e| RenderError::ConnectionFailed {
                url: ws_url.to_owned(),
                reason: e.to_string(),
            })?;
        debug!(url = ws_url, "DevTools connection established");

        let (writer, reader) = stream.split();
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (event_tx, events) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_loop(reader, Arc::clone(&pending), event_tx));

        Ok(Self {
            next_id: AtomicU64::new(1),
            pending,
            writer: Mutex::new(writer),
            events,
            reader,
        })
    }

    /// Send a command with the default timeout
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, RenderError> {
        self.call_with_timeout(method, params, COMMAND_TIMEOUT).await
    }

    /// Send a command and wait up to `timeout` for its result
    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, RenderError> {
        self.dispatch(method, params).await?.wait(timeout).await
    }

    /// Send a command without waiting for its response
    ///
    /// Lets the caller keep draining events while the browser works on the
    /// command, e.g. answering intercepted requests during `Page.navigate`.
    pub async fn dispatch(&self, method: &str, params: Value) -> Result<PendingCall, RenderError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = json!({ "id": id, "method": method, "params": params }).to_string();

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        trace!(id, method, "sending CDP command");
        let sent = self
            .writer
            .lock()
            .await
            .send(Message::Text(frame.into()))
            .await;
        if let Err(e) = sent {
            self.pending.lock().await.remove(&id);
            return Err(RenderError::Protocol {
                detail: format!("failed to send {method}: {e}"),
            });
        }

        Ok(PendingCall {
            id,
            method: method.to_owned(),
            rx,
            pending: Arc::clone(&self.pending),
        })
    }

    /// Next queued event; `None` once the connection has closed
    pub async fn recv_event(&mut self) -> Option<CdpEvent> {
        self.events.recv().await
    }

    /// Pop an already-queued event without waiting
    pub fn try_recv_event(&mut self) -> Option<CdpEvent> {
        self.events.try_recv().ok()
    }

    /// Discard every queued event
    pub fn drain_events(&mut self) -> usize {
        let mut drained = 0;
        while self.try_recv_event().is_some() {
            drained += 1;
        }
        drained
    }
}

/// Command sent by [`CdpClient::dispatch`] whose response is still outstanding
pub struct PendingCall {
    id: u64,
    method: String,
    rx: oneshot::Receiver<CdpResponse>,
    pending: Pending,
}

impl PendingCall {
    /// Wait up to `timeout` for the command's result
    pub async fn wait(self, timeout: Duration) -> Result<Value, RenderError> {
        let Self {
            id,
            method,
            rx,
            pending,
        } = self;

        let response = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => {
                return Err(RenderError::Protocol {
                    detail: format!("connection closed while awaiting {method}"),
                });
            }
            Err(_) => {
                pending.lock().await.remove(&id);
                return Err(RenderError::CommandTimeout {
                    method,
                    duration: timeout,
                });
            }
        };

        if let Some(err) = response.error {
            return Err(RenderError::Cdp {
                code: err.code,
                message: err.message,
                data: err.data,
            });
        }
        Ok(response.result.unwrap_or(Value::Null))
    }
}

impl Drop for CdpClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop(
    mut reader: SplitStream<WsStream>,
    pending: Pending,
    events: mpsc::UnboundedSender<CdpEvent>,
) {
    while let Some(message) = reader.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text.to_string(),
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => text,
                Err(_) => continue,
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                warn!(error = %e, "DevTools read failed, closing connection");
                break;
            }
        };

        let Ok(frame) = serde_json::from_str::<Value>(&text) else {
            warn!("discarding non-JSON DevTools frame");
            continue;
        };

        match parse_incoming(frame) {
            Some(Incoming::Response(id, response)) => {
                if let Some(tx) = pending.lock().await.remove(&id) {
                    let _ = tx.send(response);
                }
            }
            Some(Incoming::Event(event)) => {
                let _ = events.send(event);
            }
            None => {}
        }
    }

    // Dropping the senders wakes every caller still waiting on a response.
    pending.lock().await.clear();
}
