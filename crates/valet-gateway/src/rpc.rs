//! Local WebSocket RPC server.
//!
//! Wire frames:
//!
//! ```text
//! req   : {"type":"req",   "id":"…", "method":"…", "params":…}
//! res   : {"type":"res",   "id":"…", "ok":bool, "payload"?, "error"?}
//! event : {"type":"event", "event":"…", "payload"?}
//! ```
//!
//! Trust model: loopback only — any origin is accepted and there is no
//! authentication. Handlers are invoked inline, serializing request handling
//! per connection; an error frame is always preferred over closing the
//! connection.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::future::BoxFuture;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const ERR_INVALID_REQUEST: &str = "INVALID_REQUEST";
pub const ERR_METHOD_NOT_FOUND: &str = "METHOD_NOT_FOUND";
pub const ERR_INTERNAL: &str = "INTERNAL_ERROR";

// ──────────────────── Wire types ────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct RequestFrame {
    #[serde(rename = "type", default)]
    pub frame_type: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Serialize)]
pub struct ErrorShape {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ResponseFrame {
    #[serde(rename = "type")]
    pub frame_type: &'static str,
    pub id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}

impl ResponseFrame {
    pub fn success(id: String, payload: Value) -> Self {
        Self {
            frame_type: "res",
            id,
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn error(id: String, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            frame_type: "res",
            id,
            ok: false,
            payload: None,
            error: Some(ErrorShape {
                code,
                message: message.into(),
            }),
        }
    }
}

/// Server-pushed notification frame.
#[derive(Debug, Serialize)]
pub struct EventFrame {
    #[serde(rename = "type")]
    pub frame_type: &'static str,
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl EventFrame {
    pub fn new(event: impl Into<String>, payload: Option<Value>) -> Self {
        Self {
            frame_type: "event",
            event: event.into(),
            payload,
        }
    }
}

// ──────────────────── Server ────────────────────

/// Handles one RPC method call. An `Err` becomes an INTERNAL_ERROR frame.
pub type RpcHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, String>> + Send + Sync>;

pub struct RpcServer {
    handlers: RwLock<HashMap<String, RpcHandler>>,
}

impl RpcServer {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a handler for a method name.
    pub async fn register(&self, method: &str, handler: RpcHandler) {
        self.handlers.write().await.insert(method.to_string(), handler);
    }

    /// Parse and process one text frame.
    pub async fn dispatch(&self, text: &str) -> ResponseFrame {
        let request: RequestFrame = match serde_json::from_str(text) {
            Ok(request) => request,
            Err(_) => RequestFrame::default(),
        };
        if request.frame_type != "req" || request.id.is_empty() || request.method.is_empty() {
            return ResponseFrame::error(request.id, ERR_INVALID_REQUEST, "invalid request frame");
        }

        let handler = {
            let handlers = self.handlers.read().await;
            handlers.get(&request.method).cloned()
        };
        let Some(handler) = handler else {
            return ResponseFrame::error(
                request.id,
                ERR_METHOD_NOT_FOUND,
                format!("unknown method: {}", request.method),
            );
        };

        match handler(request.params).await {
            Ok(payload) => ResponseFrame::success(request.id, payload),
            Err(message) => ResponseFrame::error(request.id, ERR_INTERNAL, message),
        }
    }

    /// Bind `addr` and serve WebSocket connections until `cancel` fires.
    /// Returns once the listener is bound.
    pub async fn start(self: Arc<Self>, addr: &str, cancel: CancellationToken) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("rpc listen {addr}"))?;
        info!("rpc listening on ws://{addr}");

        let app = Router::new().route("/", get(ws_upgrade)).with_state(self);
        tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(cancel.cancelled_owned());
            if let Err(e) = serve.await {
                warn!("rpc server error: {e}");
            }
        });
        Ok(())
    }
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(server): State<Arc<RpcServer>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, server))
}

async fn handle_connection(mut socket: WebSocket, server: Arc<RpcServer>) {
    info!("rpc client connected");
    while let Some(msg) = socket.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            // Abnormal closure is routine for one-shot clients that skip
            // the close handshake.
            Err(e) => {
                info!("rpc client disconnected: {e}");
                return;
            }
        };
        match msg {
            Message::Text(text) => {
                let response = server.dispatch(&text).await;
                let json = match serde_json::to_string(&response) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("rpc response serialize error: {e}");
                        continue;
                    }
                };
                if socket.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            Message::Ping(data) => {
                if socket.send(Message::Pong(data)).await.is_err() {
                    break;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    info!("rpc client disconnected");
}
