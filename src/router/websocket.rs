//! WebSocket transport
//!
//! Messages are JSON objects `{event, data}`. Per-server sockets receive
//! the server's bus events in publish order and accept console commands,
//! power requests, stats pulls, and console-log subscriptions. The global
//! socket carries server created/deleted notifications.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Extension, State};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::events::EventName;
use crate::server::{ensure_console_pump, preamble, PowerAction, Server};

use super::AppState;

#[derive(Debug, Deserialize)]
struct IncomingMessage {
    event: String,

    #[serde(default)]
    data: serde_json::Value,
}

fn outgoing(event: &str, data: serde_json::Value) -> String {
    json!({ "event": event, "data": data }).to_string()
}

fn error_message(message: impl std::fmt::Display) -> String {
    outgoing("error", json!({ "message": message.to_string() }))
}

pub async fn server_ws(
    ws: WebSocketUpgrade,
    Extension(server): Extension<Arc<Server>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_server_socket(socket, server))
}

async fn handle_server_socket(socket: WebSocket, server: Arc<Server>) {
    let (mut sink, mut stream) = socket.split();

    // One writer task per connection keeps event ordering per the bus and
    // lets command handlers queue replies without touching the socket.
    let (out_tx, mut out_rx) = mpsc::channel::<String>(64);
    let writer = tokio::spawn(async move {
        while let Some(text) = out_rx.recv().await {
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let key = uuid::Uuid::new_v4().to_string();
    let mut events = server.events().subscribe(&key);

    info!(server = %server.uuid(), "websocket connected");

    loop {
        tokio::select! {
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<IncomingMessage>(&text) {
                            Ok(message) => handle_incoming(&server, message, &out_tx).await,
                            Err(_) => {
                                let _ = out_tx.send(error_message("malformed message")).await;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(server = %server.uuid(), "websocket read error: {}", e);
                        break;
                    }
                }
            }

            event = events.recv() => {
                match event {
                    Some(event) => {
                        if event.server() == Some(server.uuid()) {
                            if let Ok(text) = serde_json::to_string(&event) {
                                if out_tx.send(text).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    None => break,
                }
            }
        }
    }

    server.events().unsubscribe(&key);
    drop(out_tx);
    let _ = writer.await;
    info!(server = %server.uuid(), "websocket disconnected");
}

async fn handle_incoming(
    server: &Arc<Server>,
    message: IncomingMessage,
    out_tx: &mpsc::Sender<String>,
) {
    match message.event.as_str() {
        "send command" => {
            let Some(command) = message.data.as_str() else {
                let _ = out_tx.send(error_message("expected a command string")).await;
                return;
            };

            if let Err(e) = server.send_command(command).await {
                let _ = out_tx.send(error_message(e)).await;
            }
        }

        "send server stats" => match server.stats().await {
            Ok(snapshot) => {
                let _ = out_tx
                    .send(outgoing(
                        EventName::ServerStats.as_str(),
                        json!({ "server": server.uuid(), "stats": snapshot }),
                    ))
                    .await;
            }
            Err(e) => {
                let _ = out_tx.send(error_message(e)).await;
            }
        },

        "server power event" => {
            let Some(action) = message.data.as_str().and_then(PowerAction::parse) else {
                let _ = out_tx.send(error_message("unknown power action")).await;
                return;
            };

            // Power actions can block on the runtime; run them off the
            // socket loop and report failure back on this connection.
            let server = server.clone();
            let out_tx = out_tx.clone();
            tokio::spawn(async move {
                if let Err(e) = server.clone().power(action).await {
                    warn!(server = %server.uuid(), "power action failed: {}", e);
                    let _ = out_tx.send(error_message(e)).await;
                }
            });
        }

        "send console log" => {
            ensure_console_pump(server);

            match preamble(server).await {
                Ok(lines) => {
                    let _ = out_tx
                        .send(outgoing(
                            EventName::ServerLog.as_str(),
                            json!({ "server": server.uuid(), "previous": true, "lines": lines }),
                        ))
                        .await;
                }
                Err(e) => {
                    let _ = out_tx.send(error_message(e)).await;
                }
            }
        }

        other => {
            debug!("unknown websocket event: {}", other);
            let _ = out_tx.send(error_message("unknown event")).await;
        }
    }
}

pub async fn global_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_global_socket(socket, state))
}

async fn handle_global_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();

    let key = uuid::Uuid::new_v4().to_string();
    let mut events = state.manager.events().subscribe(&key);

    info!("global websocket connected");

    loop {
        tokio::select! {
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }

            event = events.recv() => {
                match event {
                    Some(event) => {
                        if matches!(
                            event.name,
                            EventName::ServerCreated | EventName::ServerDeleted
                        ) {
                            if let Ok(text) = serde_json::to_string(&event) {
                                if sink.send(Message::Text(text)).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    None => break,
                }
            }
        }
    }

    state.manager.events().unsubscribe(&key);
    info!("global websocket disconnected");
}
