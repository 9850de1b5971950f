use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{sink::SinkExt, stream::StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};

use crate::backend::twitch::{ConnectionState, NormalizedEvent};

/// Maximum number of messages that can be buffered in the broadcast channel
const CHANNEL_CAPACITY: usize = 100;

/// Shared state for overlay WebSocket connections
#[derive(Clone)]
pub struct OverlayState {
    /// Broadcast channel for sending messages to all connected overlays
    tx: broadcast::Sender<OverlayMessage>,
    /// Counter for connected clients
    client_count: Arc<RwLock<usize>>,
    /// Last known EventSub connection state, replayed to new clients
    status: Arc<RwLock<ConnectionState>>,
}

impl Default for OverlayState {
    fn default() -> Self {
        Self::new()
    }
}

impl OverlayState {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            client_count: Arc::new(RwLock::new(0)),
            status: Arc::new(RwLock::new(ConnectionState::Idle)),
        }
    }

    /// Send a message to all connected overlay clients
    pub fn broadcast(&self, message: OverlayMessage) {
        if self.tx.send(message).is_err() {
            log::trace!("No overlay clients connected, message dropped");
        }
    }

    pub fn broadcast_event(&self, event: NormalizedEvent) {
        self.broadcast(OverlayMessage::Event { event });
    }

    /// Record the EventSub connection state and tell every overlay
    pub async fn set_status(&self, state: ConnectionState) {
        *self.status.write().await = state;
        self.broadcast(OverlayMessage::ConnectionStatus { state });
    }

    pub async fn status(&self) -> ConnectionState {
        *self.status.read().await
    }

    /// Get the number of connected clients
    pub async fn client_count(&self) -> usize {
        *self.client_count.read().await
    }

    fn subscribe(&self) -> broadcast::Receiver<OverlayMessage> {
        self.tx.subscribe()
    }
}

/// Messages pushed to overlay clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OverlayMessage {
    /// A normalized channel event
    Event { event: NormalizedEvent },
    /// EventSub connection state, for status indicators
    ConnectionStatus { state: ConnectionState },
    /// Ping to keep connection alive
    Ping,
}

/// Messages that can be received from the overlay client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OverlayClientMessage {
    /// Ask for the current connection state
    RequestStatus,
    /// Rebroadcast a hand-made event, used by the alert and chat testers
    TestEvent { event: NormalizedEvent },
}

/// WebSocket handler for overlay connections
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<OverlayState>,
) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Handle a single WebSocket connection
async fn handle_socket(socket: WebSocket, state: OverlayState) {
    {
        let mut count = state.client_count.write().await;
        *count += 1;
        log::info!("Overlay client connected. Total clients: {}", *count);
    }

    let (mut sender, mut receiver) = socket.split();
    let mut events = BroadcastStream::new(state.subscribe());

    // Replies meant for this client only
    let (reply_tx, mut replies) = mpsc::unbounded_channel();
    let _ = reply_tx.send(OverlayMessage::ConnectionStatus {
        state: state.status().await,
    });

    let mut send_task = tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                Some(reply) = replies.recv() => reply,
                next = events.next() => match next {
                    Some(Ok(message)) => message,
                    Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                        log::warn!("Overlay client lagged, skipped {} messages", skipped);
                        continue;
                    }
                    None => break,
                },
            };

            let json = match serde_json::to_string(&message) {
                Ok(json) => json,
                Err(e) => {
                    log::error!("Failed to serialize overlay message: {}", e);
                    continue;
                }
            };

            if sender.send(Message::Text(json)).await.is_err() {
                log::debug!("Client disconnected during send");
                break;
            }
        }
    });

    let state_clone = state.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<OverlayClientMessage>(&text) {
                    Ok(OverlayClientMessage::RequestStatus) => {
                        let state = state_clone.status().await;
                        if reply_tx
                            .send(OverlayMessage::ConnectionStatus { state })
                            .is_err()
                        {
                            break;
                        }
                    }
                    Ok(OverlayClientMessage::TestEvent { event }) => {
                        log::info!("Overlay test event: {:?}", event.topic());
                        state_clone.broadcast_event(event);
                    }
                    Err(e) => {
                        log::warn!("Failed to parse overlay client message: {}", e);
                    }
                },
                Message::Close(_) => {
                    log::debug!("Client sent close message");
                    break;
                }
                Message::Ping(_) => {
                    log::trace!("Received ping from client");
                    // Pong is automatically sent by axum
                }
                _ => {}
            }
        }
    });

    // Either task finishing means the connection is gone
    tokio::select! {
        _ = (&mut send_task) => {
            recv_task.abort();
        }
        _ = (&mut recv_task) => {
            send_task.abort();
        }
    }

    {
        let mut count = state.client_count.write().await;
        *count = count.saturating_sub(1);
        log::info!("Overlay client disconnected. Total clients: {}", *count);
    }
}
