use futures_util::{FutureExt, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use super::error::{Result, TwitchError};
use super::messages::{ServerMessage, Session};

pub const EVENTSUB_WS_URL: &str = "wss://eventsub.wss.twitch.tv/ws";

/// Default slack added on top of the server's keepalive interval before a
/// silent socket counts as dead
pub const KEEPALIVE_GRACE: Duration = Duration::from_secs(5);

/// How long a close frame may take before the socket is simply dropped
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Session connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Handshaking,
    Subscribing,
    Active,
    Closing,
    Reconnecting,
    Failed,
}

impl ConnectionState {
    /// Whether a caller-initiated connect may start from this state
    pub fn can_start_connect(&self) -> bool {
        matches!(self, ConnectionState::Idle | ConnectionState::Failed)
    }
}

/// Exponential backoff for self-initiated reconnects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// `min(base * 2^attempt, max)`
    pub fn delay(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

/// One EventSub WebSocket
pub struct Connection {
    url: String,
    stream: WsStream,
    keepalive_window: Option<Duration>,
}

impl Connection {
    pub async fn open(url: &str, timeout: Duration) -> Result<Self> {
        log::info!("Connecting to Twitch EventSub WebSocket at {}", url);

        let (stream, _) = tokio::time::timeout(timeout, connect_async(url))
            .await
            .map_err(|_| TwitchError::Transport(format!("Timed out connecting to {}", url)))?
            .map_err(|e| TwitchError::Transport(e.to_string()))?;

        log::debug!("WebSocket connection established");
        Ok(Self {
            url: url.to_string(),
            stream,
            keepalive_window: None,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Wait for `session_welcome`.
    ///
    /// Keepalives and pings before the welcome are tolerated; a close or a
    /// timeout fails the handshake.
    pub async fn handshake(
        &mut self,
        timeout: Duration,
        keepalive_grace: Duration,
    ) -> Result<Session> {
        let session = tokio::time::timeout(timeout, self.read_welcome())
            .await
            .map_err(|_| TwitchError::HandshakeTimeout(timeout))??;

        self.keepalive_window = session
            .keepalive_timeout_seconds
            .map(|secs| Duration::from_secs(secs) + keepalive_grace);

        log::info!("Session ID received: {}", session.id);
        Ok(session)
    }

    async fn read_welcome(&mut self) -> Result<Session> {
        while let Some(message) = self.stream.next().await {
            match message.map_err(|e| TwitchError::Transport(e.to_string()))? {
                Message::Text(text) => match ServerMessage::parse(&text) {
                    Ok(ServerMessage::Welcome(session)) => return Ok(session),
                    Ok(other) => log::debug!("Ignoring message before welcome: {:?}", other),
                    Err(e) => log::warn!("Unparseable message before welcome: {}", e),
                },
                Message::Ping(payload) => self.send(Message::Pong(payload)).await?,
                Message::Close(frame) => {
                    let reason = frame
                        .map(|f| format!("code={}, reason={}", u16::from(f.code), f.reason.as_str()))
                        .unwrap_or_else(|| "no close frame".to_string());
                    return Err(TwitchError::Transport(format!(
                        "Closed during handshake: {}",
                        reason
                    )));
                }
                _ => {}
            }
        }

        Err(TwitchError::Transport(
            "Connection closed before session_welcome".to_string(),
        ))
    }

    /// Next frame, `None` once the stream ends. Silence longer than the
    /// keepalive window is reported as a transport error.
    pub async fn next_message(&mut self) -> Result<Option<Message>> {
        let next = match self.keepalive_window {
            Some(window) => tokio::time::timeout(window, self.stream.next())
                .await
                .map_err(|_| {
                    TwitchError::Transport(format!("Keepalive timeout after {:?}", window))
                })?,
            None => self.stream.next().await,
        };

        next.transpose()
            .map_err(|e| TwitchError::Transport(e.to_string()))
    }

    pub async fn send(&mut self, message: Message) -> Result<()> {
        self.stream.send(message).await?;
        Ok(())
    }

    /// Text frames that already arrived and can be read without waiting
    pub fn drain_ready(&mut self) -> Vec<String> {
        let mut texts = Vec::new();
        while let Some(Some(Ok(message))) = self.stream.next().now_or_never() {
            if let Message::Text(text) = message {
                texts.push(text.as_str().to_owned());
            }
        }
        texts
    }

    /// Send a close frame, giving up quietly if the peer is gone
    pub async fn close(mut self) {
        match tokio::time::timeout(CLOSE_TIMEOUT, self.stream.close(None)).await {
            Ok(Ok(())) => log::debug!("Closed WebSocket to {}", self.url),
            Ok(Err(e)) => log::debug!("Error closing WebSocket to {}: {}", self.url, e),
            Err(_) => log::debug!("Timed out closing WebSocket to {}", self.url),
        }
    }
}
