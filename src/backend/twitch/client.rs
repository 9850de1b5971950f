use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_tungstenite::tungstenite::Message;

use super::auth::TokenManager;
use super::credentials::Credentials;
use super::error::{Result, TwitchError};
use super::eventsub::{EventSubManager, SubscriptionSummary, EVENTSUB_API_URL};
use super::handlers::{EventHandler, HandlerId, HandlerRegistry};
use super::messages::{ServerMessage, Topic};
use super::normalize::{normalize, NormalizedEvent};
use super::websocket::{
    Connection, ConnectionState, ReconnectPolicy, EVENTSUB_WS_URL, KEEPALIVE_GRACE,
};

/// How long `disconnect` waits for the session task before aborting it
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for the EventSub client
#[derive(Debug, Clone)]
pub struct EventSubConfig {
    pub ws_url: String,
    pub helix_url: String,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Added to the server's keepalive interval before a silent socket is dropped
    pub keepalive_grace: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for EventSubConfig {
    fn default() -> Self {
        Self {
            ws_url: EVENTSUB_WS_URL.to_string(),
            helix_url: EVENTSUB_API_URL.to_string(),
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            keepalive_grace: KEEPALIVE_GRACE,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Result of a `connect` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// A new session was established
    Connected(SubscriptionSummary),
    /// A session was already active or being set up
    AlreadyConnected,
}

#[derive(Default)]
struct SessionSlot {
    session_id: Option<String>,
    reconnect_attempts: u32,
    /// Bumped by every `disconnect`; work started under an older value is stale
    generation: u64,
    task: Option<JoinHandle<()>>,
    shutdown: Option<oneshot::Sender<()>>,
}

enum SessionEnd {
    Shutdown,
    HandOff(String),
    Lost(TwitchError),
}

struct Shared {
    config: EventSubConfig,
    tokens: TokenManager,
    eventsub: EventSubManager,
    state: watch::Sender<ConnectionState>,
    slot: Mutex<SessionSlot>,
    handlers: Mutex<HandlerRegistry>,
}

/// Twitch EventSub WebSocket client.
///
/// Owns one socket at a time and the handler registry. Cloning yields
/// another handle to the same session.
#[derive(Clone)]
pub struct EventSubClient {
    shared: Arc<Shared>,
}

impl EventSubClient {
    pub fn new(config: EventSubConfig, tokens: TokenManager, http: reqwest::Client) -> Self {
        let eventsub = EventSubManager::new(http, config.helix_url.clone());
        let (state, _) = watch::channel(ConnectionState::Idle);

        Self {
            shared: Arc::new(Shared {
                config,
                tokens,
                eventsub,
                state,
                slot: Mutex::new(SessionSlot::default()),
                handlers: Mutex::new(HandlerRegistry::default()),
            }),
        }
    }

    /// Connect, complete the handshake and subscribe to every topic.
    ///
    /// Resolves immediately when a session is already active or being set
    /// up. Rejected subscriptions only show up in the returned summary.
    ///
    /// Every failure is returned to the caller. A transport failure (socket
    /// refused, or closed before the welcome) also starts the reconnect loop
    /// in the background. Missing credentials, an expired token that cannot
    /// be refreshed and a handshake timeout leave the client `Failed`.
    pub async fn connect(&self) -> Result<ConnectOutcome> {
        let shared = &self.shared;

        let generation = {
            let mut slot = shared.slot();
            let started = shared.state.send_if_modified(|state| {
                if state.can_start_connect() {
                    *state = ConnectionState::Connecting;
                    true
                } else {
                    false
                }
            });
            if !started {
                log::info!("Already connected or connecting");
                return Ok(ConnectOutcome::AlreadyConnected);
            }
            slot.reconnect_attempts = 0;
            slot.generation
        };

        log::info!("Connecting to Twitch EventSub...");
        let (connection, summary) = match shared.establish(generation).await {
            Ok(established) => established,
            Err(e) => {
                log::error!("Failed to connect to Twitch EventSub: {}", e);
                match e {
                    TwitchError::Transport(_) => shared.recover(generation),
                    _ => shared.fail(generation),
                }
                return Err(e);
            }
        };

        let stale = {
            let mut slot = shared.slot();
            if slot.generation != generation {
                Some(connection)
            } else {
                let (shutdown_tx, shutdown_rx) = oneshot::channel();
                slot.reconnect_attempts = 0;
                slot.shutdown = Some(shutdown_tx);
                slot.task = Some(tokio::spawn(run_session(
                    Arc::clone(shared),
                    Some(connection),
                    shutdown_rx,
                    generation,
                )));
                shared.set_state(ConnectionState::Active);
                None
            }
        };

        if let Some(connection) = stale {
            connection.close().await;
            return Err(TwitchError::Transport(
                "Disconnected while connecting".to_string(),
            ));
        }

        log::info!("EventSub setup complete - listening for channel events");
        Ok(ConnectOutcome::Connected(summary))
    }

    /// Close the socket, cancel pending reconnects and drop every handler.
    /// Safe to call in any state, any number of times.
    pub async fn disconnect(&self) {
        let (task, shutdown) = {
            let mut slot = self.shared.slot();
            slot.generation += 1;
            slot.session_id = None;
            slot.reconnect_attempts = 0;
            (slot.task.take(), slot.shutdown.take())
        };
        self.shared.handlers().clear();

        if let Some(mut task) = task {
            self.shared.set_state(ConnectionState::Closing);
            if let Some(shutdown) = shutdown {
                let _ = shutdown.send(());
            }
            if tokio::time::timeout(DISCONNECT_TIMEOUT, &mut task).await.is_err() {
                log::warn!("EventSub session task did not stop in time, aborting it");
                task.abort();
            }
            log::info!("Disconnected from Twitch EventSub");
        }

        self.shared.set_state(ConnectionState::Idle);
    }

    /// Register a handler for the raw events of `topic`
    pub fn on<F>(&self, topic: Topic, handler: F) -> HandlerId
    where
        F: Fn(&serde_json::Value) + Send + Sync + 'static,
    {
        let handler: EventHandler = Arc::new(handler);
        self.shared.handlers().on(topic, handler)
    }

    /// Remove a handler. Unknown ids are ignored.
    pub fn off(&self, topic: Topic, id: HandlerId) {
        if !self.shared.handlers().off(topic, id) {
            log::debug!("No handler {:?} registered for {}", id, topic);
        }
    }

    /// Register one handler receiving every topic in normalized form
    pub fn on_normalized<F>(&self, handler: F) -> Vec<(Topic, HandlerId)>
    where
        F: Fn(NormalizedEvent) + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        Topic::ALL
            .into_iter()
            .map(|topic| {
                let handler = Arc::clone(&handler);
                let id = self.on(topic, move |event| handler(normalize(topic, event)));
                (topic, id)
            })
            .collect()
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Receiver that observes every state change, for status indicators
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn session_id(&self) -> Option<String> {
        self.shared.slot().session_id.clone()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.slot().reconnect_attempts
    }

    pub fn handler_count(&self, topic: Topic) -> usize {
        self.shared.handlers().count(topic)
    }
}

impl Shared {
    fn slot(&self) -> MutexGuard<'_, SessionSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handlers(&self) -> MutexGuard<'_, HandlerRegistry> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            log::debug!("EventSub state {:?} -> {:?}", previous, state);
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.slot().generation == generation
    }

    /// Move to `state` unless the session was disconnected in the meantime
    fn transition(&self, generation: u64, state: ConnectionState) -> Result<()> {
        let slot = self.slot();
        if slot.generation != generation {
            return Err(TwitchError::Transport(
                "Session was disconnected".to_string(),
            ));
        }
        self.set_state(state);
        Ok(())
    }

    fn set_session_id(&self, generation: u64, session_id: Option<String>) -> Result<()> {
        let mut slot = self.slot();
        if slot.generation != generation {
            return Err(TwitchError::Transport(
                "Session was disconnected".to_string(),
            ));
        }
        slot.session_id = session_id;
        Ok(())
    }

    fn activate(&self, generation: u64) -> Result<()> {
        let mut slot = self.slot();
        if slot.generation != generation {
            return Err(TwitchError::Transport(
                "Session was disconnected".to_string(),
            ));
        }
        slot.reconnect_attempts = 0;
        self.set_state(ConnectionState::Active);
        Ok(())
    }

    fn fail(&self, generation: u64) {
        let mut slot = self.slot();
        if slot.generation == generation {
            slot.session_id = None;
            self.set_state(ConnectionState::Failed);
        }
    }

    /// Hand a failed first connect to the backoff loop, the same one that
    /// picks up a dropped session
    fn recover(self: &Arc<Self>, generation: u64) {
        let mut slot = self.slot();
        if slot.generation != generation {
            return;
        }

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        slot.session_id = None;
        slot.shutdown = Some(shutdown_tx);
        self.set_state(ConnectionState::Reconnecting);
        slot.task = Some(tokio::spawn(run_session(
            Arc::clone(self),
            None,
            shutdown_rx,
            generation,
        )));
    }

    /// Stored credentials, refreshed when due.
    ///
    /// A failed refresh is tolerated while the current token has not
    /// actually expired yet.
    async fn prepare_credentials(&self) -> Result<Credentials> {
        let stored = self.tokens.store().load().ok_or_else(|| {
            TwitchError::Configuration("No Twitch credentials stored".to_string())
        })?;
        stored.credentials.require_connectable()?;

        match self.tokens.ensure_valid(&stored.credentials).await {
            Ok(credentials) => Ok(credentials),
            Err(e) if stored.expires_at > Utc::now() => {
                log::warn!("{}; continuing with the current token until it expires", e);
                Ok(stored.credentials)
            }
            Err(e) => Err(e),
        }
    }

    /// Open a socket at the default URL, handshake and subscribe
    async fn establish(&self, generation: u64) -> Result<(Connection, SubscriptionSummary)> {
        self.transition(generation, ConnectionState::Connecting)?;
        let mut credentials = self.prepare_credentials().await?;

        let mut connection =
            Connection::open(&self.config.ws_url, self.config.connect_timeout).await?;

        self.transition(generation, ConnectionState::Handshaking)?;
        let session = connection
            .handshake(self.config.handshake_timeout, self.config.keepalive_grace)
            .await?;
        self.set_session_id(generation, Some(session.id.clone()))?;

        self.transition(generation, ConnectionState::Subscribing)?;
        let summary = self
            .eventsub
            .subscribe_all(&session.id, &self.tokens, &mut credentials, || {
                self.is_current(generation)
            })
            .await;

        Ok((connection, summary))
    }

    /// Forward a raw event to every handler of its topic, in registration order
    fn dispatch(&self, subscription_type: &str, event: &serde_json::Value) {
        let Ok(topic) = subscription_type.parse::<Topic>() else {
            log::debug!("Ignoring notification for unknown type: {}", subscription_type);
            return;
        };

        log::debug!("Event received: {}", topic);
        let handlers = self.handlers().handlers_for(topic);
        for handler in handlers {
            handler(event);
        }
    }

    /// Handle one text frame; returns the URL when the server asks for a reconnect
    fn handle_text(&self, generation: u64, text: &str) -> Option<String> {
        match ServerMessage::parse(text) {
            Ok(ServerMessage::Notification {
                subscription_type,
                event,
            }) => self.dispatch(&subscription_type, &event),
            Ok(ServerMessage::Welcome(session)) => {
                log::debug!("Welcome on a live session: {}", session.id);
                let _ = self.set_session_id(generation, Some(session.id));
            }
            Ok(ServerMessage::Keepalive) => log::trace!("Keepalive received"),
            Ok(ServerMessage::Reconnect(session)) => match session.reconnect_url {
                Some(url) => return Some(url),
                None => log::warn!("session_reconnect without a reconnect_url"),
            },
            Ok(ServerMessage::Revocation(subscription)) => log::warn!(
                "Subscription {} revoked by Twitch: {}",
                subscription.subscription_type,
                subscription.status
            ),
            Ok(ServerMessage::Unknown(kind)) => log::debug!("Unknown message type: {}", kind),
            Err(e) => log::error!("Error handling message: {}", e),
        }
        None
    }

    /// Read frames until the session ends one way or another
    async fn pump(
        &self,
        connection: &mut Connection,
        shutdown: &mut oneshot::Receiver<()>,
        generation: u64,
    ) -> SessionEnd {
        loop {
            let message = tokio::select! {
                _ = &mut *shutdown => return SessionEnd::Shutdown,
                message = connection.next_message() => message,
            };

            match message {
                Ok(Some(Message::Text(text))) => {
                    if let Some(url) = self.handle_text(generation, &text) {
                        return SessionEnd::HandOff(url);
                    }
                }
                Ok(Some(Message::Ping(payload))) => {
                    if let Err(e) = connection.send(Message::Pong(payload)).await {
                        return SessionEnd::Lost(e);
                    }
                }
                Ok(Some(Message::Close(frame))) => {
                    let code = frame.as_ref().map(|f| u16::from(f.code)).unwrap_or(1000);
                    let reason = frame
                        .as_ref()
                        .map(|f| f.reason.as_str().to_string())
                        .unwrap_or_else(|| "Unknown".to_string());

                    log::warn!("WebSocket closed: code={}, reason={}", code, reason);
                    if (4000..=4007).contains(&code) {
                        log::error!("Twitch close code {}: {}", code, reason);
                    }
                    return SessionEnd::Lost(TwitchError::Transport(format!(
                        "Closed by server: code={}, reason={}",
                        code, reason
                    )));
                }
                Ok(Some(_)) => {}
                Ok(None) => {
                    return SessionEnd::Lost(TwitchError::Transport(
                        "WebSocket stream ended".to_string(),
                    ))
                }
                Err(e) => return SessionEnd::Lost(e),
            }
        }
    }

    /// Follow a server-requested reconnect. Subscriptions carry over, so
    /// nothing is re-subscribed. `Ok(None)` means shutdown was requested.
    async fn hand_off(
        &self,
        url: &str,
        shutdown: &mut oneshot::Receiver<()>,
        generation: u64,
    ) -> Result<Option<Connection>> {
        self.transition(generation, ConnectionState::Reconnecting)?;
        log::warn!("Server requested reconnect to: {}", url);

        let opened = tokio::select! {
            _ = &mut *shutdown => return Ok(None),
            opened = async {
                let mut connection = Connection::open(url, self.config.connect_timeout).await?;
                let session = connection
                    .handshake(self.config.handshake_timeout, self.config.keepalive_grace)
                    .await?;
                Ok::<_, TwitchError>((connection, session))
            } => opened,
        };

        let (connection, session) = opened?;
        self.set_session_id(generation, Some(session.id))?;
        self.activate(generation)?;
        log::info!("Reconnected to {} without re-subscribing", connection.url());
        Ok(Some(connection))
    }

    /// Self-initiated reconnect with exponential backoff. `None` when the
    /// budget is exhausted or shutdown was requested.
    async fn reconnect_with_backoff(
        &self,
        shutdown: &mut oneshot::Receiver<()>,
        generation: u64,
    ) -> Option<Connection> {
        let policy = self.config.reconnect;

        loop {
            let attempt = {
                let mut slot = self.slot();
                if slot.generation != generation {
                    return None;
                }
                if slot.reconnect_attempts >= policy.max_attempts {
                    slot.session_id = None;
                    self.set_state(ConnectionState::Failed);
                    None
                } else {
                    slot.reconnect_attempts += 1;
                    Some(slot.reconnect_attempts)
                }
            };

            let Some(attempt) = attempt else {
                log::error!("{}", TwitchError::ReconnectExhausted(policy.max_attempts));
                return None;
            };

            if self
                .transition(generation, ConnectionState::Reconnecting)
                .is_err()
            {
                return None;
            }

            let delay = policy.delay(attempt);
            log::warn!(
                "Reconnecting in {:?}... (attempt {}/{})",
                delay,
                attempt,
                policy.max_attempts
            );

            let result = tokio::select! {
                _ = &mut *shutdown => return None,
                result = async {
                    tokio::time::sleep(delay).await;
                    self.establish(generation).await
                } => result,
            };

            match result {
                Ok((connection, summary)) => {
                    if self.activate(generation).is_err() {
                        connection.close().await;
                        return None;
                    }
                    log::info!(
                        "Reconnected to EventSub: {} subscriptions active, {} failed",
                        summary.succeeded.len(),
                        summary.failed.len()
                    );
                    return Some(connection);
                }
                Err(e) => {
                    log::error!("Reconnection failed: {}", e);
                    let _ = self.set_session_id(generation, None);
                }
            }
        }
    }
}

/// Owns the live socket: reads frames in arrival order and drives reconnects.
/// Without a connection it starts in the backoff loop.
async fn run_session(
    shared: Arc<Shared>,
    connection: Option<Connection>,
    mut shutdown: oneshot::Receiver<()>,
    generation: u64,
) {
    let mut connection = match connection {
        Some(connection) => connection,
        None => match shared.reconnect_with_backoff(&mut shutdown, generation).await {
            Some(connection) => connection,
            None => return,
        },
    };

    loop {
        let reason = match shared.pump(&mut connection, &mut shutdown, generation).await {
            SessionEnd::Shutdown => {
                connection.close().await;
                return;
            }
            SessionEnd::Lost(e) => e,
            SessionEnd::HandOff(url) => {
                match shared.hand_off(&url, &mut shutdown, generation).await {
                    Ok(Some(next)) => {
                        let mut previous = std::mem::replace(&mut connection, next);
                        for text in previous.drain_ready() {
                            shared.handle_text(generation, &text);
                        }
                        previous.close().await;
                        continue;
                    }
                    Ok(None) => {
                        connection.close().await;
                        return;
                    }
                    Err(e) => {
                        log::error!("Failed to reconnect to new URL: {}", e);
                        e
                    }
                }
            }
        };

        log::warn!("EventSub connection lost: {}", reason);
        drop(connection);
        if shared.set_session_id(generation, None).is_err() {
            return;
        }

        match shared.reconnect_with_backoff(&mut shutdown, generation).await {
            Some(next) => connection = next,
            None => return,
        }
    }
}
