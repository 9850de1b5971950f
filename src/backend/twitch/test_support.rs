//! Fakes shared by the client tests: a scripted EventSub socket server and
//! a Helix subscription endpoint.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tokio_tungstenite::tungstenite::Message;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use super::auth::{OAuthEndpoints, TokenManager};
use super::client::EventSubClient;
use super::credentials::{CredentialStore, Credentials};
use super::websocket::ConnectionState;

const WAIT_TIMEOUT: Duration = Duration::from_secs(5);
const HELIX_PATH: &str = "/helix/eventsub/subscriptions";

enum Command {
    Text(String),
    Drop,
}

#[derive(Default)]
struct FakeState {
    connections: AtomicUsize,
    current: Mutex<Option<mpsc::UnboundedSender<Command>>>,
}

#[derive(Clone, Copy)]
struct Behaviour {
    welcome: bool,
    /// Stop listening after this many connections
    limit: Option<usize>,
    /// Drop this many initial connections before their welcome
    drop_first: usize,
    keepalive_secs: u64,
}

impl Default for Behaviour {
    fn default() -> Self {
        Self {
            welcome: true,
            limit: None,
            drop_first: 0,
            keepalive_secs: 10,
        }
    }
}

/// EventSub stand-in. Connection `n` is welcomed with session id `S{n}`.
pub struct FakeEventSub {
    url: String,
    state: Arc<FakeState>,
}

impl FakeEventSub {
    pub async fn start() -> Self {
        Self::spawn("127.0.0.1:0".parse().unwrap(), Behaviour::default()).await
    }

    /// Listen on a fixed address, e.g. one a client already failed to reach
    pub async fn start_on(addr: SocketAddr) -> Self {
        Self::spawn(addr, Behaviour::default()).await
    }

    /// Accepts sockets but never sends a welcome
    pub async fn silent() -> Self {
        Self::spawn(
            "127.0.0.1:0".parse().unwrap(),
            Behaviour {
                welcome: false,
                ..Behaviour::default()
            },
        )
        .await
    }

    /// Stops listening after `limit` connections, so later opens are refused
    pub async fn accepting_only(limit: usize) -> Self {
        Self::spawn(
            "127.0.0.1:0".parse().unwrap(),
            Behaviour {
                limit: Some(limit),
                ..Behaviour::default()
            },
        )
        .await
    }

    /// Drops the first `count` sockets right after the upgrade, before any welcome
    pub async fn dropping_first(count: usize) -> Self {
        Self::spawn(
            "127.0.0.1:0".parse().unwrap(),
            Behaviour {
                drop_first: count,
                ..Behaviour::default()
            },
        )
        .await
    }

    /// Welcomes with a short keepalive interval and then never sends keepalives
    pub async fn with_keepalive(keepalive_secs: u64) -> Self {
        Self::spawn(
            "127.0.0.1:0".parse().unwrap(),
            Behaviour {
                keepalive_secs,
                ..Behaviour::default()
            },
        )
        .await
    }

    async fn spawn(addr: SocketAddr, behaviour: Behaviour) -> Self {
        let listener = TcpListener::bind(addr).await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let state = Arc::new(FakeState::default());

        let accept_state = Arc::clone(&state);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let n = accept_state.connections.fetch_add(1, Ordering::SeqCst) + 1;
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    continue;
                };
                if n <= behaviour.drop_first {
                    drop(ws);
                    continue;
                }

                let (tx, mut rx) = mpsc::unbounded_channel();
                *accept_state.current.lock().unwrap() = Some(tx);

                tokio::spawn(async move {
                    if behaviour.welcome {
                        let welcome = welcome_message(n, behaviour.keepalive_secs);
                        let _ = ws.send(Message::text(welcome)).await;
                    }
                    loop {
                        tokio::select! {
                            command = rx.recv() => match command {
                                Some(Command::Text(text)) => {
                                    let _ = ws.send(Message::text(text)).await;
                                }
                                Some(Command::Drop) | None => return,
                            },
                            incoming = ws.next() => match incoming {
                                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                                Some(Ok(_)) => {}
                            },
                        }
                    }
                });

                if behaviour.limit.is_some_and(|limit| n >= limit) {
                    return;
                }
            }
        });

        Self { url, state }
    }

    pub fn url(&self) -> String {
        self.url.clone()
    }

    pub fn connection_count(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Send a text frame on the most recent connection
    pub fn push(&self, text: String) {
        self.command(Command::Text(text));
    }

    /// Drop the most recent connection without a close frame
    pub fn drop_current(&self) {
        self.command(Command::Drop);
    }

    fn command(&self, command: Command) {
        if let Some(tx) = self.state.current.lock().unwrap().as_ref() {
            let _ = tx.send(command);
        }
    }
}

fn welcome_message(n: usize, keepalive_secs: u64) -> String {
    json!({
        "metadata": {
            "message_id": format!("welcome-{}", n),
            "message_type": "session_welcome",
            "message_timestamp": "2024-01-01T00:00:00Z"
        },
        "payload": {
            "session": {
                "id": format!("S{}", n),
                "status": "connected",
                "keepalive_timeout_seconds": keepalive_secs,
                "reconnect_url": null,
                "connected_at": "2024-01-01T00:00:00Z"
            }
        }
    })
    .to_string()
}

pub fn cheer_notification(event: &serde_json::Value) -> String {
    json!({
        "metadata": {
            "message_id": "notification-1",
            "message_type": "notification",
            "message_timestamp": "2024-01-01T00:00:01Z",
            "subscription_type": "channel.cheer",
            "subscription_version": "1"
        },
        "payload": {
            "subscription": {
                "id": "sub-1",
                "type": "channel.cheer",
                "version": "1",
                "status": "enabled",
                "condition": {"broadcaster_user_id": "42"}
            },
            "event": event
        }
    })
    .to_string()
}

pub fn reconnect_message(url: &str) -> String {
    json!({
        "metadata": {
            "message_id": "reconnect-1",
            "message_type": "session_reconnect",
            "message_timestamp": "2024-01-01T00:00:02Z"
        },
        "payload": {
            "session": {
                "id": "S1",
                "status": "reconnecting",
                "keepalive_timeout_seconds": null,
                "reconnect_url": url,
                "connected_at": "2024-01-01T00:00:00Z"
            }
        }
    })
    .to_string()
}

/// Helix subscription endpoint backed by wiremock
pub struct HelixMock {
    server: MockServer,
}

impl HelixMock {
    pub async fn accepting() -> Self {
        let server = MockServer::start().await;
        Self::mount_accepting(&server).await;
        Self { server }
    }

    /// Answers `status` for one subscription type and accepts the rest
    pub async fn rejecting(subscription_type: &str, status: u16) -> Self {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(HELIX_PATH))
            .and(body_partial_json(json!({ "type": subscription_type })))
            .respond_with(ResponseTemplate::new(status).set_body_json(json!({
                "error": "Forbidden",
                "status": status,
                "message": "subscription missing proper authorization"
            })))
            .with_priority(1)
            .mount(&server)
            .await;
        Self::mount_accepting(&server).await;
        Self { server }
    }

    /// Accepts every subscription, each answer held back by `delay`
    pub async fn delayed(delay: Duration) -> Self {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(HELIX_PATH))
            .respond_with(accepted().set_delay(delay))
            .mount(&server)
            .await;
        Self { server }
    }

    async fn mount_accepting(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path(HELIX_PATH))
            .respond_with(accepted())
            .mount(server)
            .await;
    }

    pub fn url(&self) -> String {
        format!("{}{}", self.server.uri(), HELIX_PATH)
    }

    /// Bodies of every subscription request, in arrival order
    pub async fn subscription_requests(&self) -> Vec<serde_json::Value> {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|request| request.url.path() == HELIX_PATH)
            .map(|request| request.body_json::<serde_json::Value>().unwrap())
            .collect()
    }

    /// Wait until at least `count` subscription requests arrived
    pub async fn wait_for_requests(&self, count: usize) -> Vec<serde_json::Value> {
        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        loop {
            let requests = self.subscription_requests().await;
            if requests.len() >= count {
                return requests;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {} subscription requests, got {}",
                count,
                requests.len()
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

fn accepted() -> ResponseTemplate {
    ResponseTemplate::new(202).set_body_json(json!({
        "data": [{"id": "sub-1", "status": "enabled"}]
    }))
}

/// Token manager over a temporary store holding credentials valid for an hour
pub fn stored_manager(moderator_id: Option<&str>) -> (tempfile::TempDir, TokenManager) {
    stored_manager_with(
        moderator_id,
        chrono::Duration::hours(1),
        OAuthEndpoints::default(),
    )
}

/// Like `stored_manager`, with the token's remaining lifetime and the OAuth
/// endpoints chosen by the caller. A negative lifetime stores an expired token.
pub fn stored_manager_with(
    moderator_id: Option<&str>,
    lifetime: chrono::Duration,
    endpoints: OAuthEndpoints,
) -> (tempfile::TempDir, TokenManager) {
    let dir = tempfile::tempdir().unwrap();
    let store = CredentialStore::new(dir.path().join("credentials.json"), "twitchConfig");
    store
        .save(
            &Credentials {
                client_id: "cid".to_string(),
                client_secret: Some("csecret".to_string()),
                access_token: "A1".to_string(),
                refresh_token: Some("R1".to_string()),
                broadcaster_id: "42".to_string(),
                moderator_id: moderator_id.map(str::to_string),
            },
            Some(lifetime),
        )
        .unwrap();

    let tokens = TokenManager::new(store, reqwest::Client::new(), endpoints);
    (dir, tokens)
}

pub async fn wait_for_state(client: &EventSubClient, state: ConnectionState) {
    let mut rx = client.watch_state();
    tokio::time::timeout(WAIT_TIMEOUT, rx.wait_for(|current| *current == state))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {:?}", state))
        .unwrap();
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for condition"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
