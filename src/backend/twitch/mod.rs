//! Twitch EventSub WebSocket integration module
//!
//! Connects to Twitch EventSub over WebSocket, subscribes to channel events
//! through the Helix API and hands notifications to registered handlers. It
//! supports:
//! - Credential storage with token refresh, validation and revocation
//! - Chat, follow, subscribe, cheer and raid subscriptions
//! - Server-initiated reconnects and automatic reconnection with backoff
//! - Normalizing raw events into the shape overlays render
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use overlay_relay::backend::twitch::{
//!     build_http_client, CredentialStore, EventSubClient, EventSubConfig, OAuthEndpoints,
//!     TokenManager, Topic,
//! };
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> overlay_relay::backend::twitch::Result<()> {
//!     let http = build_http_client(Duration::from_secs(30))?;
//!     let store = CredentialStore::new("credentials.json", "twitchConfig");
//!     let tokens = TokenManager::new(store, http.clone(), OAuthEndpoints::default());
//!     let client = EventSubClient::new(EventSubConfig::default(), tokens, http);
//!
//!     client.on(Topic::Cheer, |event| println!("cheer: {}", event));
//!     client.connect().await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     client.disconnect().await;
//!     Ok(())
//! }
//! ```

mod auth;
mod client;
mod credentials;
mod error;
mod eventsub;
mod handlers;
mod messages;
mod normalize;
mod websocket;

#[cfg(test)]
mod test_support;

// Re-export public types
pub use auth::{
    build_http_client, needs_refresh_at, token_expiry_buffer, OAuthEndpoints, TokenManager,
    TokenResponse, TokenValidation,
};
pub use client::{ConnectOutcome, EventSubClient, EventSubConfig};
pub use credentials::{default_token_lifetime, CredentialStore, Credentials, StoredCredentials};
pub use error::{Result, TwitchError};
pub use eventsub::{fixed_subscriptions, Subscription, SubscriptionSummary, EVENTSUB_API_URL};
pub use handlers::{EventHandler, HandlerId};
pub use messages::{
    Badge, ChatMessageEvent, CheerEvent, FollowEvent, RaidEvent, ServerMessage, Session,
    SubscribeEvent, Topic, UnknownTopic,
};
pub use normalize::{normalize, BadgeIcon, NormalizedEvent};
pub use websocket::{ConnectionState, ReconnectPolicy, EVENTSUB_WS_URL};
