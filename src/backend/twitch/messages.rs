use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};

use super::error::Result;

/// EventSub topics this client subscribes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    #[serde(rename = "channel.chat.message")]
    ChatMessage,
    #[serde(rename = "channel.follow")]
    Follow,
    #[serde(rename = "channel.subscribe")]
    Subscribe,
    #[serde(rename = "channel.cheer")]
    Cheer,
    #[serde(rename = "channel.raid")]
    Raid,
}

impl Topic {
    pub const ALL: [Topic; 5] = [
        Topic::ChatMessage,
        Topic::Follow,
        Topic::Subscribe,
        Topic::Cheer,
        Topic::Raid,
    ];

    /// Subscription type string used on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::ChatMessage => "channel.chat.message",
            Topic::Follow => "channel.follow",
            Topic::Subscribe => "channel.subscribe",
            Topic::Cheer => "channel.cheer",
            Topic::Raid => "channel.raid",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A subscription type string this client does not handle
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown topic: {0}")]
pub struct UnknownTopic(pub String);

impl FromStr for Topic {
    type Err = UnknownTopic;

    fn from_str(s: &str) -> std::result::Result<Self, UnknownTopic> {
        Topic::ALL
            .into_iter()
            .find(|topic| topic.as_str() == s)
            .ok_or_else(|| UnknownTopic(s.to_string()))
    }
}

/// WebSocket message received from Twitch EventSub
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EventSubMessage {
    pub metadata: Metadata,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Metadata {
    #[serde(default)]
    pub message_id: String,
    pub message_type: String,
    #[serde(default)]
    pub message_timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription_version: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Session {
    pub id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub keepalive_timeout_seconds: Option<u64>,
    #[serde(default)]
    pub reconnect_url: Option<String>,
    #[serde(default)]
    pub connected_at: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SubscriptionInfo {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default)]
    pub subscription_type: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Deserialize)]
struct SessionPayload {
    session: Session,
}

#[derive(Debug, Deserialize)]
struct RevocationPayload {
    subscription: SubscriptionInfo,
}

/// Server message classified by `metadata.message_type`
#[derive(Debug, Clone)]
pub enum ServerMessage {
    Welcome(Session),
    Notification {
        subscription_type: String,
        event: serde_json::Value,
    },
    Keepalive,
    Reconnect(Session),
    Revocation(SubscriptionInfo),
    Unknown(String),
}

impl ServerMessage {
    pub fn parse(text: &str) -> Result<Self> {
        let message: EventSubMessage = serde_json::from_str(text)?;
        message.classify()
    }
}

impl EventSubMessage {
    pub fn classify(self) -> Result<ServerMessage> {
        let EventSubMessage {
            metadata,
            mut payload,
        } = self;

        let message = match metadata.message_type.as_str() {
            "session_welcome" => {
                ServerMessage::Welcome(serde_json::from_value::<SessionPayload>(payload)?.session)
            }
            "notification" => {
                let subscription_type = match metadata.subscription_type {
                    Some(subscription_type) => subscription_type,
                    None => payload
                        .pointer("/subscription/type")
                        .and_then(|value| value.as_str())
                        .unwrap_or_default()
                        .to_string(),
                };
                let event = payload
                    .get_mut("event")
                    .map(serde_json::Value::take)
                    .unwrap_or(serde_json::Value::Null);
                ServerMessage::Notification {
                    subscription_type,
                    event,
                }
            }
            "session_keepalive" => ServerMessage::Keepalive,
            "session_reconnect" => {
                ServerMessage::Reconnect(serde_json::from_value::<SessionPayload>(payload)?.session)
            }
            "revocation" => ServerMessage::Revocation(
                serde_json::from_value::<RevocationPayload>(payload)?.subscription,
            ),
            other => ServerMessage::Unknown(other.to_string()),
        };

        Ok(message)
    }
}

/// Field deserializer that falls back to the default when the value has the
/// wrong shape, so one bad field does not discard the rest of the event
fn lenient<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(T::deserialize(value).unwrap_or_default())
}

/// Chat message event from channel.chat.message subscription
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ChatMessageEvent {
    #[serde(deserialize_with = "lenient")]
    pub chatter_user_id: String,
    #[serde(deserialize_with = "lenient")]
    pub chatter_user_login: String,
    #[serde(deserialize_with = "lenient")]
    pub chatter_user_name: String,
    #[serde(deserialize_with = "lenient")]
    pub message_id: String,
    #[serde(deserialize_with = "lenient")]
    pub message: ChatText,
    #[serde(deserialize_with = "lenient")]
    pub color: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub badges: Vec<Badge>,
    #[serde(deserialize_with = "lenient")]
    pub message_type: String,
    #[serde(deserialize_with = "lenient")]
    pub cheer: Option<Cheer>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ChatText {
    #[serde(deserialize_with = "lenient")]
    pub text: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Badge {
    #[serde(deserialize_with = "lenient")]
    pub set_id: String,
    #[serde(deserialize_with = "lenient")]
    pub id: String,
    #[serde(deserialize_with = "lenient")]
    pub info: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Cheer {
    #[serde(deserialize_with = "lenient")]
    pub bits: u64,
}

/// channel.follow (v2)
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct FollowEvent {
    #[serde(deserialize_with = "lenient")]
    pub user_id: String,
    #[serde(deserialize_with = "lenient")]
    pub user_login: String,
    #[serde(deserialize_with = "lenient")]
    pub user_name: String,
    #[serde(deserialize_with = "lenient")]
    pub followed_at: String,
}

/// channel.subscribe
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct SubscribeEvent {
    #[serde(deserialize_with = "lenient")]
    pub user_id: String,
    #[serde(deserialize_with = "lenient")]
    pub user_login: String,
    #[serde(deserialize_with = "lenient")]
    pub user_name: String,
    #[serde(deserialize_with = "lenient")]
    pub tier: String,
    #[serde(deserialize_with = "lenient")]
    pub is_gift: bool,
}

/// channel.cheer; user fields are null for anonymous cheers
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct CheerEvent {
    #[serde(deserialize_with = "lenient")]
    pub is_anonymous: bool,
    #[serde(deserialize_with = "lenient")]
    pub user_id: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub user_login: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub user_name: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub message: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub bits: Option<u64>,
}

/// channel.raid
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RaidEvent {
    #[serde(deserialize_with = "lenient")]
    pub from_broadcaster_user_id: String,
    #[serde(deserialize_with = "lenient")]
    pub from_broadcaster_user_login: String,
    #[serde(deserialize_with = "lenient")]
    pub from_broadcaster_user_name: String,
    #[serde(deserialize_with = "lenient")]
    pub viewers: u64,
}
