//! Mapping from raw EventSub payloads to the events overlays render.
//!
//! Every function here is total: a payload that is missing fields, or does
//! not deserialize at all, still produces an event with default values.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::messages::{
    ChatMessageEvent, CheerEvent, FollowEvent, RaidEvent, SubscribeEvent, Topic,
};

const DEFAULT_CHAT_COLOR: &str = "#FFFFFF";
const ANONYMOUS: &str = "Anonymous";
const HIGHLIGHTED_MESSAGE_TYPE: &str = "channel_points_highlighted";

/// Small icon vocabulary overlays draw next to a chatter's name.
///
/// Travels as its glyph. Deserializing also accepts the Twitch `set_id`, so
/// hand-written test events can say `"moderator"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum BadgeIcon {
    Moderator,
    Subscriber,
    Vip,
    Broadcaster,
}

impl BadgeIcon {
    pub const ALL: [BadgeIcon; 4] = [
        BadgeIcon::Moderator,
        BadgeIcon::Subscriber,
        BadgeIcon::Vip,
        BadgeIcon::Broadcaster,
    ];

    /// Map a Twitch badge `set_id`; unrecognized badges have no icon
    pub fn from_set_id(set_id: &str) -> Option<Self> {
        match set_id {
            "moderator" => Some(BadgeIcon::Moderator),
            "subscriber" => Some(BadgeIcon::Subscriber),
            "vip" => Some(BadgeIcon::Vip),
            "broadcaster" => Some(BadgeIcon::Broadcaster),
            _ => None,
        }
    }

    pub fn emoji(&self) -> &'static str {
        match self {
            BadgeIcon::Moderator => "🛡️",
            BadgeIcon::Subscriber => "⭐",
            BadgeIcon::Vip => "💎",
            BadgeIcon::Broadcaster => "📺",
        }
    }
}

impl From<BadgeIcon> for String {
    fn from(icon: BadgeIcon) -> Self {
        icon.emoji().to_string()
    }
}

impl TryFrom<String> for BadgeIcon {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        BadgeIcon::ALL
            .into_iter()
            .find(|icon| icon.emoji() == value)
            .or_else(|| BadgeIcon::from_set_id(&value))
            .ok_or_else(|| format!("Unknown badge: {}", value))
    }
}

/// Events consumed by the overlay renderers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NormalizedEvent {
    ChatMessage {
        id: String,
        username: String,
        message: String,
        color: String,
        badges: Vec<BadgeIcon>,
        highlighted: bool,
        /// When the relay received the message
        #[serde(with = "chrono::serde::ts_milliseconds", default = "Utc::now")]
        timestamp: DateTime<Utc>,
    },
    Follow {
        username: String,
    },
    Subscribe {
        username: String,
        tier: String,
        is_gift: bool,
    },
    Cheer {
        username: String,
        amount: u64,
        message: String,
    },
    Raid {
        username: String,
        viewers: u64,
    },
}

impl NormalizedEvent {
    pub fn topic(&self) -> Topic {
        match self {
            NormalizedEvent::ChatMessage { .. } => Topic::ChatMessage,
            NormalizedEvent::Follow { .. } => Topic::Follow,
            NormalizedEvent::Subscribe { .. } => Topic::Subscribe,
            NormalizedEvent::Cheer { .. } => Topic::Cheer,
            NormalizedEvent::Raid { .. } => Topic::Raid,
        }
    }
}

/// Deserialize leniently, falling back to defaults for malformed payloads
fn parse_or_default<T: DeserializeOwned + Default>(topic: Topic, event: &serde_json::Value) -> T {
    match T::deserialize(event) {
        Ok(parsed) => parsed,
        Err(e) => {
            log::warn!("Malformed {} payload, using defaults: {}", topic, e);
            T::default()
        }
    }
}

pub fn normalize(topic: Topic, event: &serde_json::Value) -> NormalizedEvent {
    match topic {
        Topic::ChatMessage => normalize_chat_message(event),
        Topic::Follow => normalize_follow(event),
        Topic::Subscribe => normalize_subscribe(event),
        Topic::Cheer => normalize_cheer(event),
        Topic::Raid => normalize_raid(event),
    }
}

pub fn normalize_chat_message(event: &serde_json::Value) -> NormalizedEvent {
    normalize_chat_message_at(event, Utc::now())
}

fn normalize_chat_message_at(
    event: &serde_json::Value,
    received_at: DateTime<Utc>,
) -> NormalizedEvent {
    let chat: ChatMessageEvent = parse_or_default(Topic::ChatMessage, event);

    let cheered = chat.cheer.as_ref().is_some_and(|cheer| cheer.bits > 0);
    let highlighted = chat.message_type == HIGHLIGHTED_MESSAGE_TYPE || cheered;

    let badges = chat
        .badges
        .iter()
        .filter_map(|badge| BadgeIcon::from_set_id(&badge.set_id))
        .collect();

    let color = chat
        .color
        .filter(|color| !color.is_empty())
        .unwrap_or_else(|| DEFAULT_CHAT_COLOR.to_string());

    NormalizedEvent::ChatMessage {
        id: chat.message_id,
        username: chat.chatter_user_name,
        message: chat.message.text,
        color,
        badges,
        highlighted,
        timestamp: received_at,
    }
}

pub fn normalize_follow(event: &serde_json::Value) -> NormalizedEvent {
    let follow: FollowEvent = parse_or_default(Topic::Follow, event);
    NormalizedEvent::Follow {
        username: follow.user_name,
    }
}

pub fn normalize_subscribe(event: &serde_json::Value) -> NormalizedEvent {
    let subscribe: SubscribeEvent = parse_or_default(Topic::Subscribe, event);
    NormalizedEvent::Subscribe {
        username: subscribe.user_name,
        tier: subscribe.tier,
        is_gift: subscribe.is_gift,
    }
}

pub fn normalize_cheer(event: &serde_json::Value) -> NormalizedEvent {
    let cheer: CheerEvent = parse_or_default(Topic::Cheer, event);

    let username = if cheer.is_anonymous {
        None
    } else {
        cheer.user_name.filter(|name| !name.is_empty())
    };

    NormalizedEvent::Cheer {
        username: username.unwrap_or_else(|| ANONYMOUS.to_string()),
        amount: cheer.bits.unwrap_or(0),
        message: cheer.message.unwrap_or_default(),
    }
}

pub fn normalize_raid(event: &serde_json::Value) -> NormalizedEvent {
    let raid: RaidEvent = parse_or_default(Topic::Raid, event);
    NormalizedEvent::Raid {
        username: raid.from_broadcaster_user_name,
        viewers: raid.viewers,
    }
}
